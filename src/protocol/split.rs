//! Splits request lines into arguments and quotes them back.
//!
//! An argument is either a bare word or a quoted string. Inside quotes only
//! `\\`, `\"`, `\'` and `\n` are valid escapes. Both quote characters work,
//! symmetrically. An empty argument must be quoted, so `split` never yields
//! phantom empties and `quote` always round-trips.

use color_eyre::eyre::{Result, eyre};

peg::parser! {
grammar request() for str {
    pub rule line() -> Vec<String>
        = _* ts:(token() ** (_+)) _* { ts }

    rule token() -> String
        = quoted('"') / quoted('\'') / bare()

    rule bare() -> String
        = s:$([^ ' ' | '\t' | '"' | '\'' | '\\']+) { s.to_owned() }

    rule quoted(q: char) -> String
        = [c if c == q] cs:(qchar(q)*) [c if c == q] { cs.into_iter().collect() }

    rule qchar(q: char) -> char
        = "\\" c:escape() { c }
        / c:[c if c != q && c != '\\'] { c }

    rule escape() -> char
        = "\\" { '\\' }
        / "\"" { '"' }
        / "'" { '\'' }
        / "n" { '\n' }

    rule _() = quiet!{[' ' | '\t']}
}
}

/// Tokenize one request (or marshalled) line.
///
/// Errors on stray backslashes, unterminated quotes and trailing garbage;
/// the caller turns that into a 500.
pub fn split(line: &str) -> Result<Vec<String>> {
    request::line(line).map_err(|e| eyre!("malformed line at column {}", e.location.column))
}

/// Quote a single argument for the wire. Bare words pass through untouched.
pub fn quote(s: &str) -> String {
    let plain = !s.is_empty()
        && !s
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\'' || c == '\\');
    if plain {
        return s.to_owned();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Quote a whole argument list, space separated.
pub fn quote_args<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn splits_bare_words() {
        assert_eq!(split("play some/track.ogg").unwrap(), ["play", "some/track.ogg"]);
        assert_eq!(split("  nop  ").unwrap(), ["nop"]);
        assert_eq!(split("").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn splits_quoted_strings() {
        assert_eq!(
            split(r#"play "a b c.flac""#).unwrap(),
            ["play", "a b c.flac"]
        );
        assert_eq!(split(r#"set x "" y"#).unwrap(), ["set", "x", "", "y"]);
        assert_eq!(split(r#"a 'b c' d"#).unwrap(), ["a", "b c", "d"]);
        assert_eq!(split(r#""esc \" \\ \n""#).unwrap(), ["esc \" \\ \n"]);
        // the other quote char needs no escape inside
        assert_eq!(split(r#""it's""#).unwrap(), ["it's"]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(split(r#""unterminated"#).is_err());
        assert!(split(r"stray\backslash").is_err());
        assert!(split(r#"bad"quote"#).is_err());
    }

    #[test]
    fn quote_round_trips() {
        for s in [
            "",
            "plain",
            "two words",
            "tab\there",
            "new\nline",
            r#"qu"ote"#,
            r"back\slash",
            "it's",
            "北上のススメ",
        ] {
            let quoted = quote(s);
            assert_eq!(split(&quoted).unwrap(), [s], "quoted form: {quoted}");
        }
    }

    #[test]
    fn quote_leaves_bare_words_alone() {
        assert_eq!(quote("some/track.ogg"), "some/track.ogg");
        assert_eq!(quote(""), "\"\"");
        assert_eq!(quote_args(&["a b", "c"]), "\"a b\" c");
    }
}
