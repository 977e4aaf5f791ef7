//! Turns track paths into display and sort strings, one regex rewrite rule
//! at a time. The first rule whose part and context match and whose regex
//! captures wins.

use color_eyre::Result;
use color_eyre::eyre::Context;
use regex::Regex;

use crate::config::NamepartSpec;

pub struct NameParts {
    rules: Vec<Rule>,
}

struct Rule {
    part: String,
    context: String,
    rx: Regex,
    replacement: String,
}

impl NameParts {
    pub fn new(specs: &[NamepartSpec]) -> Result<NameParts> {
        let rules = specs
            .iter()
            .map(|spec| {
                Ok(Rule {
                    part: spec.part.clone(),
                    context: spec.context.clone(),
                    rx: Regex::new(&spec.regexp)
                        .wrap_err_with(|| format!("bad namepart regexp {:?}", spec.regexp))?,
                    replacement: spec.replacement.clone(),
                })
            })
            .collect::<Result<_>>()?;
        Ok(NameParts { rules })
    }

    /// Compute `part` (artist/album/title/ext) of `track` in `context`
    /// (display/sort). Empty when no rule matches; the ext part in
    /// particular is legitimately empty for extensionless tracks.
    pub fn part(&self, track: &str, context: &str, part: &str) -> String {
        for rule in &self.rules {
            if rule.part != part || (rule.context != "*" && rule.context != context) {
                continue;
            }
            if let Some(caps) = rule.rx.captures(track) {
                let mut out = String::new();
                caps.expand(&rule.replacement, &mut out);
                return out;
            }
        }
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn defaults() -> NameParts {
        NameParts::new(&NamepartSpec::defaults()).unwrap()
    }

    #[test]
    fn default_rules_carve_up_paths() {
        let np = defaults();
        let track = "/srv/music/Pink Floyd/Meddle/05 Seamus.ogg";
        assert_eq!(np.part(track, "display", "artist"), "Pink Floyd");
        assert_eq!(np.part(track, "display", "album"), "Meddle");
        assert_eq!(np.part(track, "display", "title"), "Seamus");
        assert_eq!(np.part(track, "display", "ext"), ".ogg");
    }

    #[test]
    fn title_without_track_number() {
        let np = defaults();
        assert_eq!(np.part("/m/A/B/Seamus.ogg", "display", "title"), "Seamus");
    }

    #[test]
    fn unknown_part_is_empty() {
        assert_eq!(defaults().part("/m/a.ogg", "display", "composer"), "");
    }

    #[test]
    fn context_filter_applies() {
        let np = NameParts::new(&[NamepartSpec {
            part: "title".into(),
            regexp: "([^/]+)$".into(),
            replacement: "$1".into(),
            context: "sort".into(),
        }])
        .unwrap();
        assert_eq!(np.part("/m/x", "sort", "title"), "x");
        assert_eq!(np.part("/m/x", "display", "title"), "");
    }
}
