//! The line-oriented wire protocol: request tokenizing, response framing and
//! the couple of small codecs (hex challenges, base-N stamps) the protocol
//! needs.
//!
//! Requests are a command word plus arguments in quoted-string form, one per
//! line. Responses are a three digit code plus a message, optionally followed
//! by a dot-stuffed body or (for `log`) an endless event stream.

pub mod basen;
pub mod split;

pub use split::{quote, quote_args, split};

/// Protocol revision advertised in the greeting banner.
pub const PROTOCOL_VERSION: u32 = 2;

/// Seconds of idleness after which a log stream gets a keepalive byte.
pub const LOG_PROD_INTERVAL: u64 = 10;

/// Everything a command handler can answer with.
///
/// The wire shape (single line, dot-stuffed body, event stream) is decided by
/// the variant, not by digit arithmetic on the code; the codes themselves are
/// fixed by the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `200 OK`
    Ok,
    /// `200` with arguments in quoted form.
    Args(Vec<String>),
    /// `200` with a preformatted message.
    Raw(String),
    /// `230 OK`; the connection is now authenticated.
    Authenticated,
    /// `231` followed by a dot-stuffed body.
    Body(Vec<String>),
    /// `241`; the connection switches to streaming the event log.
    LogFollows,
    /// `252` with a preformatted payload (a marshalled entry or an id).
    Playing(String),
    /// `259`; success but there is no playing track to report.
    NothingPlaying,
    /// `500` malformed line, unknown command or bad arity.
    Syntax(String),
    /// `530` bad credentials, bad cookie, or auth required.
    AuthFailed(String),
    /// `550` no such track/user/id.
    NotFound(String),
    /// `550` the target exists but the operation cannot apply to it.
    Precondition(String),
    /// `551` insufficient rights.
    Denied(String),
}

impl Response {
    pub fn code(&self) -> u16 {
        use Response::*;
        match self {
            Ok | Args(_) | Raw(_) => 200,
            Authenticated => 230,
            Body(_) => 231,
            LogFollows => 241,
            Playing(_) => 252,
            NothingPlaying => 259,
            Syntax(_) => 500,
            AuthFailed(_) => 530,
            NotFound(_) | Precondition(_) => 550,
            Denied(_) => 551,
        }
    }

    pub fn is_error(&self) -> bool {
        self.code() >= 400
    }

    /// Render the complete response, body included, ready to write out.
    /// Lines end `\r\n`; body lines starting with `.` are dot-stuffed and the
    /// body ends with a lone `.`.
    pub fn render(&self) -> String {
        use Response::*;
        let code = self.code();
        match self {
            Ok | Authenticated => format!("{code} OK\r\n"),
            Args(args) => format!("{code} {}\r\n", quote_args(args)),
            Raw(text) | Playing(text) => format!("{code} {text}\r\n"),
            Body(lines) => {
                let mut out = format!("{code} OK\r\n");
                for line in lines {
                    if line.starts_with('.') {
                        out.push('.');
                    }
                    out.push_str(line);
                    out.push_str("\r\n");
                }
                out.push_str(".\r\n");
                out
            }
            LogFollows => format!("{code} OK\r\n"),
            NothingPlaying => format!("{code} nothing playing\r\n"),
            Syntax(msg) | AuthFailed(msg) | NotFound(msg) | Denied(msg) => {
                format!("{code} {msg}\r\n")
            }
            Precondition(msg) => format!("{code} cannot {msg}\r\n"),
        }
    }
}

/// The banner sent on connect, before any command.
pub fn greeting(algorithm: &str, challenge: &[u8]) -> String {
    format!(
        "231 {PROTOCOL_VERSION} {algorithm} {}\r\n",
        hex::encode(challenge)
    )
}

/// Strip dot-stuffing from one received body line. The caller has already
/// checked the line is not the lone `.` sentinel.
pub fn unstuff(line: &str) -> &str {
    line.strip_prefix('.').unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn render_single_line() {
        assert_eq!(Response::Ok.render(), "200 OK\r\n");
        assert_eq!(
            Response::Args(vec!["two words".into()]).render(),
            "200 \"two words\"\r\n"
        );
        assert_eq!(
            Response::Denied("permission denied".to_string()).render(),
            "551 permission denied\r\n"
        );
        assert_eq!(Response::NothingPlaying.render(), "259 nothing playing\r\n");
    }

    #[test]
    fn render_body_is_dot_stuffed() {
        let r = Response::Body(vec![
            "plain".to_string(),
            ".leading dot".to_string(),
            String::new(),
        ]);
        assert_eq!(r.render(), "231 OK\r\nplain\r\n..leading dot\r\n\r\n.\r\n");
    }

    #[test]
    fn unstuff_strips_one_dot() {
        assert_eq!(unstuff("..x"), ".x");
        assert_eq!(unstuff("x"), "x");
    }

    #[test]
    fn greeting_shape() {
        let g = greeting("sha256", &[0xab, 0xcd]);
        assert_eq!(g, "231 2 sha256 abcd\r\n");
    }
}
