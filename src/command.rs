//! Command lines split into keyword and payload

use bytes::Bytes;
use std::fmt;

/// A command received in command mode.
///
/// The keyword is the first space- or tab-delimited token, uppercased.
/// The payload is everything after that single separator, untouched.
///
/// ```
/// use rai::Command;
///
/// let cmd = Command::parse("mail FROM:<a@b>".into());
/// assert_eq!(cmd.keyword(), "MAIL");
/// assert_eq!(cmd.payload_str(), "FROM:<a@b>");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    keyword: String,
    payload: Bytes,
}

impl Command {
    /// Split a raw line (terminator already removed).
    #[must_use]
    pub fn parse(line: Bytes) -> Self {
        match line.iter().position(|b| *b == b' ' || *b == b'\t') {
            Some(sep) => Self {
                keyword: keyword(&line[..sep]),
                payload: line.slice(sep + 1..),
            },
            None => Self {
                keyword: keyword(&line),
                payload: Bytes::new(),
            },
        }
    }

    #[must_use]
    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The payload as text, replacing invalid UTF-8.
    #[must_use]
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Whether the line was empty (a bare CRLF).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keyword.is_empty() && self.payload.is_empty()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            f.write_str(&self.keyword)
        } else {
            write!(f, "{} {}", self.keyword, String::from_utf8_lossy(&self.payload))
        }
    }
}

fn keyword(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_only() {
        let cmd = Command::parse("status".into());
        assert_eq!(cmd.keyword(), "STATUS");
        assert!(cmd.payload().is_empty());
    }

    #[test]
    fn keyword_and_payload() {
        let cmd = Command::parse("MAIL TO:".into());
        assert_eq!(cmd.keyword(), "MAIL");
        assert_eq!(cmd.payload_str(), "TO:");
    }

    #[test]
    fn payload_keeps_extra_whitespace() {
        let cmd = Command::parse("RCPT  TO: x ".into());
        assert_eq!(cmd.keyword(), "RCPT");
        assert_eq!(cmd.payload_str(), " TO: x ");
    }

    #[test]
    fn tab_separates_keyword() {
        let cmd = Command::parse("user\tbob".into());
        assert_eq!(cmd.keyword(), "USER");
        assert_eq!(cmd.payload_str(), "bob");
    }

    #[test]
    fn empty_line() {
        let cmd = Command::parse(Bytes::new());
        assert!(cmd.is_empty());
        assert_eq!(cmd.keyword(), "");
    }

    #[test]
    fn display_rejoins_parts() {
        assert_eq!(Command::parse("ehlo host".into()).to_string(), "EHLO host");
        assert_eq!(Command::parse("quit".into()).to_string(), "QUIT");
    }
}
