use core::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Helo,
    Ehlo,
    MailFrom,
    RcptTo,
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy,
    Expn,
    Auth,
    StartTls,
    Unknown,
}

impl Verb {
    /// Whether this verb opens or continues the conversation with a greeting
    #[must_use]
    pub const fn is_hello(self) -> bool {
        matches!(self, Self::Helo | Self::Ehlo)
    }
}

impl From<&str> for Verb {
    fn from(verb: &str) -> Self {
        match verb.to_ascii_lowercase().as_str() {
            "helo" => Self::Helo,
            "ehlo" => Self::Ehlo,
            "mail" => Self::MailFrom,
            "rcpt" => Self::RcptTo,
            "data" => Self::Data,
            "rset" => Self::Rset,
            "noop" => Self::Noop,
            "quit" => Self::Quit,
            "vrfy" => Self::Vrfy,
            "expn" => Self::Expn,
            "auth" => Self::Auth,
            "starttls" => Self::StartTls,
            _ => Self::Unknown,
        }
    }
}

impl Display for Verb {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Helo => "HELO",
            Self::Ehlo => "EHLO",
            Self::MailFrom => "MAIL",
            Self::RcptTo => "RCPT",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
            Self::Vrfy => "VRFY",
            Self::Expn => "EXPN",
            Self::Auth => "AUTH",
            Self::StartTls => "STARTTLS",
            Self::Unknown => "UNKNOWN",
        })
    }
}

/// A command line split on spaces, empty parts dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    /// Everything after the verb
    pub args: Vec<String>,
}

impl Command {
    /// The path following `prefix` (`from:` or `to:`) in the first argument,
    /// or the next argument when the prefix stands alone. Returns the path and
    /// the arguments after it.
    #[must_use]
    pub fn path_argument(&self, prefix: &str) -> Option<(&str, &[String])> {
        let first = self.args.first()?;
        if !first
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        {
            return None;
        }

        let inline = &first[prefix.len()..];
        if inline.is_empty() {
            let path = self.args.get(1)?;
            Some((path.as_str(), &self.args[2..]))
        } else {
            Some((inline, &self.args[1..]))
        }
    }
}

impl From<&str> for Command {
    fn from(line: &str) -> Self {
        let mut parts = line
            .trim_end_matches(['\r', '\n'])
            .split(' ')
            .filter(|part| !part.is_empty());

        Self {
            verb: parts.next().map_or(Verb::Unknown, Verb::from),
            args: parts.map(str::to_string).collect(),
        }
    }
}

impl From<&[u8]> for Command {
    fn from(line: &[u8]) -> Self {
        Self::from(String::from_utf8_lossy(line).as_ref())
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.verb)?;
        for arg in &self.args {
            write!(fmt, " {arg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn verbs_are_case_insensitive() {
        for verb in ["mail", "MAIL", "Mail", "mAiL"] {
            assert_eq!(Verb::from(verb), Verb::MailFrom);
        }
        assert_eq!(Verb::from("STARTTLS"), Verb::StartTls);
        assert_eq!(Verb::from("HELP"), Verb::Unknown);
    }

    #[test]
    fn empty_parts_are_dropped() {
        let command = Command::from(&b"MAIL  FROM:<a@b.c>   SIZE=10\r\n"[..]);
        assert_eq!(command.verb, Verb::MailFrom);
        assert_eq!(command.args, vec!["FROM:<a@b.c>", "SIZE=10"]);
        assert_eq!(command.to_string(), "MAIL FROM:<a@b.c> SIZE=10");

        assert_eq!(Command::from("\r\n").verb, Verb::Unknown);
    }

    #[test]
    fn inline_and_separate_paths() {
        let inline = Command::from("MAIL FROM:<a@b.c> SIZE=10");
        assert_eq!(
            inline.path_argument("from:"),
            Some(("<a@b.c>", &["SIZE=10".to_string()][..]))
        );

        let separate = Command::from("rcpt to: <a@b.c>");
        assert_eq!(separate.path_argument("to:"), Some(("<a@b.c>", &[][..])));

        assert_eq!(Command::from("RCPT TO:").path_argument("to:"), None);
        assert_eq!(Command::from("RCPT <a@b.c>").path_argument("to:"), None);
        assert_eq!(Command::from("RCPT").path_argument("to:"), None);
    }
}
