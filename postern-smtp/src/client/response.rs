//! SMTP reply parsing.

use super::error::{ClientError, ClientResult};

/// A complete reply, possibly spread over several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    /// The text of each line, without the code and separator
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// All lines joined with a space
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join(" ")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 400
    }

    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500
    }

    /// Turns anything other than `expected` into a [`ClientError::Smtp`]
    pub fn expect_code(self, expected: u16) -> ClientResult<Self> {
        if self.code == expected {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }

    #[must_use]
    pub fn into_error(self) -> ClientError {
        ClientError::Smtp {
            code: self.code,
            message: self.message(),
        }
    }

    /// Extracts the first complete reply from `buffer`, returning it with the
    /// number of bytes it spans. `None` means more bytes are needed.
    pub fn parse(buffer: &[u8]) -> ClientResult<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut code = None;
        let mut lines = Vec::new();

        while let Some(end) = buffer[consumed..].iter().position(|&byte| byte == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let line = std::str::from_utf8(raw)
                .map_err(|err| ClientError::Parse(err.to_string()))?
                .trim_end_matches('\r');

            let (line_code, last, text) = parse_line(line)?;
            match code {
                Some(code) if code != line_code => {
                    return Err(ClientError::Parse(format!(
                        "Status code changed within a reply: expected {code}, got {line_code}"
                    )));
                }
                Some(_) => {}
                None => code = Some(line_code),
            }

            lines.push(text.to_string());

            if last {
                return Ok(Some((Self::new(line_code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

/// Splits `250-text` into its code, whether it is the final line, and text
fn parse_line(line: &str) -> ClientResult<(u16, bool, &str)> {
    let code = line
        .get(..3)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ClientError::Parse(format!("Invalid reply line: '{line}'")))?;

    match line.as_bytes().get(3) {
        None => Ok((code, true, "")),
        Some(b' ') => Ok((code, true, &line[4..])),
        Some(b'-') => Ok((code, false, &line[4..])),
        Some(other) => Err(ClientError::Parse(format!(
            "Invalid separator '{}' in '{line}'",
            char::from(*other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn single_line() {
        let (response, consumed) = Response::parse(b"250 OK\r\n").unwrap().unwrap();
        assert_eq!(response, Response::new(250, vec![String::from("OK")]));
        assert_eq!(consumed, 8);
        assert!(response.is_success());
    }

    #[test]
    fn multi_line_ehlo() {
        let data = b"250-mx.test\r\n250-SIZE 1000\r\n250 STARTTLS\r\n221 next";
        let (response, consumed) = Response::parse(data).unwrap().unwrap();

        assert_eq!(response.code, 250);
        assert_eq!(response.lines, vec!["mx.test", "SIZE 1000", "STARTTLS"]);
        assert_eq!(consumed, data.len() - b"221 next".len());
    }

    #[test]
    fn incomplete_reply_needs_more() {
        assert_eq!(Response::parse(b"250-mx.test\r\n250-SIZE").unwrap(), None);
        assert_eq!(Response::parse(b"").unwrap(), None);
    }

    #[test]
    fn bare_code_and_mismatch() {
        let (response, _) = Response::parse(b"354\r\n").unwrap().unwrap();
        assert_eq!(response.lines, vec![String::new()]);

        assert!(Response::parse(b"250-a\r\n251 b\r\n").is_err());
        assert!(Response::parse(b"hello\r\n").is_err());
        assert!(Response::parse(b"250+x\r\n").is_err());
    }

    #[test]
    fn classification() {
        assert!(Response::new(451, vec![]).is_temporary_error());
        assert!(Response::new(550, vec![]).is_permanent_error());
        assert!(Response::new(354, vec![]).is_success());

        let err = Response::new(554, vec![String::from("denied")])
            .expect_code(250)
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
