//! Bounce messages returned to the sender of an undeliverable message.

use chrono::{DateTime, Utc};
use ulid::Ulid;

/// What a bounce reports on
#[derive(Debug, Clone, Copy)]
pub struct Bounce<'a> {
    /// Operator identity, used as the sending host
    pub me: &'a str,
    /// Receives the bounce
    pub sender: &'a str,
    /// The recipient that could not be reached
    pub recipient: &'a str,
    pub error: &'a str,
    /// The undeliverable message, when it could still be read
    pub raw: Option<&'a [u8]>,
}

impl Bounce<'_> {
    /// Renders the complete bounce message, headers included
    #[must_use]
    pub fn render(&self, date: DateTime<Utc>) -> Vec<u8> {
        let boundary = format!("----=_Bounce_{}", Ulid::new());

        let head = format!(
            "Date: {date}\r\n\
            From: Mail Delivery System <MAILER-DAEMON@{me}>\r\n\
            To: <{sender}>\r\n\
            Subject: Delivery Status Notification (Failure)\r\n\
            Message-ID: <{id}@{me}>\r\n\
            Auto-Submitted: auto-replied\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\
            \r\n\
            This is a multi-part message in MIME format.\r\n\
            \r\n\
            --{boundary}\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            Content-Transfer-Encoding: 8bit\r\n\
            \r\n\
            This is the mail delivery system at host {me}.\r\n\
            \r\n\
            I'm sorry to inform you that your message could not be delivered to\r\n\
            one or more recipients.\r\n\
            \r\n\
            <{recipient}>:\r\n\
            {error}\r\n\
            \r\n\
            --{boundary}\r\n",
            date = date.to_rfc2822(),
            me = self.me,
            sender = self.sender,
            id = Ulid::new(),
            recipient = self.recipient,
            error = self.error,
        );

        let mut message = head.into_bytes();
        match self.raw {
            Some(raw) => {
                message.extend_from_slice(
                    b"Content-Type: message/rfc822\r\nContent-Disposition: attachment\r\n\r\n",
                );
                message.extend_from_slice(raw);
                if !raw.ends_with(b"\r\n") {
                    message.extend_from_slice(b"\r\n");
                }
            }
            None => message.extend_from_slice(
                b"Content-Type: text/plain; charset=utf-8\r\n\r\nRaw mail was not found in the store\r\n",
            ),
        }
        message.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

        message
    }
}
