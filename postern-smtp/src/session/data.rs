use std::time::{SystemTime, UNIX_EPOCH};

use mailparse::MailHeaderMap;
use postern_common::{error::SessionError, internal, status::Status};
use postern_hooks::HookPoint;
use postern_spool::Submission;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Flow, Session};
use crate::{command::Command, connection::Line};

/// Longest message line, terminator included
pub const DATA_LINE_LIMIT: usize = 1000;

/// Largest header block accepted
pub const HEADER_LIMIT: usize = 64 * 1024;

fn prepend(raw: &mut Vec<u8>, head: &[u8]) {
    let mut joined = Vec::with_capacity(head.len() + raw.len());
    joined.extend_from_slice(head);
    joined.extend_from_slice(raw);
    *raw = joined;
}

/// Counts hops while the header block is read
fn is_trace_header(line: &[u8]) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.starts_with(b"received: ") || lower.starts_with(b"delivered: ")
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub(super) async fn data(&mut self, command: &Command) -> Result<Flow, SessionError> {
        let next = match self.state.next(command.verb, self.helo_seen) {
            Ok(next) => next,
            Err(rejection) => {
                self.send(&rejection).await?;
                return Ok(Flow::Continue);
            }
        };

        if !command.args.is_empty() {
            self.reply(Status::InvalidArguments, "5.5.4 invalid syntax")
                .await?;
            return Ok(Flow::Continue);
        }

        self.reply(Status::StartMailInput, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let Some(raw) = self.receive().await? else {
            return Ok(Flow::Close);
        };

        self.state = next;
        let flow = self.accept(raw).await;
        self.reset();
        flow
    }

    /// Reads the message up to the terminating dot, enforcing the line, header,
    /// hop and size limits. `None` means the session must close; the reply has
    /// been sent.
    async fn receive(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        let mut raw = Vec::new();
        let mut in_headers = true;
        let mut header_bytes = 0;
        let mut hops = 0;
        let mut total = 0;

        loop {
            let line = match self.read_line(DATA_LINE_LIMIT).await? {
                Line::Complete(line) => line,
                Line::TooLong => {
                    self.reply(Status::LineTooLong, "SMTP line too long").await?;
                    return Ok(None);
                }
                Line::Eof => {
                    internal!(level = WARN, "Connection lost while reading DATA");
                    self.reply(
                        Status::InsufficientStorage,
                        "something wrong happened when reading data from you",
                    )
                    .await?;
                    return Ok(None);
                }
            };

            if line == b".\r\n" {
                break;
            }

            if in_headers {
                if line == b"\r\n" {
                    in_headers = false;

                    if hops > self.config.max_hops {
                        internal!(level = INFO, "Message looping, {hops} hops");
                        self.reply(
                            Status::TransactionFailed,
                            "5.4.6 too many hops, this message is looping",
                        )
                        .await?;
                        return Ok(None);
                    }
                } else {
                    if is_trace_header(&line) {
                        hops += 1;
                    }

                    header_bytes += line.len();
                    if header_bytes > HEADER_LIMIT {
                        self.reply(
                            Status::LineTooLong,
                            "headers in this message are too long",
                        )
                        .await?;
                        return Ok(None);
                    }
                }
            }

            total += line.len();
            if self.config.max_databytes != 0 && total > self.config.max_databytes {
                internal!(level = INFO, "Message exceeds {} bytes", self.config.max_databytes);
                self.reply(
                    Status::ExceededStorage,
                    "5.3.4 sorry, that message size exceeds my databytes limit",
                )
                .await?;
                return Ok(None);
            }

            // RFC 5321 4.5.2
            let line = match line.strip_prefix(b".") {
                Some(unstuffed) => unstuffed,
                None => &line,
            };
            raw.extend_from_slice(line);
        }

        if in_headers {
            prepend(&mut raw, b"\r\n");
        }

        Ok(Some(raw))
    }

    /// Scans, stamps and queues a received message
    async fn accept(&mut self, mut raw: Vec<u8>) -> Result<Flow, SessionError> {
        if self.config.scan_enabled
            && let Some(scanner) = self.services.scanner.clone()
        {
            match scanner.scan(&raw).await {
                Ok(verdict) if verdict.infected => {
                    internal!(level = INFO, "Message infected by {}", verdict.signature);
                    let line = format!("5.7.1 message infected by {}", verdict.signature);
                    self.reply(Status::TransactionFailed, &line).await?;
                    return Ok(Flow::Continue);
                }
                Ok(_) => {}
                Err(err) => {
                    internal!(level = ERROR, "{err}");
                    self.reply(Status::InsufficientStorage, "4.3.0 scanner failure")
                        .await?;
                    return Ok(Flow::Continue);
                }
            }
        }

        let has_message_id = mailparse::parse_headers(&raw)
            .ok()
            .and_then(|(headers, _)| headers.get_first_value("Message-ID"))
            .is_some_and(|value| !value.trim().is_empty());

        if !has_message_id {
            let header = format!("Message-ID: <{}>\r\n", self.message_id());
            prepend(&mut raw, header.as_bytes());
        }

        let received = self.received_header().await;
        prepend(&mut raw, received.as_bytes());

        let sender = self
            .context
            .envelope
            .sender()
            .map(ToString::to_string)
            .unwrap_or_default();
        prepend(&mut raw, format!("X-Env-From: {sender}\r\n").as_bytes());

        self.context.data = Some(raw);

        if self.hook(HookPoint::Data).await?.drop {
            return Ok(Flow::Close);
        }

        let outcome = self.hook(HookPoint::BeforeQueue).await?;
        if outcome.drop {
            return Ok(Flow::Close);
        }
        if outcome.done {
            internal!(level = DEBUG, "Hook took over queueing");
            return Ok(Flow::Continue);
        }

        let submission = Submission {
            mail_from: sender,
            rcpt_to: self.context.envelope.recipients().to_vec(),
            raw: self.context.data.take().unwrap_or_default(),
            auth_user: self.context.auth_user.clone(),
        };

        match self.services.spool.submit(submission).await {
            Ok(id) => {
                internal!(level = INFO, "Message queued as {id}");
                let line = format!("2.0.0 OK: message queued {id}");
                self.reply(Status::Ok, &line).await?;
            }
            Err(err) => {
                internal!(level = ERROR, "Unable to put message in queue: {err}");
                self.reply(Status::ActionUnavailable, "temporary queue error")
                    .await?;
            }
        }

        Ok(Flow::Continue)
    }

    fn message_id(&self) -> String {
        let domain = self
            .context
            .envelope
            .sender()
            .and_then(|sender| sender.mailbox())
            .map_or_else(
                || self.config.system_name.clone(),
                |address| address.domain.to_ascii_lowercase(),
            );

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());

        format!("{now}.{}@{domain}", self.context.id)
    }

    async fn received_header(&self) -> String {
        let ip = self.context.peer.ip();
        let mut received = String::from("Received: ");

        let hidden = self.context.auth_user.is_some() && self.config.hide_received_from_auth;
        if !hidden {
            let host = self
                .services
                .resolver
                .reverse_lookup(ip)
                .await
                .unwrap_or_else(|_| String::from("unknown"));

            received.push_str(&format!(
                "from {host} ([{ip}] helo=[{}])\r\n        ",
                self.context.helo.as_deref().unwrap_or_default()
            ));
        }

        received.push_str(&format!("by {} ", self.config.system_name));
        match self.context.tls.as_ref() {
            Some(tls) => received.push_str(&format!("with ESMTPS ({} {})", tls.protocol, tls.cipher)),
            None => received.push_str("with SMTP"),
        }

        let sender = self
            .context
            .envelope
            .sender()
            .map(ToString::to_string)
            .unwrap_or_default();
        let rcpt = self
            .context
            .envelope
            .recipients()
            .first()
            .map(ToString::to_string)
            .unwrap_or_default();

        received.push_str(&format!(
            "\r\n        (postern {})\r\n        (envelope-from {sender})\r\n        id {}\r\n        for {rcpt}; {}\r\n",
            env!("CARGO_PKG_VERSION"),
            self.context.id,
            chrono::Local::now().to_rfc2822()
        ));

        received
    }
}
