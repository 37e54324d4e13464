use postern_common::{
    address::{
        Address, AddressError, ReversePath, parse_forward_path, parse_ip_literal, unbracket,
        validate_reverse_path,
    },
    error::SessionError,
    internal,
    status::Status,
};
use postern_hooks::HookPoint;
use postern_spool::DirectoryResult;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Flow, Session};
use crate::command::Command;

/// Past this many recipients every further `RCPT` is slowed down
const RCPT_BEFORE_PAUSE: usize = 10;

/// How a recipient may be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relay {
    Granted,
    Denied,
    NoMailbox,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub(super) async fn mail_from(&mut self, command: &Command) -> Result<Flow, SessionError> {
        self.reset();

        if self.hello_missing().await? {
            return Ok(Flow::Continue);
        }

        let (path, extensions) = match command.path_argument("from:") {
            Some((path, extensions)) if extensions.len() <= 1 => (path.to_string(), extensions),
            _ => {
                self.reply(
                    Status::InvalidArguments,
                    "5.5.4 Syntax: MAIL FROM:<address> [SIZE]",
                )
                .await?;
                return Ok(Flow::Continue);
            }
        };

        if let Some(extension) = extensions.first() {
            let size = extension
                .split_once('=')
                .filter(|(name, _)| name.eq_ignore_ascii_case("size"))
                .and_then(|(_, size)| size.parse::<usize>().ok());

            let Some(size) = size else {
                self.reply(Status::InvalidArguments, "5.5.4 Invalid arguments")
                    .await?;
                return Ok(Flow::Continue);
            };

            if self.config.max_databytes != 0 && size > self.config.max_databytes {
                internal!(level = DEBUG, "Declared size {size} exceeds {}", self.config.max_databytes);
                self.reply(
                    Status::ExceededStorage,
                    "message exceeds fixed maximum message size",
                )
                .await?;
                return Ok(Flow::Continue);
            }
        }

        if self.hook(HookPoint::MailPre).await?.drop {
            return Ok(Flow::Close);
        }

        let Some(path) = unbracket(&path) else {
            self.reply(Status::InvalidArguments, "5.1.7 Invalid address")
                .await?;
            return Ok(Flow::Continue);
        };

        let sender = if path.is_empty() {
            ReversePath::Null
        } else {
            match self.reverse_path(path).await? {
                Some(address) => ReversePath::Mailbox(address),
                None => return Ok(Flow::Continue),
            }
        };

        internal!(level = DEBUG, "MAIL FROM <{sender}>");
        self.context.envelope.set_sender(sender);

        let outcome = self.hook(HookPoint::MailPost).await?;
        if outcome.drop {
            return Ok(Flow::Close);
        }

        self.state = self
            .state
            .next(command.verb, self.helo_seen)
            .unwrap_or(self.state);

        if !outcome.done {
            self.reply(Status::Ok, "OK").await?;
        }

        Ok(Flow::Continue)
    }

    /// Validates a non-null sender, replying with the reason when it is refused
    async fn reverse_path(&mut self, path: &str) -> Result<Option<Address>, SessionError> {
        let address = match validate_reverse_path(path, self.config.mailfrom_localpart_size) {
            Ok(address) => address,
            Err(err) => {
                internal!(level = DEBUG, "Reverse path {path} rejected: {err}");
                let (status, line) = match err {
                    AddressError::PathTooLong => (
                        Status::Error,
                        "reverse path must be lower than 255 char (RFC 5321 4.5.1.3.1)",
                    ),
                    AddressError::LocalPartTooLong => (
                        Status::Error,
                        "local part of reverse path MUST be lower than 65 char (RFC 5321 4.5.3.1.1)",
                    ),
                    AddressError::DomainTooLong => (
                        Status::Error,
                        "domain part of reverse path MUST be lower than 255 char (RFC 5321 4.5.3.1.2)",
                    ),
                    AddressError::Malformed(_) => (Status::InvalidArguments, "5.1.7 Invalid address"),
                };
                self.reply(status, line).await?;
                return Ok(None);
            }
        };

        if parse_ip_literal(&address.domain).is_some() {
            return Ok(Some(address));
        }

        match self.services.resolver.resolves(&address.domain).await {
            Ok(true) => Ok(Some(address)),
            Ok(false) => {
                self.reply(
                    Status::Error,
                    "5.5.2 need fully-qualified hostname for domain part",
                )
                .await?;
                Ok(None)
            }
            Err(err) => {
                internal!(level = WARN, "Unable to resolve {}: {err}", address.domain);
                let line = format!(
                    "unable to resolve {} due to timeout or srv failure",
                    address.domain
                );
                self.reply(Status::ActionUnavailable, &line).await?;
                Ok(None)
            }
        }
    }

    pub(super) async fn rcpt_to(&mut self, command: &Command) -> Result<Flow, SessionError> {
        if self.hello_missing().await? {
            return Ok(Flow::Continue);
        }

        self.counters.rcpt += 1;
        if self.config.max_rcpt != 0 && self.counters.rcpt > self.config.max_rcpt {
            self.reply(
                Status::ActionUnavailable,
                "4.5.3 max RCPT To commands reached for this sessions",
            )
            .await?;
            return Ok(Flow::Continue);
        }

        if self.counters.rcpt > RCPT_BEFORE_PAUSE {
            Self::pause().await;
        }

        let next = match self.state.next(command.verb, self.helo_seen) {
            Ok(next) => next,
            Err(rejection) => {
                self.send(&rejection).await?;
                return Ok(Flow::Continue);
            }
        };

        let Some((path, _)) = command.path_argument("to:") else {
            self.reply(Status::InvalidArguments, "5.5.4 syntax: RCPT TO:<address>")
                .await?;
            return Ok(Flow::Continue);
        };

        let recipient = unbracket(path)
            .and_then(|path| parse_forward_path(path, &self.config.system_name).ok());

        let Some(recipient) = recipient else {
            self.reply(Status::InvalidArguments, "5.5.4 Bad email format")
                .await?;
            return Ok(Flow::Continue);
        };

        self.context.recipient = Some(recipient.clone());
        self.context.relay = None;

        let outcome = self.hook(HookPoint::RcptTo).await?;
        if outcome.drop {
            return Ok(Flow::Close);
        }
        if outcome.done {
            // The hook answered for itself; any recipient it added still opens DATA
            if !self.context.envelope.recipients().is_empty() {
                self.state = next;
            }
            return Ok(Flow::Continue);
        }

        let relay = match self.context.relay {
            Some(true) => Ok(Relay::Granted),
            Some(false) => Ok(Relay::Denied),
            None => self.relay(&recipient).await,
        };

        match relay {
            Ok(Relay::Granted) => {
                if !self.context.envelope.add_recipient(recipient.clone()) {
                    internal!(level = DEBUG, "Ignoring duplicate recipient {recipient}");
                }
                self.state = next;
                self.reply(Status::Ok, "OK").await?;
                Ok(Flow::Continue)
            }
            Ok(Relay::NoMailbox) => {
                self.counters.bad_rcpt += 1;
                internal!(level = DEBUG, "No mailbox for {recipient}");
                self.reply(Status::Error, "5.5.1 Sorry, no mailbox here by that name")
                    .await?;

                if self.config.max_bad_rcpt != 0 && self.counters.bad_rcpt > self.config.max_bad_rcpt
                {
                    internal!(level = INFO, "Too many bad recipients, closing");
                    return Ok(Flow::Close);
                }
                Ok(Flow::Continue)
            }
            Ok(Relay::Denied) => {
                internal!(level = INFO, "Relay denied for {recipient} from {}", self.context.peer);
                self.reply(Status::TransactionFailed, "5.7.1 Relay access denied")
                    .await?;
                Ok(Flow::Continue)
            }
            Err(err) => {
                internal!(level = ERROR, "Relay lookup for {recipient} failed: {err}");
                self.reply(
                    Status::ServerUnableToAccommodate,
                    "4.3.0 oops, problem with relay access",
                )
                .await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Local domains need an existing mailbox; anything else needs an
    /// authenticated relay user or an allowed client address
    async fn relay(&self, recipient: &Address) -> DirectoryResult<Relay> {
        let directory = &self.services.directory;

        if let Some(host) = directory.rcpt_host(&recipient.domain).await? {
            if !host.is_local {
                return Ok(Relay::Granted);
            }

            return Ok(if directory.mailbox_exists(&recipient.to_string()).await? {
                Relay::Granted
            } else {
                Relay::NoMailbox
            });
        }

        if self.auth_relay {
            return Ok(Relay::Granted);
        }

        if directory.relay_ip_allowed(self.context.peer.ip()).await? {
            return Ok(Relay::Granted);
        }

        Ok(Relay::Denied)
    }

    pub(super) async fn verify(&mut self, command: &Command) -> Result<Flow, SessionError> {
        if self.hello_missing().await? {
            return Ok(Flow::Continue);
        }

        self.counters.vrfy += 1;
        if self.config.max_vrfy != 0 && self.counters.vrfy > self.config.max_vrfy {
            self.reply(
                Status::UserNotLocal,
                "5.5.3 too many VRFY commands for this sessions",
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let [argument] = command.args.as_slice() else {
            self.reply(Status::UserNotLocal, "5.5.4 syntax: VRFY <address>")
                .await?;
            return Ok(Flow::Continue);
        };

        let path = unbracket(argument).unwrap_or(argument);
        let Ok(address) = parse_forward_path(path, &self.config.system_name) else {
            self.reply(Status::UserNotLocal, "5.5.4 Bad email format")
                .await?;
            return Ok(Flow::Continue);
        };

        let directory = &self.services.directory;
        let verdict = match directory.rcpt_host(&address.domain).await {
            Ok(Some(host)) if host.is_local => directory
                .mailbox_exists(&address.to_string())
                .await
                .map(|exists| if exists { Status::Ok } else { Status::UserNotLocal }),
            Ok(Some(_)) => Ok(Status::CannotVerify),
            Ok(None) => Ok(Status::UserNotLocal),
            Err(err) => Err(err),
        };

        match verdict {
            Ok(Status::UserNotLocal) => {
                let line = format!("5.5.1 {address} no mailbox here by that name");
                self.reply(Status::UserNotLocal, &line).await?;
            }
            Ok(status) => self.reply(status, &address.to_string()).await?,
            Err(err) => {
                internal!(level = ERROR, "VRFY lookup for {address} failed: {err}");
                self.reply(
                    Status::ServerUnableToAccommodate,
                    "4.3.0 oops, internal failure",
                )
                .await?;
            }
        }

        Ok(Flow::Continue)
    }
}
