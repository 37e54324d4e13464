use std::{net::SocketAddr, panic::AssertUnwindSafe, time::Duration};

use ahash::AHashMap;
use futures_util::FutureExt;
use postern_common::{
    Signal, context::Context, error::SessionError, incoming, internal, status::Status, tracing,
};
use postern_hooks::HookPoint;
use postern_tracing::traced;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast::{self, error::RecvError},
};

use crate::{
    Services, SmtpArgs,
    command::{Command, Verb},
    config::SmtpConfig,
    connection::{Connection, Line, load_acceptor},
    state::State,
};

mod auth;
mod data;
mod envelope;
mod hello;
mod io;
mod tls;

/// Longest command line accepted, terminator included
pub const COMMAND_LINE_LIMIT: usize = 512;

/// Slows down clients that misbehave or enumerate addresses
const PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

#[derive(Debug, Default)]
struct Counters {
    rcpt: usize,
    bad_rcpt: usize,
    vrfy: usize,
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    connection: Connection<Stream>,
    config: SmtpConfig,
    services: Services,
    context: Context,
    state: State,
    counters: Counters,
    helo_seen: bool,
    /// Set once a user allowed to relay has authenticated
    auth_relay: bool,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing)]
    pub fn create(
        stream: Stream,
        peer: SocketAddr,
        metadata: AHashMap<String, String>,
        args: SmtpArgs,
    ) -> Self {
        let mut context = Context::new(
            ulid::Ulid::new().to_string(),
            peer,
            args.config.system_name.as_str(),
        );
        context.metadata = metadata;

        Self {
            connection: Connection::new(stream),
            config: args.config,
            services: args.services,
            context,
            state: State::default(),
            counters: Counters::default(),
            helo_seen: false,
            auth_relay: false,
        }
    }

    /// Serves the connection until the client leaves, a limit closes it or a
    /// shutdown is signalled
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, fields(session = %self.context.id, peer = %self.context.peer), ret), timing(precision = "ms"))]
    pub async fn run(mut self, mut signal: broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        let permit = self
            .services
            .sessions
            .enter(self.config.concurrency_incoming);

        if !permit.admitted() {
            internal!(
                level = WARN,
                "Max connections reached {}/{}",
                self.services.sessions.current(),
                self.config.concurrency_incoming
            );
            let line = format!(
                "sorry, the maximum number of connections has been reached, try again later {}",
                self.context.id
            );
            return self.reply(Status::Unavailable, &line).await;
        }

        internal!(
            "Connected {}/{}",
            self.services.sessions.current(),
            self.config.concurrency_incoming
        );

        let result = self.serve(&mut signal).await;

        self.services
            .hooks
            .dispatch(HookPoint::ExitAsap, &mut self.context)
            .await;

        internal!("Connection closed");
        drop(permit);

        result
    }

    async fn serve(&mut self, signal: &mut broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        if self.config.tls.as_ref().is_some_and(|tls| tls.implicit) {
            let acceptor = load_acceptor(self.config.tls.as_ref())
                .map_err(|err| SessionError::Protocol(err.to_string()))?;
            let info = self
                .connection
                .upgrade(&acceptor)
                .await
                .map_err(|err| SessionError::Protocol(err.to_string()))?;

            internal!(level = DEBUG, "Secured via {} {}", info.protocol, info.cipher);
            self.context.tls = Some(info);
        }

        let outcome = self.hook(HookPoint::Connect).await?;
        if outcome.drop {
            internal!(level = DEBUG, "Hook terminated the session on connect");
            return Ok(());
        }

        if !outcome.done {
            let mut greeting = format!("{} ESMTP {}", self.config.system_name, self.context.id);
            if !self.config.hide_server_signature {
                greeting.push_str(concat!(" - postern ", env!("CARGO_PKG_VERSION")));
            }
            self.reply(Status::ServiceReady, &greeting).await?;
        }

        loop {
            let line = tokio::select! {
                sig = signal.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(RecvError::Closed)) {
                        internal!(level = DEBUG, "Shutdown received");
                        self.reply(Status::Unavailable, "Server shutting down").await?;
                        return Ok(());
                    }
                    continue;
                }
                line = self.read_line(COMMAND_LINE_LIMIT) => line?,
            };

            let line = match line {
                Line::Eof => return Ok(()),
                Line::TooLong => {
                    self.reply(Status::LineTooLong, "SMTP line too long").await?;
                    return Ok(());
                }
                Line::Complete(line) if !Line::is_crlf(&line) => {
                    self.reply(
                        Status::LineTooLong,
                        "SMTP line malformed, not ending with <CR><LF>",
                    )
                    .await?;
                    continue;
                }
                Line::Complete(line) => line,
            };

            let command = Command::from(line.as_slice());
            if command.verb == Verb::Auth {
                // Credentials may follow the mechanism
                incoming!("AUTH {}", command.args.first().map_or("", String::as_str));
            } else {
                incoming!("{command}");
            }

            let flow = match AssertUnwindSafe(self.dispatch(command)).catch_unwind().await {
                Ok(Ok(flow)) => flow,
                Ok(Err(err @ (SessionError::Connection(_) | SessionError::Timeout(_)))) => {
                    return Err(err);
                }
                Ok(Err(err)) => {
                    internal!(level = ERROR, "{err}");
                    self.emergency().await;
                    return Ok(());
                }
                Err(_) => {
                    internal!(level = ERROR, "Command handler panicked");
                    self.emergency().await;
                    return Ok(());
                }
            };

            if flow == Flow::Close {
                return Ok(());
            }

            if self.hook(HookPoint::Notify).await?.drop {
                internal!(level = DEBUG, "Hook terminated the session on notify");
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, command: Command) -> Result<Flow, SessionError> {
        match command.verb {
            Verb::Helo | Verb::Ehlo => self.hello(&command).await,
            Verb::MailFrom => self.mail_from(&command).await,
            Verb::RcptTo => self.rcpt_to(&command).await,
            Verb::Vrfy => self.verify(&command).await,
            Verb::Data => self.data(&command).await,
            Verb::Auth => self.auth(&command).await,
            Verb::StartTls => self.start_tls().await,
            Verb::Expn => {
                self.reply(Status::CannotVerify, "Cannot EXPN").await?;
                Ok(Flow::Continue)
            }
            Verb::Rset => {
                self.reset();
                self.reply(Status::Ok, "2.0.0 OK").await?;
                Ok(Flow::Continue)
            }
            Verb::Noop => {
                self.reply(Status::Ok, "2.0.0 OK").await?;
                Ok(Flow::Continue)
            }
            Verb::Quit => {
                self.hook(HookPoint::Quit).await?;
                self.reply(Status::GoodBye, "2.0.0 Bye").await?;
                Ok(Flow::Close)
            }
            Verb::Unknown => {
                self.reply(Status::Unimplemented, "5.5.1 unimplemented").await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Empties the transaction, keeping the greeting and authentication
    fn reset(&mut self) {
        self.context.reset_transaction();
        self.state = State::base(self.helo_seen);
    }

    /// Replies `503 5.5.2` when a greeting is required and missing
    async fn hello_missing(&mut self) -> Result<bool, SessionError> {
        if self.config.helo_mandatory && !self.helo_seen {
            self.reply(Status::InvalidCommandSequence, "5.5.2 Send hello first")
                .await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn pause() {
        tokio::time::sleep(PAUSE).await;
    }

    async fn emergency(&mut self) {
        if let Err(err) = self
            .reply(Status::Unavailable, "sorry I have an emergency")
            .await
        {
            internal!(level = DEBUG, "Unable to report emergency: {err}");
        }
    }

    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }
}
