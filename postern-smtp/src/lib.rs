pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod scanner;
pub mod session;
pub mod state;

use std::{net::SocketAddr, sync::Arc};

use ahash::AHashMap;
use postern_common::{
    Signal,
    dns::{Resolver, StaticResolver},
    error::{ProtocolError, SessionError},
    gate::Gate,
    traits::protocol::{Protocol, SessionHandler},
};
use postern_hooks::Registry;
use postern_spool::{Directory, MemoryDirectory, Spool};
use postern_tracing::traced;
use serde::Deserialize;
use tokio::net::TcpStream;

pub use crate::{
    config::{ServerTls, SmtpConfig},
    scanner::{ScanError, ScanVerdict, VirusScanner},
    session::Session,
    state::State,
};

#[derive(Default, Deserialize)]
pub struct Smtp;

/// Shared collaborators of every session.
///
/// These cannot come from the configuration file and are injected once the
/// stores are open. The defaults are empty in-memory stand-ins.
#[derive(Clone, Debug)]
pub struct Services {
    pub directory: Arc<dyn Directory>,
    pub resolver: Arc<dyn Resolver>,
    pub hooks: Registry,
    pub spool: Spool,
    pub scanner: Option<Arc<dyn VirusScanner>>,
    /// Live sessions across every listener sharing this gate
    pub sessions: Gate,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            directory: Arc::new(MemoryDirectory::default()),
            resolver: Arc::new(StaticResolver::new()),
            hooks: Registry::default(),
            spool: Spool::memory(),
            scanner: None,
            sessions: Gate::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SmtpArgs {
    #[serde(flatten)]
    pub config: SmtpConfig,
    #[serde(skip)]
    pub services: Services,
}

impl SmtpArgs {
    /// Create a new `SmtpArgs` builder
    #[must_use]
    pub fn builder() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(mut self, config: SmtpConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.services.directory = directory;
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.services.resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Registry) -> Self {
        self.services.hooks = hooks;
        self
    }

    #[must_use]
    pub fn with_spool(mut self, spool: Spool) -> Self {
        self.services.spool = spool;
        self
    }

    #[must_use]
    pub fn with_scanner(mut self, scanner: Arc<dyn VirusScanner>) -> Self {
        self.services.scanner = Some(scanner);
        self
    }

    /// Share the live-session count with other listeners
    #[must_use]
    pub fn with_sessions(mut self, sessions: Gate) -> Self {
        self.services.sessions = sessions;
        self
    }
}

impl Protocol for Smtp {
    type Session = Session<TcpStream>;
    type Context = AHashMap<String, String>;
    type Args = SmtpArgs;

    fn ty() -> &'static str {
        "SMTP"
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip(self, stream, context, args)), timing(precision = "ms"))]
    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        context: Self::Context,
        args: Self::Args,
    ) -> Self::Session {
        Session::create(stream, peer, context, args)
    }

    #[traced(instrument(skip(self, args)), timing(precision = "ns"))]
    fn validate(&mut self, args: &mut Self::Args) -> Result<(), ProtocolError> {
        if let Some(tls) = args.config.tls.as_ref() {
            if !tls.certificate.try_exists()? {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!(
                        "Unable to find TLS Certificate {}",
                        tls.certificate.display()
                    ),
                )
                .into());
            }

            if !tls.key.try_exists()? {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("Unable to find TLS Key {}", tls.key.display()),
                )
                .into());
            }
        }

        if args.config.max_hops == 0 {
            return Err(ProtocolError::InvalidConfiguration {
                field: String::from("max_hops"),
                reason: String::from("must be at least 1"),
            });
        }

        if args.config.scan_enabled && args.services.scanner.is_none() {
            return Err(ProtocolError::MissingField("scanner"));
        }

        Ok(())
    }
}

impl SessionHandler for Session<TcpStream> {
    async fn run(self, signal: tokio::sync::broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        Self::run(self, signal).await
    }
}
