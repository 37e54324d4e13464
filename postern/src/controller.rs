use std::{path::Path, sync::Arc, sync::LazyLock};

use postern_common::{
    Signal,
    controller::Controller,
    dns::{DnsResolver, Resolver},
    gate::Gate,
    internal, logging,
};
use postern_delivery::{DeliveryConfig, DeliveryController, DeliveryProcessor, StaticKeyStore};
use postern_hooks::{Module, Registry};
use postern_smtp::Smtp;
use postern_spool::{Directory, DirectoryConfig, SpoolConfig};
use postern_tracing::traced;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::admin::Admin;

/// The whole server as described by the configuration file
///
/// ```ron
/// (
///     smtp: (listeners: [(socket: "[::]:25", system_name: "mx.example.org")]),
///     delivery: (me: "mx.example.org"),
///     spool: (store: (type: "File", path: "/var/spool/postern")),
///     directory: (path: Some("/etc/postern/directory.ron")),
///     hooks: [(type: "Greeting", banner: "mx.example.org ready")],
/// )
/// ```
#[derive(Default, Deserialize)]
pub struct Postern {
    #[serde(alias = "smtp_controller", default)]
    smtp: Controller<Smtp>,
    #[serde(default)]
    delivery: DeliveryConfig,
    #[serde(default)]
    spool: SpoolConfig,
    #[serde(default)]
    directory: DirectoryConfig,
    #[serde(alias = "hook", alias = "modules", default)]
    hooks: Vec<Module>,
    #[serde(skip)]
    resolver: Option<Arc<dyn Resolver>>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[traced(instrument(level = tracing::Level::TRACE))]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    tokio::signal::ctrl_c().await?;
    internal!(level = WARN, "Forcing shutdown");

    Ok(())
}

impl Postern {
    /// Parses the configuration at `path`
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = crate::config::read(path)?;
        ron::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Invalid configuration in {}: {e}", path.display()))
    }

    /// Uses `resolver` instead of the system resolver
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn smtp(&self) -> &Controller<Smtp> {
        &self.smtp
    }

    #[must_use]
    pub const fn delivery(&self) -> &DeliveryConfig {
        &self.delivery
    }

    /// Operator access to the configured stores
    #[must_use]
    pub fn admin(&self) -> Admin {
        Admin::new(self.directory.clone(), self.spool.clone())
    }

    /// Run this controller, and everything it controls, until a shutdown
    /// signal arrives
    ///
    /// # Errors
    ///
    /// This function will return an error if any of the stores, hooks or
    /// listeners fail to initialise.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        let ret = tokio::select! {
            r = self.serve(&SHUTDOWN_BROADCAST) => {
                r
            }
            r = shutdown() => {
                r
            }
        };

        internal!("Shutting down...");

        ret
    }

    /// Opens the stores, starts every listener and the delivery workers, and
    /// returns once all of them have stopped after a [`Signal::Shutdown`]
    /// sent through `signal`
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn serve(self, signal: &broadcast::Sender<Signal>) -> anyhow::Result<()> {
        let Self {
            mut smtp,
            delivery,
            spool,
            directory,
            hooks,
            resolver,
        } = self;

        let spool = spool.into_spool()?;
        let directory: Arc<dyn Directory> = Arc::new(directory.load()?);
        let resolver: Arc<dyn Resolver> = match resolver {
            Some(resolver) => resolver,
            None => Arc::new(DnsResolver::new(delivery.dns.clone())?),
        };
        let hooks = Registry::from_modules(hooks)?;
        let sessions = Gate::new();

        smtp.map_args(|args| {
            args.with_directory(Arc::clone(&directory))
                .with_resolver(Arc::clone(&resolver))
                .with_hooks(hooks.clone())
                .with_spool(spool.clone())
                .with_sessions(sessions.clone())
        });
        smtp.init()?;

        let mut controller =
            DeliveryController::new(delivery.clone(), spool, directory, resolver);
        if delivery.dkim_sign {
            let keys = StaticKeyStore::load(&delivery.dkim_keys)?;
            internal!("Loaded {} DKIM key(s)", delivery.dkim_keys.len());
            controller = controller.with_key_store(Arc::new(keys));
        }
        let processor = DeliveryProcessor::new(controller);

        internal!("Controller running");

        let listeners = smtp.control(signal.subscribe());
        let workers = processor.serve(signal.subscribe());

        tokio::try_join!(
            async move { listeners.await.map_err(anyhow::Error::from) },
            async move { workers.await.map_err(anyhow::Error::from) },
        )?;

        Ok(())
    }
}
