use futures_util::future::join_all;
use postern_tracing::traced;
use serde::Deserialize;
use tokio::sync::broadcast::Receiver;

use crate::{
    Signal,
    error::{ListenerError, ProtocolError},
    internal,
    listener::Listener,
    traits::Protocol,
};

#[derive(Default, Deserialize)]
pub struct Controller<Proto: Protocol> {
    #[serde(alias = "listener", default)]
    listeners: Vec<Listener<Proto>>,
}

impl<Proto: Protocol> Controller<Proto> {
    #[must_use]
    pub const fn new(listeners: Vec<Listener<Proto>>) -> Self {
        Self { listeners }
    }

    #[must_use]
    pub fn listeners(&self) -> &[Listener<Proto>] {
        &self.listeners
    }

    /// Rewrite the args of every listener before initialisation.
    ///
    /// Used to inject runtime resources that cannot come from the
    /// configuration file, such as the shared stores.
    pub fn map_args<F>(&mut self, f: F)
    where
        F: Fn(Proto::Args) -> Proto::Args,
    {
        for listener in &mut self.listeners {
            listener.map_args(&f);
        }
    }

    ///
    /// Initialise this controller
    ///
    /// # Errors
    /// Any listener whose arguments fail validation
    ///
    pub fn init(&mut self) -> Result<(), ProtocolError> {
        internal!("Initialising Controller for {}", Proto::ty());

        self.listeners.iter_mut().try_for_each(Listener::init)
    }

    ///
    /// # Errors
    /// If any of the listeners fail to bind or accept
    ///
    #[traced(instrument(level = tracing::Level::TRACE, skip(self, signal)), timing(precision = "s"))]
    pub async fn control(self, signal: Receiver<Signal>) -> Result<(), ListenerError> {
        join_all(
            self.listeners
                .iter()
                .map(|listener| listener.serve(signal.resubscribe())),
        )
        .await
        .into_iter()
        .collect()
    }
}
