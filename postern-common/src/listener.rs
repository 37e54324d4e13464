use std::net::SocketAddr;

use futures_util::future::join_all;
use postern_tracing::traced;
use serde::Deserialize;
use tokio::{net::TcpListener, sync::broadcast::error::RecvError};

use crate::{
    Signal,
    error::{ListenerError, ProtocolError},
    internal,
    traits::protocol::{Protocol, SessionHandler},
};

#[derive(Deserialize)]
pub struct Listener<Proto: Protocol> {
    #[serde(skip)]
    handler: Proto,
    socket: SocketAddr,
    #[serde(skip_serializing, default, flatten)]
    args: Proto::Args,
    #[serde(default)]
    context: Proto::Context,
}

impl<Proto: Protocol> Listener<Proto> {
    #[must_use]
    pub fn new(socket: SocketAddr, args: Proto::Args) -> Self {
        Self {
            handler: Proto::default(),
            socket,
            args,
            context: Proto::Context::default(),
        }
    }

    #[must_use]
    pub const fn socket(&self) -> SocketAddr {
        self.socket
    }

    #[must_use]
    pub const fn args(&self) -> &Proto::Args {
        &self.args
    }

    pub(crate) fn map_args<F>(&mut self, f: &F)
    where
        F: Fn(Proto::Args) -> Proto::Args,
    {
        self.args = f(std::mem::take(&mut self.args));
    }

    #[traced(instrument(skip(self)), timing(precision = "ns"))]
    pub fn init(&mut self) -> Result<(), ProtocolError> {
        self.handler.validate(&mut self.args)
    }

    /// Binds the configured socket and serves until shutdown
    pub async fn serve(
        &self,
        shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), ListenerError> {
        let listener =
            TcpListener::bind(self.socket)
                .await
                .map_err(|source| ListenerError::BindFailed {
                    address: self.socket.to_string(),
                    source,
                })?;

        self.serve_on(listener, shutdown).await
    }

    /// Accepts connections from an already bound socket, one task per session
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing(precision = "s"))]
    pub async fn serve_on(
        &self,
        listener: TcpListener,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), ListenerError> {
        let local = listener.local_addr()?;
        internal!("Serving {} on {local} with {:?}", Proto::ty(), self.context);

        let mut sessions = Vec::default();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(RecvError::Closed)) {
                        internal!(level = INFO, "{} Listener {local} received shutdown signal, finishing sessions ...", Proto::ty());
                        join_all(sessions).await;
                        return Ok(());
                    }
                }

                connection = listener.accept() => {
                    let (stream, peer) = connection?;
                    tracing::debug!("Connection from {peer} received on {local}");

                    let handler = self.handler.handle(stream, peer, self.context.clone(), self.args.clone());
                    let signal = shutdown.resubscribe();

                    sessions.retain(|session: &tokio::task::JoinHandle<()>| !session.is_finished());
                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = handler.run(signal).await {
                            internal!(level = ERROR, "Session with {peer} ended: {err}");
                        }
                    }));
                }
            }
        }
    }
}
