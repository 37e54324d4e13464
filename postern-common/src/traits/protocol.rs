use std::{fmt::Debug, net::SocketAddr};

use serde::Deserialize;
use tokio::net::TcpStream;

use crate::{
    Signal,
    error::{ProtocolError, SessionError},
};

pub trait SessionHandler {
    fn run(
        self,
        signal: tokio::sync::broadcast::Receiver<Signal>,
    ) -> impl std::future::Future<Output = Result<(), SessionError>> + Send;
}

pub trait Protocol: Default + Send + Sync {
    type Session: SessionHandler + Send + 'static;
    /// Free-form values attached to every session accepted by a listener
    type Context: Default + Clone + Debug + Send + Sync + for<'a> Deserialize<'a>;
    type Args: Default + Clone + Debug + Send + Sync + for<'a> Deserialize<'a>;

    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        context: Self::Context,
        args: Self::Args,
    ) -> Self::Session;

    ///
    /// Validate the arguments being provided to the protocol
    ///
    /// # Errors
    /// When the arguments cannot be used, for example a TLS certificate path
    /// that does not exist
    ///
    fn validate(&mut self, args: &mut Self::Args) -> Result<(), ProtocolError>;

    fn ty() -> &'static str;
}
