//! Wire and TLS failures of a server session.

use std::io;

use postern_common::error::SessionError;
use thiserror::Error;

/// Reading from or writing to the peer failed
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Response formatting error: {0}")]
    Format(#[from] std::fmt::Error),
}

/// Loading the listener's certificate or upgrading a connection failed
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("No TLS certificate configured")]
    NotConfigured,

    /// STARTTLS on a connection that is already encrypted
    #[error("Connection is already secured")]
    AlreadySecured,

    #[error("Failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// The handshake finished without a negotiated protocol or cipher
    #[error("Missing TLS session information: {0}")]
    ProtocolInfoMissing(&'static str),

    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

impl From<ConnectionError> for SessionError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Io(err) => Self::Connection(err),
            ConnectionError::Closed => Self::Connection(io::ErrorKind::NotConnected.into()),
            ConnectionError::Format(err) => Self::Protocol(err.to_string()),
        }
    }
}

pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

pub type TlsResult<T> = std::result::Result<T, TlsError>;
