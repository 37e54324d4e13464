//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

/// Errors that can occur while talking to a remote SMTP server.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error occurred during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The server sent something that is not an SMTP reply.
    #[error("Failed to parse SMTP response: {0}")]
    Parse(String),

    /// The server refused a step of the conversation.
    #[error("SMTP error: {code} - {message}")]
    Smtp { code: u16, message: String },

    /// TLS negotiation failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The server did not answer in time.
    #[error("No response within {0} seconds")]
    Timeout(u64),

    /// Connection was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,
}

impl ClientError {
    /// Whether retrying later cannot help
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Smtp { code, .. } if *code >= 500)
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;
