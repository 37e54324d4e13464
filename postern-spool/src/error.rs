//! Error types for the spool crate.

use std::io;

use thiserror::Error;

/// Failures of the queue store, blob store and work queue.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// The record, blob or job does not exist. Callers special-case this
    /// wherever an at-least-once redelivery may already have finished the work.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The work queue has been shut down
    #[error("Queue closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SpoolError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl From<bincode::error::EncodeError> for SpoolError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Serialization(SerializationError::Encode(err))
    }
}

impl From<bincode::error::DecodeError> for SpoolError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Serialization(SerializationError::Decode(err))
    }
}

/// Failures of the user, rcpthost, route and relay lookups.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid relay address: {0}")]
    InvalidAddress(String),

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unable to parse directory: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error("Unable to write directory: {0}")]
    Write(#[from] ron::Error),
}

impl DirectoryError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T, E = SpoolError> = std::result::Result<T, E>;
pub type DirectoryResult<T> = std::result::Result<T, DirectoryError>;
