//! Failures of listener start-up, sessions and name lookups.

use std::io;

use thiserror::Error;

/// A listener's arguments were rejected before it started
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// Checking a referenced file, such as a TLS certificate, failed
    #[error("I/O error during validation: {0}")]
    Io(#[from] io::Error),
}

/// Why a session ended early
#[derive(Debug, Error)]
pub enum SessionError {
    /// The peer broke the protocol badly enough to be disconnected
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    #[error("Shutdown requested")]
    Shutdown,

    /// Nothing was received for the idle timeout, in seconds
    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}

impl SessionError {
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Caused by the peer rather than by this server
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    AcceptFailed(#[from] io::Error),
}

/// Failures while resolving names for HELO/MAIL checks and remote delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsError {
    /// The name does not exist or has no usable records
    #[error("No records found for {0}")]
    NotFound(String),

    /// The lookup timed out or the upstream server failed
    #[error("Lookup for {domain} failed: {reason}")]
    LookupFailed { domain: String, reason: String },

    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),
}

impl DnsError {
    /// Returns `true` when retrying the lookup later could succeed
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::LookupFailed { .. })
    }
}

pub type DnsResult<T> = Result<T, DnsError>;
