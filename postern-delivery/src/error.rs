//! Typed error handling for delivery attempts.
//!
//! Every failure is sorted into one of three kinds:
//! - Permanent failures (5xx replies, unknown domains) are bounced
//! - Temporary failures (4xx replies, network trouble) are retried
//! - System errors (store and directory faults) are retried like
//!   temporary failures

use postern_common::error::DnsError;
use postern_smtp::client::ClientError;
use postern_spool::{DirectoryError, SpoolError};
use thiserror::Error;

use crate::{dkim::DkimError, local::LocalDeliveryError};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Failures that retrying cannot fix. The message is bounced.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// The remote server refused a step of the conversation with a 5xx
    #[error("Message rejected: {0}")]
    MessageRejected(String),

    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The local mailbox cannot hold the message
    #[error("Local delivery failed: {0}")]
    Mailbox(String),

    #[error("bounced by admin")]
    AdminBounce,

    /// A temporary failure that kept happening until the queue lifetime ran out
    #[error(
        "{0}\r\nI'm not going to try again, this message has been in the queue for too long."
    )]
    Expired(String),
}

/// Failures that may clear up on a later attempt.
#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookupFailed(String),

    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    #[error("Temporary SMTP error: {0}")]
    SmtpTemporary(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// No route leads to the recipient domain
    #[error("no route to host {0}")]
    NoRoute(String),

    /// A route exists but its local IP list cannot be used
    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("Local delivery failed: {0}")]
    Mailbox(String),

    #[error("DKIM signing failed: {0}")]
    Dkim(String),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Spool error: {0}")]
    Spool(#[from] SpoolError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Returns `true` if this error is permanent and should be bounced.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }
}

/// A domain that does not exist is permanent, a failed lookup is not.
impl From<DnsError> for DeliveryError {
    fn from(error: DnsError) -> Self {
        match error {
            DnsError::NotFound(domain) | DnsError::InvalidDomain(domain) => {
                Self::Permanent(PermanentError::DomainNotFound(domain))
            }
            err @ DnsError::LookupFailed { .. } => {
                Self::Temporary(TemporaryError::DnsLookupFailed(err.to_string()))
            }
        }
    }
}

/// - **4xx replies** → Temporary
/// - **5xx replies** → Permanent
/// - **Connection, I/O and TLS errors** → Temporary
/// - **Unparsable replies** → System
impl From<ClientError> for DeliveryError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Smtp { code, message } if code >= 500 => Self::Permanent(
                PermanentError::MessageRejected(format!("{code} {message}")),
            ),
            ClientError::Smtp { code, message } => {
                Self::Temporary(TemporaryError::SmtpTemporary(format!("{code} {message}")))
            }
            ClientError::Io(err) => {
                Self::Temporary(TemporaryError::ConnectionFailed(err.to_string()))
            }
            ClientError::ConnectionClosed => Self::Temporary(TemporaryError::ConnectionFailed(
                String::from("connection closed by the remote server"),
            )),
            ClientError::Tls(err) => Self::Temporary(TemporaryError::TlsHandshakeFailed(err)),
            ClientError::Timeout(secs) => Self::Temporary(TemporaryError::Timeout(secs)),
            ClientError::Parse(err) => Self::System(SystemError::Internal(err)),
        }
    }
}

impl From<SpoolError> for DeliveryError {
    fn from(error: SpoolError) -> Self {
        Self::System(SystemError::Spool(error))
    }
}

impl From<DirectoryError> for DeliveryError {
    fn from(error: DirectoryError) -> Self {
        Self::System(SystemError::Directory(error))
    }
}

impl From<LocalDeliveryError> for DeliveryError {
    fn from(error: LocalDeliveryError) -> Self {
        if error.is_permanent() {
            Self::Permanent(PermanentError::Mailbox(error.to_string()))
        } else {
            Self::Temporary(TemporaryError::Mailbox(error.to_string()))
        }
    }
}

impl From<DkimError> for DeliveryError {
    fn from(error: DkimError) -> Self {
        Self::Temporary(TemporaryError::Dkim(error.to_string()))
    }
}
