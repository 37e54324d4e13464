//! TLS settings for outbound connections.

use serde::{Deserialize, Serialize};

/// How STARTTLS is negotiated when delivering to a remote server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
    /// Use STARTTLS when advertised and reconnect in plaintext if the
    /// handshake fails (RFC 3207 section 4.1).
    Opportunistic,

    /// Use STARTTLS when advertised. A failed handshake is a temporary
    /// delivery failure.
    #[default]
    Strict,

    /// Never use TLS.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub policy: TlsPolicy,

    /// Skip certificate verification. Only meant for testing against
    /// self-signed certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl TlsConfig {
    #[must_use]
    pub const fn new(policy: TlsPolicy) -> Self {
        Self {
            policy,
            accept_invalid_certs: false,
        }
    }

    #[must_use]
    pub const fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Whether a failed handshake may be retried without TLS
    #[must_use]
    pub const fn allows_fallback(&self) -> bool {
        matches!(self.policy, TlsPolicy::Opportunistic)
    }

    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        matches!(self.policy, TlsPolicy::Disabled)
    }
}
