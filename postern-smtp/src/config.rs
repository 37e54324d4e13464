use std::path::PathBuf;

use serde::Deserialize;

/// Certificate and key used for STARTTLS, or for the whole connection when
/// `implicit` is set
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerTls {
    pub certificate: PathBuf,
    pub key: PathBuf,
    /// Handshake immediately after accepting instead of waiting for STARTTLS
    #[serde(default)]
    pub implicit: bool,
}

impl ServerTls {
    #[must_use]
    pub fn new(certificate: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            certificate: certificate.into(),
            key: key.into(),
            implicit: false,
        }
    }

    #[must_use]
    pub const fn with_implicit(mut self, implicit: bool) -> Self {
        self.implicit = implicit;
        self
    }
}

/// Per-listener server settings.
///
/// Limits of `0` are disabled.
///
/// ```ron
/// (
///     socket: "[::]:25",
///     system_name: "mx.example.org",
///     max_databytes: 52428800,
///     helo_mandatory: true,
///     tls: Some((certificate: "cert.pem", key: "key.pem")),
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_system_name")]
    pub system_name: String,

    /// Idle timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub max_databytes: usize,

    #[serde(default = "default_max_hops")]
    pub max_hops: usize,

    #[serde(default)]
    pub max_rcpt: usize,

    #[serde(default)]
    pub max_bad_rcpt: usize,

    #[serde(default)]
    pub max_vrfy: usize,

    /// Live sessions allowed across the whole process
    #[serde(default = "default_concurrency_incoming")]
    pub concurrency_incoming: usize,

    /// Leaves the product name and version out of the greeting
    #[serde(default)]
    pub hide_server_signature: bool,

    /// Leaves the client details out of the `Received` header of
    /// authenticated submissions
    #[serde(default = "default_hide_received_from_auth")]
    pub hide_received_from_auth: bool,

    #[serde(default)]
    pub helo_mandatory: bool,

    #[serde(default)]
    pub helo_need_fqn: bool,

    /// Enforce the RFC 5321 64 character limit on the sender local part
    #[serde(default)]
    pub mailfrom_localpart_size: bool,

    #[serde(default)]
    pub tls: Option<ServerTls>,

    #[serde(default)]
    pub scan_enabled: bool,
}

fn default_system_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("localhost"))
}

const fn default_timeout() -> u64 {
    300
}

const fn default_max_hops() -> usize {
    10
}

const fn default_concurrency_incoming() -> usize {
    20
}

const fn default_hide_received_from_auth() -> bool {
    true
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            system_name: default_system_name(),
            timeout: default_timeout(),
            max_databytes: 0,
            max_hops: default_max_hops(),
            max_rcpt: 0,
            max_bad_rcpt: 0,
            max_vrfy: 0,
            concurrency_incoming: default_concurrency_incoming(),
            hide_server_signature: false,
            hide_received_from_auth: default_hide_received_from_auth(),
            helo_mandatory: false,
            helo_need_fqn: false,
            mailfrom_localpart_size: false,
            tls: None,
            scan_enabled: false,
        }
    }
}

impl SmtpConfig {
    #[must_use]
    pub fn with_system_name(mut self, system_name: impl Into<String>) -> Self {
        self.system_name = system_name.into();
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_max_databytes(mut self, max_databytes: usize) -> Self {
        self.max_databytes = max_databytes;
        self
    }

    #[must_use]
    pub const fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    #[must_use]
    pub const fn with_max_rcpt(mut self, max_rcpt: usize) -> Self {
        self.max_rcpt = max_rcpt;
        self
    }

    #[must_use]
    pub const fn with_max_bad_rcpt(mut self, max_bad_rcpt: usize) -> Self {
        self.max_bad_rcpt = max_bad_rcpt;
        self
    }

    #[must_use]
    pub const fn with_max_vrfy(mut self, max_vrfy: usize) -> Self {
        self.max_vrfy = max_vrfy;
        self
    }

    #[must_use]
    pub const fn with_concurrency_incoming(mut self, concurrency: usize) -> Self {
        self.concurrency_incoming = concurrency;
        self
    }

    #[must_use]
    pub const fn with_hide_server_signature(mut self, hide: bool) -> Self {
        self.hide_server_signature = hide;
        self
    }

    #[must_use]
    pub const fn with_hide_received_from_auth(mut self, hide: bool) -> Self {
        self.hide_received_from_auth = hide;
        self
    }

    #[must_use]
    pub const fn with_helo_mandatory(mut self, mandatory: bool) -> Self {
        self.helo_mandatory = mandatory;
        self
    }

    #[must_use]
    pub const fn with_helo_need_fqn(mut self, need_fqn: bool) -> Self {
        self.helo_need_fqn = need_fqn;
        self
    }

    #[must_use]
    pub const fn with_mailfrom_localpart_size(mut self, enforce: bool) -> Self {
        self.mailfrom_localpart_size = enforce;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: Option<ServerTls>) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub const fn with_scan_enabled(mut self, enabled: bool) -> Self {
        self.scan_enabled = enabled;
        self
    }
}
