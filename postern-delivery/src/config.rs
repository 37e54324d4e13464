//! Delivery configuration, read from the `delivery` section of the
//! configuration file.

use std::{path::PathBuf, time::Duration};

use postern_common::{config::TlsConfig, dns::DnsConfig};
use serde::Deserialize;

use crate::dkim::DkimKeyConfig;

fn default_me() -> String {
    String::from("localhost")
}

const fn default_concurrency_local() -> usize {
    10
}

const fn default_remote_concurrency() -> usize {
    50
}

/// One week
const fn default_queue_lifetime_minutes() -> u64 {
    10080
}

const fn default_retry_increment_secs() -> u64 {
    60
}

const fn default_remote_timeout_secs() -> u64 {
    300
}

const fn default_connect_timeout_secs() -> u64 {
    30
}

const fn default_sweep_interval_secs() -> u64 {
    300
}

const fn default_sweep_grace_secs() -> u64 {
    60
}

fn default_maildir_path() -> PathBuf {
    PathBuf::from("/var/lib/postern/mailboxes")
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeliveryConfig {
    /// Name announced in EHLO, Received headers and bounces
    #[serde(default = "default_me")]
    pub me: String,

    /// Workers reserved for local deliveries when `workers` is unset
    #[serde(default = "default_concurrency_local")]
    pub concurrency_local: usize,

    /// Size of the worker pool. Defaults to local plus remote concurrency.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Remote conversations allowed at once
    #[serde(default = "default_remote_concurrency")]
    pub remote_concurrency: usize,

    /// How long a message may stay queued before temporary failures become
    /// permanent
    #[serde(default = "default_queue_lifetime_minutes")]
    pub queue_lifetime_minutes: u64,

    /// Added to the retry delay on every attempt
    #[serde(default = "default_retry_increment_secs")]
    pub retry_increment_secs: u64,

    /// How long to wait for each reply of a remote server
    #[serde(default = "default_remote_timeout_secs")]
    pub remote_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Local addresses used by default MX routes, in route syntax
    #[serde(default)]
    pub local_ips: String,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub dkim_sign: bool,

    #[serde(default)]
    pub dkim_keys: Vec<DkimKeyConfig>,

    /// Root of the local mailboxes, one maildir per address
    #[serde(default = "default_maildir_path")]
    pub maildir_path: PathBuf,

    /// How often queued records are checked for lost jobs
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// A record must have been due this long before a sweep republishes it,
    /// which leaves records still being submitted or requeued alone
    #[serde(default = "default_sweep_grace_secs")]
    pub sweep_grace_secs: u64,

    #[serde(default)]
    pub dns: DnsConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            me: default_me(),
            concurrency_local: default_concurrency_local(),
            workers: None,
            remote_concurrency: default_remote_concurrency(),
            queue_lifetime_minutes: default_queue_lifetime_minutes(),
            retry_increment_secs: default_retry_increment_secs(),
            remote_timeout_secs: default_remote_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            local_ips: String::new(),
            tls: TlsConfig::default(),
            dkim_sign: false,
            dkim_keys: Vec::new(),
            maildir_path: default_maildir_path(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_grace_secs: default_sweep_grace_secs(),
            dns: DnsConfig::default(),
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub fn with_me(mut self, me: impl Into<String>) -> Self {
        self.me = me.into();
        self
    }

    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    #[must_use]
    pub const fn with_remote_concurrency(mut self, concurrency: usize) -> Self {
        self.remote_concurrency = concurrency;
        self
    }

    #[must_use]
    pub const fn with_queue_lifetime_minutes(mut self, minutes: u64) -> Self {
        self.queue_lifetime_minutes = minutes;
        self
    }

    #[must_use]
    pub const fn with_retry_increment_secs(mut self, secs: u64) -> Self {
        self.retry_increment_secs = secs;
        self
    }

    #[must_use]
    pub const fn with_remote_timeout_secs(mut self, secs: u64) -> Self {
        self.remote_timeout_secs = secs;
        self
    }

    #[must_use]
    pub const fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_local_ips(mut self, local_ips: impl Into<String>) -> Self {
        self.local_ips = local_ips.into();
        self
    }

    #[must_use]
    pub const fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub const fn with_dkim_sign(mut self, sign: bool) -> Self {
        self.dkim_sign = sign;
        self
    }

    #[must_use]
    pub fn with_maildir_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.maildir_path = path.into();
        self
    }

    #[must_use]
    pub const fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    #[must_use]
    pub const fn with_sweep_grace_secs(mut self, secs: u64) -> Self {
        self.sweep_grace_secs = secs;
        self
    }

    /// Number of delivery workers to run, never zero
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or(self.concurrency_local + self.remote_concurrency)
            .max(1)
    }

    #[must_use]
    pub const fn queue_lifetime(&self) -> Duration {
        Duration::from_secs(self.queue_lifetime_minutes * 60)
    }

    #[must_use]
    pub const fn retry_increment(&self) -> Duration {
        Duration::from_secs(self.retry_increment_secs)
    }

    #[must_use]
    pub const fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    pub const fn sweep_grace(&self) -> Duration {
        Duration::from_secs(self.sweep_grace_secs)
    }
}
