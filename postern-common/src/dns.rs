//! Name resolution for HELO/MAIL FROM checks and outbound delivery.
//!
//! [`DnsResolver`] performs MX lookups with A/AAAA fallback per RFC 5321
//! section 5.1 and caches results in a `DashMap` for the record TTL, clamped
//! to configurable bounds. [`StaticResolver`] answers from fixed tables and
//! is used for host overrides and tests.

use std::{
    fmt::Debug,
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    ResolveError, TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    address::parse_ip_literal,
    error::{DnsError, DnsResult},
};

/// A mail exchanger for a domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServer {
    pub host: String,
    /// Lower is preferred. A/AAAA fallbacks use 0.
    pub priority: u16,
}

impl MailServer {
    #[must_use]
    pub fn new(host: impl Into<String>, priority: u16) -> Self {
        Self {
            host: host.into(),
            priority,
        }
    }
}

#[async_trait]
pub trait Resolver: Send + Sync + Debug {
    /// MX hosts for `domain` ordered by preference, or its A/AAAA records
    /// when no MX exists
    async fn mail_servers(&self, domain: &str) -> DnsResult<Arc<Vec<MailServer>>>;

    /// Addresses for `host`. IP literals are returned as-is.
    async fn lookup_ip(&self, host: &str) -> DnsResult<Vec<IpAddr>>;

    /// The PTR name of `ip`, without the trailing dot
    async fn reverse_lookup(&self, ip: IpAddr) -> DnsResult<String> {
        Err(DnsError::NotFound(ip.to_string()))
    }

    /// Whether `domain` can receive mail, distinguishing a negative answer
    /// (`Ok(false)`) from a failed lookup (`Err`)
    async fn resolves(&self, domain: &str) -> DnsResult<bool> {
        match self.mail_servers(domain).await {
            Ok(servers) => Ok(!servers.is_empty()),
            Err(DnsError::NotFound(_) | DnsError::InvalidDomain(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DnsConfig {
    /// Query timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Replaces the record TTL for every cached entry when set
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    #[serde(default = "default_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    #[serde(default = "default_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_min_cache_ttl_secs() -> u64 {
    60
}

const fn default_max_cache_ttl_secs() -> u64 {
    3600
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: default_min_cache_ttl_secs(),
            max_cache_ttl_secs: default_max_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

fn lookup_error(domain: &str, err: &ResolveError) -> DnsError {
    if err.is_no_records_found() || err.is_nx_domain() {
        DnsError::NotFound(domain.to_string())
    } else {
        DnsError::LookupFailed {
            domain: domain.to_string(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    cache: DashMap<String, CachedResult>,
    config: DnsConfig,
}

impl DnsResolver {
    /// Builds a resolver from the system configuration
    pub fn new(config: DnsConfig) -> DnsResult<Self> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|err| DnsError::LookupFailed {
                domain: String::from("<system configuration>"),
                reason: err.to_string(),
            })?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            config,
        })
    }

    fn cache_ttl(&self, record_ttl: u32) -> Duration {
        Duration::from_secs(self.config.cache_ttl_secs.unwrap_or_else(|| {
            u64::from(record_ttl).clamp(
                self.config.min_cache_ttl_secs,
                self.config.max_cache_ttl_secs,
            )
        }))
    }

    async fn resolve_uncached(&self, domain: &str) -> DnsResult<(Vec<MailServer>, u32)> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let ttl = lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(hickory_resolver::proto::rr::Record::ttl)
                    .min()
                    .unwrap_or(300);

                let mut servers = lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        MailServer::new(host.trim_end_matches('.'), mx.preference())
                    })
                    .collect::<Vec<_>>();

                if servers.is_empty() {
                    return self.fallback_to_a_aaaa(domain).await;
                }

                servers.sort_by_key(|s| s.priority);
                Ok((servers, ttl))
            }
            Err(err) if err.is_no_records_found() => {
                debug!("No MX records for {domain}, falling back to A/AAAA");
                self.fallback_to_a_aaaa(domain).await
            }
            Err(err) => {
                warn!("MX lookup failed for {domain}: {err}");
                Err(lookup_error(domain, &err))
            }
        }
    }

    async fn fallback_to_a_aaaa(&self, domain: &str) -> DnsResult<(Vec<MailServer>, u32)> {
        let lookup = self
            .resolver
            .lookup_ip(domain)
            .await
            .map_err(|err| lookup_error(domain, &err))?;

        #[allow(clippy::redundant_closure_for_method_calls)]
        let ttl = lookup
            .as_lookup()
            .records()
            .iter()
            .map(|r| r.ttl())
            .min()
            .unwrap_or(300);

        let servers = lookup
            .iter()
            .map(|ip| MailServer::new(ip.to_string(), 0))
            .collect::<Vec<_>>();

        if servers.is_empty() {
            Err(DnsError::NotFound(domain.to_string()))
        } else {
            Ok((servers, ttl))
        }
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn mail_servers(&self, domain: &str) -> DnsResult<Arc<Vec<MailServer>>> {
        if domain.is_empty() {
            return Err(DnsError::InvalidDomain(domain.to_string()));
        }

        if let Some(cached) = self.cache.get(domain) {
            if cached.expires_at > Instant::now() {
                return Ok(Arc::clone(&cached.servers));
            }
        }

        let (servers, ttl) = self.resolve_uncached(domain).await?;
        let servers = Arc::new(servers);

        self.cache.insert(
            domain.to_string(),
            CachedResult {
                servers: Arc::clone(&servers),
                expires_at: Instant::now() + self.cache_ttl(ttl),
            },
        );

        Ok(servers)
    }

    async fn lookup_ip(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
        if let Some(ip) = parse_ip_literal(host) {
            return Ok(vec![ip]);
        }

        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|err| lookup_error(host, &err))?;

        Ok(lookup.iter().collect())
    }

    async fn reverse_lookup(&self, ip: IpAddr) -> DnsResult<String> {
        let lookup = self
            .resolver
            .reverse_lookup(ip)
            .await
            .map_err(|err| lookup_error(&ip.to_string(), &err))?;

        lookup
            .iter()
            .next()
            .map(|name| name.to_utf8().trim_end_matches('.').to_string())
            .ok_or_else(|| DnsError::NotFound(ip.to_string()))
    }
}

/// Answers from fixed tables. Unknown names are `NotFound`.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    mail_servers: AHashMap<String, Arc<Vec<MailServer>>>,
    hosts: AHashMap<String, Vec<IpAddr>>,
    failing: Vec<String>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_mail_servers(mut self, domain: &str, servers: Vec<MailServer>) -> Self {
        self.mail_servers
            .insert(domain.to_ascii_lowercase(), Arc::new(servers));
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: &str, addresses: Vec<IpAddr>) -> Self {
        self.hosts.insert(host.to_ascii_lowercase(), addresses);
        self
    }

    /// Every lookup for `name` fails as if the upstream server timed out
    #[must_use]
    pub fn with_failure(mut self, name: &str) -> Self {
        self.failing.push(name.to_ascii_lowercase());
        self
    }

    fn check_failure(&self, name: &str) -> DnsResult<()> {
        if self.failing.iter().any(|f| f == name) {
            return Err(DnsError::LookupFailed {
                domain: name.to_string(),
                reason: String::from("simulated failure"),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn mail_servers(&self, domain: &str) -> DnsResult<Arc<Vec<MailServer>>> {
        let domain = domain.to_ascii_lowercase();
        self.check_failure(&domain)?;

        if let Some(servers) = self.mail_servers.get(&domain) {
            return Ok(Arc::clone(servers));
        }

        self.hosts
            .get(&domain)
            .map(|ips| {
                Arc::new(
                    ips.iter()
                        .map(|ip| MailServer::new(ip.to_string(), 0))
                        .collect(),
                )
            })
            .ok_or(DnsError::NotFound(domain))
    }

    async fn lookup_ip(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
        if let Some(ip) = parse_ip_literal(host) {
            return Ok(vec![ip]);
        }

        let host = host.to_ascii_lowercase();
        self.check_failure(&host)?;

        self.hosts
            .get(&host)
            .cloned()
            .ok_or(DnsError::NotFound(host))
    }
}
