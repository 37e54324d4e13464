//! Users, recipient hosts, local mailboxes, relay addresses and routes.

use std::{
    collections::BTreeSet,
    fmt::Debug,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use postern_common::internal;
use serde::{Deserialize, Serialize};

use crate::{DirectoryError, DirectoryResult};

/// An account allowed to authenticate against the SMTP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    /// bcrypt hash of the password
    pub password_hash: String,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Authenticated sessions of this user may relay to any domain
    #[serde(default)]
    pub auth_relay: bool,
}

const fn default_true() -> bool {
    true
}

/// A domain this server accepts mail for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcptHost {
    pub hostname: String,
    /// Delivered to local mailboxes rather than relayed
    #[serde(default)]
    pub is_local: bool,
}

/// How to reach the next hop for a recipient domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Recipient domain, or `*` for any domain
    pub host: String,
    /// Only applies to this sender address or sender domain
    #[serde(default)]
    pub mail_from: Option<String>,
    /// Only applies to messages submitted by this authenticated user
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub priority: u32,
    /// A single address, a `&` separated failover list or a `|` separated
    /// round-robin list. Empty lets the OS pick.
    #[serde(default)]
    pub local_ip: String,
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub smtp_auth_login: Option<String>,
    #[serde(default)]
    pub smtp_auth_passwd: Option<String>,
}

impl Route {
    pub const DEFAULT_PORT: u16 = 25;

    #[must_use]
    pub fn new(host: impl Into<String>, remote_host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            mail_from: None,
            user: None,
            priority: 0,
            local_ip: String::new(),
            remote_host: remote_host.into(),
            remote_port: None,
            smtp_auth_login: None,
            smtp_auth_passwd: None,
        }
    }

    #[must_use]
    pub fn with_local_ip(mut self, local_ip: impl Into<String>) -> Self {
        self.local_ip = local_ip.into();
        self
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.remote_port = Some(port);
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.smtp_auth_login = Some(login.into());
        self.smtp_auth_passwd = Some(password.into());
        self
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.remote_port.unwrap_or(Self::DEFAULT_PORT)
    }

    /// Login and password, when both are configured
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.smtp_auth_login
            .as_deref()
            .zip(self.smtp_auth_passwd.as_deref())
    }

    fn matches(&self, mail_from: &str, auth_user: Option<&str>) -> bool {
        let sender = self.mail_from.as_deref().is_none_or(|wanted| {
            wanted.eq_ignore_ascii_case(mail_from)
                || mail_from
                    .rsplit_once('@')
                    .is_some_and(|(_, domain)| wanted.eq_ignore_ascii_case(domain))
        });

        let user = self
            .user
            .as_deref()
            .is_none_or(|wanted| auth_user == Some(wanted));

        sender && user
    }
}

#[async_trait]
pub trait Directory: Send + Sync + Debug {
    /// Fails with [`DirectoryError::NotFound`] for an unknown login
    async fn user(&self, login: &str) -> DirectoryResult<User>;

    async fn mailbox_exists(&self, address: &str) -> DirectoryResult<bool>;

    /// `None` when this server does not handle `host`
    async fn rcpt_host(&self, host: &str) -> DirectoryResult<Option<RcptHost>>;

    async fn is_local_domain(&self, host: &str) -> DirectoryResult<bool> {
        Ok(self
            .rcpt_host(host)
            .await?
            .is_some_and(|rcpt_host| rcpt_host.is_local))
    }

    async fn relay_ip_allowed(&self, ip: IpAddr) -> DirectoryResult<bool>;

    /// Routes for a message, lowest priority value first. Empty when no route
    /// is configured for `host`.
    async fn routes(
        &self,
        mail_from: &str,
        host: &str,
        auth_user: Option<&str>,
    ) -> DirectoryResult<Vec<Route>>;

    async fn add_relay_ip(&self, ip: &str) -> DirectoryResult<()>;

    async fn remove_relay_ip(&self, ip: &str) -> DirectoryResult<()>;

    async fn relay_ips(&self) -> DirectoryResult<Vec<IpAddr>>;
}

/// The contents of a directory file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryData {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub rcpt_hosts: Vec<RcptHost>,
    #[serde(default)]
    pub mailboxes: Vec<String>,
    #[serde(default)]
    pub relay_ips: BTreeSet<IpAddr>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl DirectoryData {
    #[must_use]
    pub fn with_user(mut self, user: User) -> Self {
        self.users.push(user);
        self
    }

    #[must_use]
    pub fn with_rcpt_host(mut self, hostname: impl Into<String>, is_local: bool) -> Self {
        self.rcpt_hosts.push(RcptHost {
            hostname: hostname.into(),
            is_local,
        });
        self
    }

    #[must_use]
    pub fn with_mailbox(mut self, address: impl Into<String>) -> Self {
        self.mailboxes.push(address.into());
        self
    }

    #[must_use]
    pub fn with_relay_ip(mut self, ip: IpAddr) -> Self {
        self.relay_ips.insert(ip);
        self
    }

    #[must_use]
    pub fn with_route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }
}

/// A [`Directory`] held in memory, optionally backed by a RON file that is
/// rewritten whenever the relay list changes
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    data: Arc<RwLock<DirectoryData>>,
    path: Option<PathBuf>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new(data: DirectoryData) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            path: None,
        }
    }

    /// Loads `path`, starting empty when the file does not exist yet
    pub fn load(path: impl AsRef<Path>) -> DirectoryResult<Self> {
        let path = path.as_ref();

        let data = match std::fs::read_to_string(path) {
            Ok(contents) => ron::from_str(&contents)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                internal!(
                    level = WARN,
                    "Directory file {} does not exist, starting empty",
                    path.display()
                );
                DirectoryData::default()
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            data: Arc::new(RwLock::new(data)),
            path: Some(path.to_path_buf()),
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> DirectoryData {
        self.data.read().clone()
    }

    fn save(&self) -> DirectoryResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let contents = ron::ser::to_string_pretty(&*self.data.read(), ron::ser::PrettyConfig::default())?;
        let temp = path.with_extension("tmp");
        std::fs::write(&temp, contents)?;
        std::fs::rename(&temp, path)?;

        Ok(())
    }
}

fn parse_ip(ip: &str) -> DirectoryResult<IpAddr> {
    ip.trim()
        .parse()
        .map_err(|_| DirectoryError::InvalidAddress(ip.to_string()))
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn user(&self, login: &str) -> DirectoryResult<User> {
        self.data
            .read()
            .users
            .iter()
            .find(|user| user.login == login)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(login.to_string()))
    }

    async fn mailbox_exists(&self, address: &str) -> DirectoryResult<bool> {
        Ok(self
            .data
            .read()
            .mailboxes
            .iter()
            .any(|mailbox| mailbox.eq_ignore_ascii_case(address)))
    }

    async fn rcpt_host(&self, host: &str) -> DirectoryResult<Option<RcptHost>> {
        Ok(self
            .data
            .read()
            .rcpt_hosts
            .iter()
            .find(|rcpt_host| rcpt_host.hostname.eq_ignore_ascii_case(host))
            .cloned())
    }

    async fn relay_ip_allowed(&self, ip: IpAddr) -> DirectoryResult<bool> {
        Ok(self.data.read().relay_ips.contains(&ip))
    }

    async fn routes(
        &self,
        mail_from: &str,
        host: &str,
        auth_user: Option<&str>,
    ) -> DirectoryResult<Vec<Route>> {
        let data = self.data.read();

        let for_host = |wanted: &str| {
            data.routes
                .iter()
                .filter(|route| route.host.eq_ignore_ascii_case(wanted))
                .filter(|route| route.matches(mail_from, auth_user))
                .cloned()
                .collect::<Vec<_>>()
        };

        let mut routes = for_host(host);
        if routes.is_empty() {
            routes = for_host("*");
        }

        for route in &routes {
            if route.remote_host.is_empty() {
                return Err(DirectoryError::InvalidRoute(format!(
                    "route for {} has no remote host",
                    route.host
                )));
            }
        }

        routes.sort_by_key(|route| route.priority);
        Ok(routes)
    }

    async fn add_relay_ip(&self, ip: &str) -> DirectoryResult<()> {
        let ip = parse_ip(ip)?;
        self.data.write().relay_ips.insert(ip);
        internal!(level = INFO, "Added {ip} to the relay list");
        self.save()
    }

    async fn remove_relay_ip(&self, ip: &str) -> DirectoryResult<()> {
        let ip = parse_ip(ip)?;
        if !self.data.write().relay_ips.remove(&ip) {
            return Err(DirectoryError::NotFound(ip.to_string()));
        }

        internal!(level = INFO, "Removed {ip} from the relay list");
        self.save()
    }

    async fn relay_ips(&self) -> DirectoryResult<Vec<IpAddr>> {
        Ok(self.data.read().relay_ips.iter().copied().collect())
    }
}
