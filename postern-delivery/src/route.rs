//! Choosing and dialling the next hop of a remote delivery.
//!
//! Routes come from the directory, or from the MX records of the recipient
//! domain when none are configured. Each route names the remote host and the
//! local addresses to bind: a single IP, an `&`-joined failover list tried in
//! order, or a `|`-joined list tried in random order. Local and remote
//! addresses are only paired within the same address family.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use postern_common::{address::parse_ip_literal, dns::Resolver, internal};
use postern_spool::{Directory, Route};
use postern_tracing::traced;
use rand::seq::SliceRandom;
use tokio::net::{TcpSocket, TcpStream};

use crate::error::{DeliveryError, TemporaryError};

#[derive(Debug, Clone)]
pub struct RouteSelector {
    directory: Arc<dyn Directory>,
    resolver: Arc<dyn Resolver>,
    /// Local addresses for MX routes, in route syntax
    local_ips: String,
    connect_timeout: Duration,
}

impl RouteSelector {
    pub fn new(directory: Arc<dyn Directory>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            directory,
            resolver,
            local_ips: String::new(),
            connect_timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_local_ips(mut self, local_ips: impl Into<String>) -> Self {
        self.local_ips = local_ips.into();
        self
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Configured routes for the message, falling back to the MX hosts of
    /// `host`
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "ms"))]
    pub async fn routes(
        &self,
        mail_from: &str,
        host: &str,
        auth_user: Option<&str>,
    ) -> Result<Vec<Route>, DeliveryError> {
        let routes = self.directory.routes(mail_from, host, auth_user).await?;
        if !routes.is_empty() {
            return Ok(routes);
        }

        let servers = self.resolver.mail_servers(host).await?;
        let routes = servers
            .iter()
            .map(|server| {
                Route::new(host, server.host.clone())
                    .with_priority(u32::from(server.priority))
                    .with_local_ip(self.local_ips.clone())
            })
            .collect::<Vec<_>>();

        if routes.is_empty() {
            return Err(TemporaryError::NoRoute(host.to_string()).into());
        }

        Ok(routes)
    }

    /// Dials each route in turn and returns the first connection made,
    /// with the route it went through
    pub async fn connect(&self, routes: &[Route]) -> Result<(TcpStream, Route), DeliveryError> {
        for route in routes {
            let locals = local_ips(&route.local_ip)?;

            let remotes = match parse_ip_literal(&route.remote_host) {
                Some(ip) => vec![ip],
                None => match self.resolver.lookup_ip(&route.remote_host).await {
                    Ok(ips) => ips,
                    Err(err) => {
                        internal!(level = WARN, "Unable to resolve {}: {err}", route.remote_host);
                        continue;
                    }
                },
            };

            for (local, remote) in pairs(&locals, &remotes) {
                let remote = SocketAddr::new(remote, route.port());
                match self.dial(local, remote).await {
                    Ok(stream) => {
                        internal!(
                            level = DEBUG,
                            "Connected to {remote} ({}) from {}",
                            route.remote_host,
                            local.map_or_else(|| String::from("any"), |ip| ip.to_string())
                        );
                        return Ok((stream, route.clone()));
                    }
                    Err(err) => {
                        internal!(level = INFO, "Unable to connect to {remote}: {err}");
                    }
                }
            }
        }

        Err(TemporaryError::ConnectionFailed(String::from(
            "unable to get a client, all routes have been tested",
        ))
        .into())
    }

    async fn dial(&self, local: Option<IpAddr>, remote: SocketAddr) -> std::io::Result<TcpStream> {
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Some(local) = local {
            socket.bind(SocketAddr::new(local, 0))?;
        }

        tokio::time::timeout(self.connect_timeout, socket.connect(remote))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))?
    }
}

/// Parses the local IP list of a route. `None` lets the OS choose.
pub fn local_ips(list: &str) -> Result<Vec<Option<IpAddr>>, TemporaryError> {
    let list = list.trim();
    if list.is_empty() {
        return Ok(vec![None]);
    }

    if list.contains('&') && list.contains('|') {
        return Err(TemporaryError::InvalidRoute(format!(
            "mixing & and | are not allowed in local IP routes: {list}"
        )));
    }

    let round_robin = list.contains('|');
    let mut ips = list
        .split(['&', '|'])
        .map(|ip| {
            ip.trim().parse::<IpAddr>().map(Some).map_err(|_| {
                TemporaryError::InvalidRoute(format!(
                    "invalid IP {} found in local IP routes: {list}",
                    ip.trim()
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if round_robin {
        ips.shuffle(&mut rand::rng());
    }

    Ok(ips)
}

/// Every usable (local, remote) pair in dialling order. An unspecified
/// local address pairs with any remote.
#[must_use]
pub fn pairs(locals: &[Option<IpAddr>], remotes: &[IpAddr]) -> Vec<(Option<IpAddr>, IpAddr)> {
    locals
        .iter()
        .flat_map(|local| {
            remotes
                .iter()
                .filter(move |remote| local.is_none_or(|local| local.is_ipv4() == remote.is_ipv4()))
                .map(move |remote| (*local, *remote))
        })
        .collect()
}
