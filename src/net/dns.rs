//! Outbound name resolution through a randomly selected nameserver.
//!
//! # Responsibilities
//! - Hold the configured nameserver set (immutable after startup)
//! - Pick one nameserver uniformly at random per resolution
//! - Fall back to the system resolver when no nameservers are configured
//! - Act as the DNS hook of the forwarding client's connector
//!
//! # Design Decisions
//! - One hickory resolver per nameserver, built once; selection is lock-free
//! - No memory of previous picks and no failure tracking

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use hyper_util::client::legacy::connect::dns::Name;
use rand::Rng;

use crate::error::{ProxyError, Result};

/// A configured nameserver and its resolver client.
pub struct Nameserver {
    addr: SocketAddr,
    resolver: TokioAsyncResolver,
}

impl Nameserver {
    fn new(addr: SocketAddr) -> Self {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));

        Self {
            addr,
            resolver: TokioAsyncResolver::tokio(config, ResolverOpts::default()),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl std::fmt::Debug for Nameserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nameserver").field("addr", &self.addr).finish()
    }
}

/// Random nameserver chooser used for every outbound dial.
#[derive(Debug, Default)]
pub struct ResolverSelector {
    nameservers: Vec<Nameserver>,
}

impl ResolverSelector {
    pub fn new(addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            nameservers: addrs.into_iter().map(Nameserver::new).collect(),
        }
    }

    /// Build from configured `ip:port` strings.
    pub fn from_config(nameservers: &[String]) -> Result<Self> {
        let addrs = nameservers
            .iter()
            .map(|ns| {
                ns.parse::<SocketAddr>()
                    .map_err(|_| ProxyError::InvalidTarget(format!("nameserver `{ns}`")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(addrs))
    }

    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.nameservers.iter().map(Nameserver::addr).collect()
    }

    /// Pick a nameserver uniformly at random, or `None` if none are configured.
    pub fn select(&self) -> Option<&Nameserver> {
        if self.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..self.nameservers.len());
        self.nameservers.get(index)
    }

    /// Resolve `host` to socket addresses carrying `port`.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let addrs: Vec<SocketAddr> = match self.select() {
            Some(ns) => {
                tracing::trace!(host = %host, nameserver = %ns.addr, "Resolving via nameserver");
                ns.resolver
                    .lookup_ip(host)
                    .await
                    .map_err(|e| ProxyError::Resolve {
                        host: host.to_string(),
                        reason: e.to_string(),
                    })?
                    .iter()
                    .map(|ip| SocketAddr::new(ip, port))
                    .collect()
            }
            None => tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| ProxyError::Resolve {
                    host: host.to_string(),
                    reason: e.to_string(),
                })?
                .collect(),
        };

        if addrs.is_empty() {
            return Err(ProxyError::Resolve {
                host: host.to_string(),
                reason: "no addresses".to_string(),
            });
        }
        Ok(addrs)
    }
}

/// Adapter exposing a [`ResolverSelector`] as the connector's DNS hook.
///
/// The connector fills in the port after resolution.
#[derive(Debug, Clone)]
pub struct SelectingResolver {
    selector: Arc<ResolverSelector>,
}

impl SelectingResolver {
    pub fn new(selector: Arc<ResolverSelector>) -> Self {
        Self { selector }
    }
}

impl tower::Service<Name> for SelectingResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let selector = Arc::clone(&self.selector);
        Box::pin(async move {
            selector
                .resolve(name.as_str(), 0)
                .await
                .map(Vec::into_iter)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        })
    }
}
