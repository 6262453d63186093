//! Address pool
//!
//! Turns one server specifier into a round-robin sequence of socket
//! addresses. Specifiers are `host:port`, `[v6]:port`, or `@name` for an
//! SRV lookup (prefixed with `_<service>._tcp.` in RFC 2782 mode).
//! Resolved addresses are reused until the list is exhausted or the TTL
//! passes, then resolved again.
//!
//! Resolution happens outside the pool lock so status readers and
//! method policies never wait on DNS.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

/// Errors raised while resolving a server specifier
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid server specifier '{0}'")]
    InvalidSpecifier(String),

    #[error("invalid port in server specifier '{0}'")]
    InvalidPort(String),

    #[error("lookup of '{name}' failed: {message}")]
    Lookup { name: String, message: String },

    #[error("'{0}' resolved to no addresses")]
    NoAddresses(String),
}

impl PoolError {
    pub fn lookup(name: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Lookup {
            name: name.into(),
            message: message.to_string(),
        }
    }
}

/// One SRV answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub target: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

/// DNS lookups used by the pool
#[async_trait]
pub trait Resolver: Send + Sync {
    /// A/AAAA lookup
    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>, PoolError>;

    /// SRV lookup
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvTarget>, PoolError>;
}

/// Resolver backed by the system DNS configuration
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    /// Use `/etc/resolv.conf`, falling back to public defaults
    pub fn new() -> Self {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to read system resolver config, using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { inner }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>, PoolError> {
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|e| PoolError::lookup(host, e))?;
        Ok(lookup.iter().collect())
    }

    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvTarget>, PoolError> {
        let lookup = self
            .inner
            .srv_lookup(name)
            .await
            .map_err(|e| PoolError::lookup(name, e))?;
        Ok(lookup
            .iter()
            .map(|srv| SrvTarget {
                target: srv.target().to_utf8(),
                port: srv.port(),
                priority: srv.priority(),
                weight: srv.weight(),
            })
            .collect())
    }
}

/// A resolved address with the name it came from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub addr: SocketAddr,
    /// Host name used for TLS verification and the HTTP Host header
    pub host: String,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.parse::<IpAddr>().is_ok() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{} ({})", self.host, self.addr)
        }
    }
}

/// Parsed form of a server specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Specifier {
    Srv(String),
    Host { host: String, port: u16 },
}

pub(crate) fn parse_specifier(server: &str) -> Result<Specifier, PoolError> {
    if let Some(name) = server.strip_prefix('@') {
        if name.is_empty() {
            return Err(PoolError::InvalidSpecifier(server.to_string()));
        }
        return Ok(Specifier::Srv(name.to_string()));
    }

    let (host, port) = if let Some(rest) = server.strip_prefix('[') {
        rest.split_once("]:")
            .ok_or_else(|| PoolError::InvalidSpecifier(server.to_string()))?
    } else {
        let (host, port) = server
            .rsplit_once(':')
            .ok_or_else(|| PoolError::InvalidSpecifier(server.to_string()))?;
        if host.contains(':') {
            return Err(PoolError::InvalidSpecifier(server.to_string()));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(PoolError::InvalidSpecifier(server.to_string()));
    }
    let port = match port.parse::<u16>() {
        Ok(p) if p > 0 => p,
        _ => return Err(PoolError::InvalidPort(server.to_string())),
    };

    Ok(Specifier::Host {
        host: host.to_string(),
        port,
    })
}

#[derive(Default)]
struct PoolState {
    addresses: Vec<Address>,
    position: usize,
    resolved_at: Option<Instant>,
}

impl PoolState {
    fn exhausted(&self, ttl: Duration) -> bool {
        match self.resolved_at {
            None => true,
            Some(at) => self.position >= self.addresses.len() || at.elapsed() >= ttl,
        }
    }
}

/// Round-robin addresses for one server specifier
pub struct AddressPool {
    server: String,
    srv_service: Option<String>,
    ttl: Duration,
    resolver: Arc<dyn Resolver>,
    state: Mutex<PoolState>,
}

impl AddressPool {
    /// Create a pool
    ///
    /// `srv_service` enables RFC 2782 formatting of `@name` lookups.
    pub fn new(
        server: impl Into<String>,
        srv_service: Option<String>,
        ttl: Duration,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            server: server.into(),
            srv_service,
            ttl,
            resolver,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Server specifier this pool resolves
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Next address, resolving again when the cached list is used up or stale
    pub async fn next(&self) -> Result<Address, PoolError> {
        {
            let mut state = self.state.lock();
            if !state.exhausted(self.ttl) {
                let address = state.addresses[state.position].clone();
                state.position += 1;
                return Ok(address);
            }
        }

        let resolved = self.resolve().await;

        let mut state = self.state.lock();
        match resolved {
            Ok(addresses) => {
                tracing::debug!(server = %self.server, count = addresses.len(), "resolved server");
                state.addresses = addresses;
                state.position = 1;
                state.resolved_at = Some(Instant::now());
                Ok(state.addresses[0].clone())
            }
            Err(e) => {
                // Start the next call with a fresh pass
                state.addresses.clear();
                state.position = 0;
                state.resolved_at = None;
                Err(e)
            }
        }
    }

    /// Whether the next call to [`next`](Self::next) starts a fresh resolution pass
    pub fn is_last(&self) -> bool {
        self.state.lock().exhausted(self.ttl)
    }

    async fn resolve(&self) -> Result<Vec<Address>, PoolError> {
        let addresses = match parse_specifier(&self.server)? {
            Specifier::Host { host, port } => self.resolve_host(&host, port).await?,
            Specifier::Srv(name) => self.resolve_srv(&name).await?,
        };
        if addresses.is_empty() {
            return Err(PoolError::NoAddresses(self.server.clone()));
        }
        Ok(addresses)
    }

    async fn resolve_host(&self, host: &str, port: u16) -> Result<Vec<Address>, PoolError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![Address {
                addr: SocketAddr::new(ip, port),
                host: host.to_string(),
            }]);
        }

        let ips = self.resolver.lookup_host(host).await?;
        Ok(ips
            .into_iter()
            .map(|ip| Address {
                addr: SocketAddr::new(ip, port),
                host: host.to_string(),
            })
            .collect())
    }

    async fn resolve_srv(&self, name: &str) -> Result<Vec<Address>, PoolError> {
        let lookup_name = match &self.srv_service {
            Some(service) => format!("_{service}._tcp.{name}"),
            None => name.to_string(),
        };

        let mut targets = self.resolver.lookup_srv(&lookup_name).await?;
        targets.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));

        let mut addresses = Vec::new();
        let mut last_error = None;
        for target in targets {
            let host = target.target.trim_end_matches('.');
            match self.resolve_host(host, target.port).await {
                Ok(resolved) => addresses.extend(resolved),
                Err(e) => {
                    tracing::warn!(server = %self.server, target = %host, error = %e, "SRV target lookup failed");
                    last_error = Some(e);
                }
            }
        }

        match (addresses.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(addresses),
        }
    }
}

impl fmt::Debug for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressPool")
            .field("server", &self.server)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
