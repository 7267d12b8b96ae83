//! Name resolution for DIRECT connections.
//!
//! Queries the configured nameservers first and the fallback servers when
//! the primary lookup fails or comes back empty. Without any usable
//! nameserver the system resolver is used. Tunnelled destinations are
//! resolved by the node, never here.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::tunnel::Address;

/// DNS port used when an entry has none
const DNS_PORT: u16 = 53;

/// Nameserver lists from the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    /// Primary nameservers (`1.1.1.1`, `udp://8.8.8.8:53`, `[2606:4700::1111]:53`)
    #[serde(alias = "nameserver")]
    pub nameservers: Vec<String>,
    /// Servers queried when the primaries fail
    pub fallback: Vec<String>,
    /// Per-query timeout in milliseconds
    pub timeout_ms: Option<u64>,
}

/// Resolver for DIRECT destinations.
pub struct Resolver {
    primary: Option<TokioAsyncResolver>,
    fallback: Option<TokioAsyncResolver>,
}

impl Resolver {
    /// Build a resolver from configured nameserver lists.
    ///
    /// Entries the resolver cannot use (e.g. `https://` or `tls://`) are
    /// skipped with a warning; an entry that is not an address at all is a
    /// configuration error.
    pub fn new(settings: &DnsSettings) -> Result<Self> {
        let mut opts = ResolverOpts::default();
        if let Some(ms) = settings.timeout_ms {
            opts.timeout = Duration::from_millis(ms);
        }

        let primary = build_resolver(&settings.nameservers, &opts)?;
        let fallback = build_resolver(&settings.fallback, &opts)?;

        if primary.is_none() && fallback.is_none() {
            tracing::info!("Using system DNS resolver");
        }

        Ok(Self { primary, fallback })
    }

    /// Resolver that always uses the system configuration.
    pub fn system() -> Self {
        Self {
            primary: None,
            fallback: None,
        }
    }

    /// Resolve `host` to socket addresses on `port`.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        for resolver in [&self.primary, &self.fallback].into_iter().flatten() {
            match resolver.lookup_ip(host).await {
                Ok(lookup) => {
                    let addrs: Vec<SocketAddr> =
                        lookup.iter().map(|ip| SocketAddr::new(ip, port)).collect();
                    if !addrs.is_empty() {
                        return Ok(addrs);
                    }
                }
                Err(e) => tracing::debug!("DNS lookup for {} failed: {}", host, e),
            }
        }

        if self.primary.is_some() || self.fallback.is_some() {
            return Err(Error::Dns(format!("no addresses for {}", host)));
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::Dns(format!("{}: {}", host, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::Dns(format!("no addresses for {}", host)));
        }
        Ok(addrs)
    }

    /// Resolve and connect within `deadline`.
    ///
    /// Resolution is bounded by `deadline` as well; each resolved address
    /// then gets its own `deadline` to connect.
    pub async fn connect(&self, target: &Address, deadline: Duration) -> Result<TcpStream> {
        let addrs = match target {
            Address::Socket(addr) => vec![*addr],
            Address::Domain(host, port) => timeout(deadline, self.resolve(host, *port))
                .await
                .map_err(|_| Error::Timeout(deadline.as_millis() as u64))??,
        };

        let mut last_err = None;
        for addr in addrs {
            match timeout(deadline, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(Error::Network(e)),
                Err(_) => last_err = Some(Error::Timeout(deadline.as_millis() as u64)),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Dns(format!("no addresses for {}", target))))
    }
}

fn build_resolver(entries: &[String], opts: &ResolverOpts) -> Result<Option<TokioAsyncResolver>> {
    let mut group: Option<NameServerConfigGroup> = None;

    for entry in entries {
        let Some(addr) = parse_nameserver(entry)? else {
            tracing::warn!("Skipping unsupported nameserver: {}", entry);
            continue;
        };
        let servers = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
        match group.as_mut() {
            Some(existing) => existing.merge(servers),
            None => group = Some(servers),
        }
    }

    Ok(group.map(|servers| {
        let config = ResolverConfig::from_parts(None, vec![], servers);
        TokioAsyncResolver::tokio(config, opts.clone())
    }))
}

/// Parse a nameserver entry. `Ok(None)` for schemes this resolver skips.
fn parse_nameserver(entry: &str) -> Result<Option<SocketAddr>> {
    let entry = entry.trim();
    let plain = match entry.split_once("://") {
        Some(("udp", rest)) | Some(("tcp", rest)) => rest,
        Some(_) => return Ok(None),
        None => entry,
    };

    if let Ok(addr) = plain.parse::<SocketAddr>() {
        return Ok(Some(addr));
    }
    if let Ok(ip) = plain.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return Ok(Some(SocketAddr::new(ip, DNS_PORT)));
    }
    Err(Error::config(format!("invalid nameserver: {}", entry)))
}
