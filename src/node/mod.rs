//! Node data model.
//!
//! A [`Node`] is a remote tunnel endpoint: identity, transport endpoint,
//! credentials, a health record mutated by the prober and the proxy server,
//! and cumulative traffic counters for reporting.

mod region;
mod registry;

pub use region::{extract_region, normalize_region};
pub use registry::{NodeReport, NodeSet, Registry, TrafficReport};

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::crypto::{CipherKind, MasterKey};
use crate::error::{Error, Result};

/// Measured round-trip latency of a node.
///
/// `Unreachable` orders after every measurement, so sorting by latency puts
/// unreachable nodes last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Latency {
    /// Successful measurement
    Measured(Duration),
    /// Last probe timed out or was refused, or no probe has run yet
    Unreachable,
}

impl Latency {
    /// Check whether this is a real measurement.
    pub fn is_reachable(&self) -> bool {
        matches!(self, Latency::Measured(_))
    }

    /// Measured duration, `None` when unreachable.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Latency::Measured(d) => Some(*d),
            Latency::Unreachable => None,
        }
    }

    /// Measurement in whole milliseconds, `None` when unreachable.
    pub fn as_millis(&self) -> Option<u64> {
        match self {
            Latency::Measured(d) => Some(d.as_millis() as u64),
            Latency::Unreachable => None,
        }
    }
}

impl PartialOrd for Latency {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Latency {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match (self, other) {
            (Latency::Measured(a), Latency::Measured(b)) => a.cmp(b),
            (Latency::Measured(_), Latency::Unreachable) => CmpOrdering::Less,
            (Latency::Unreachable, Latency::Measured(_)) => CmpOrdering::Greater,
            (Latency::Unreachable, Latency::Unreachable) => CmpOrdering::Equal,
        }
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Latency::Measured(d) => write!(f, "{}ms", d.as_millis()),
            Latency::Unreachable => f.write_str("timeout"),
        }
    }
}

/// Health record of a node.
///
/// Always read and written as one value so readers never observe a
/// half-applied update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHealth {
    /// Latest latency measurement
    pub latency: Latency,
    /// Time of the latest probe, if any
    pub last_probed: Option<SystemTime>,
    /// Failures since the last successful probe
    pub consecutive_failures: u32,
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self {
            latency: Latency::Unreachable,
            last_probed: None,
            consecutive_failures: 0,
        }
    }
}

/// Node description supplied by the configuration collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique node name
    pub name: String,
    /// Endpoint host
    pub server: String,
    /// Endpoint port
    pub port: u16,
    /// Cipher identifier (e.g. `aes-256-gcm`)
    pub cipher: String,
    /// Pre-shared secret
    pub password: String,
    /// Explicit region tag; extracted from the name when absent
    #[serde(default)]
    pub region: Option<String>,
}

impl NodeDescriptor {
    /// Create a descriptor without an explicit region.
    pub fn new(
        name: impl Into<String>,
        server: impl Into<String>,
        port: u16,
        cipher: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            port,
            cipher: cipher.into(),
            password: password.into(),
            region: None,
        }
    }

    /// Set an explicit region tag.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Cumulative byte counters of one node.
#[derive(Debug, Default)]
pub struct NodeTraffic {
    upload: AtomicU64,
    download: AtomicU64,
}

impl NodeTraffic {
    /// Count bytes sent from the client towards the node.
    pub fn add_upload(&self, bytes: u64) {
        self.upload.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count bytes received from the node towards the client.
    pub fn add_download(&self, bytes: u64) {
        self.download.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total bytes uploaded.
    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    /// Total bytes downloaded.
    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }
}

/// A remote tunnel endpoint with live health data.
pub struct Node {
    name: String,
    region: Option<String>,
    server: String,
    port: u16,
    cipher: CipherKind,
    key: MasterKey,
    health: RwLock<NodeHealth>,
    traffic: NodeTraffic,
}

impl Node {
    /// Build a node from its descriptor, deriving the master key.
    pub fn from_descriptor(desc: &NodeDescriptor) -> Result<Self> {
        if desc.name.trim().is_empty() {
            return Err(Error::config("node name cannot be empty"));
        }
        if desc.server.trim().is_empty() {
            return Err(Error::config(format!("node {}: server cannot be empty", desc.name)));
        }
        if desc.port == 0 {
            return Err(Error::config(format!("node {}: port cannot be 0", desc.name)));
        }

        let cipher: CipherKind = desc
            .cipher
            .parse()
            .map_err(|e| Error::config(format!("node {}: {}", desc.name, e)))?;

        let region = match &desc.region {
            Some(explicit) => Some(normalize_region(explicit)),
            None => extract_region(&desc.name),
        };

        Ok(Self {
            name: desc.name.clone(),
            region,
            server: desc.server.clone(),
            port: desc.port,
            cipher,
            key: MasterKey::from_password(&desc.password, cipher),
            health: RwLock::new(NodeHealth::default()),
            traffic: NodeTraffic::default(),
        })
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Region tag, if known.
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Endpoint host.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Endpoint port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` of the endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    /// Tunnel cipher.
    pub fn cipher(&self) -> CipherKind {
        self.cipher
    }

    /// Master key derived from the password.
    pub fn key(&self) -> &MasterKey {
        &self.key
    }

    /// Point-in-time copy of the health record.
    pub fn health(&self) -> NodeHealth {
        *self.health.read()
    }

    /// Current latency.
    pub fn latency(&self) -> Latency {
        self.health.read().latency
    }

    /// Traffic counters.
    pub fn traffic(&self) -> &NodeTraffic {
        &self.traffic
    }

    /// Record a successful probe.
    pub fn record_success(&self, latency: Duration) {
        let mut health = self.health.write();
        *health = NodeHealth {
            latency: Latency::Measured(latency),
            last_probed: Some(SystemTime::now()),
            consecutive_failures: 0,
        };
    }

    /// Record a failed probe: unreachable and one more failure.
    pub fn record_probe_failure(&self) {
        let mut health = self.health.write();
        let failures = health.consecutive_failures.saturating_add(1);
        *health = NodeHealth {
            latency: Latency::Unreachable,
            last_probed: Some(SystemTime::now()),
            consecutive_failures: failures,
        };
    }

    /// Record a tunnel open or relay failure. Latency is left untouched.
    pub fn record_relay_failure(&self) -> u32 {
        let mut health = self.health.write();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.consecutive_failures
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint())
            .field("cipher", &self.cipher)
            .field("health", &self.health())
            .finish()
    }
}
