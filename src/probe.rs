//! Node latency probing.
//!
//! By default a probe is a TCP connect to the node endpoint under a
//! deadline, and the elapsed time is the node's latency. With a check URL
//! configured, a probe instead sends an HTTP request through a tunnel
//! session and times the first response chunk, which also catches wrong
//! credentials. Probes run concurrently, capped by a semaphore sized
//! independently of the node count, and each probe only touches its own
//! node's health record.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::node::{Latency, Node, Registry};
use crate::proxy::inbound::parse_absolute_uri;
use crate::selector::rank;
use crate::tunnel::{Address, TunnelClient, TunnelConfig};

/// Default per-probe deadline
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of probes in flight
pub const DEFAULT_CONCURRENCY: usize = 20;

/// Default period between probe rounds
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

/// What a probe measures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProbeMethod {
    /// TCP connect time to the node endpoint
    #[default]
    Connect,
    /// Time to the first response chunk of an HTTP request sent through
    /// the tunnel
    Http(HttpCheck),
}

/// HTTP request used as a tunnel round trip, e.g. a `generate_204` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCheck {
    target: Address,
    request: Vec<u8>,
}

impl HttpCheck {
    /// Build a check from an absolute `http://` URL.
    pub fn parse(url: &str) -> Result<Self> {
        let (target, path) = parse_absolute_uri(url.trim())
            .map_err(|e| Error::config(format!("probe url {:?}: {}", url, e)))?;

        let host = match (&target, target.port()) {
            (Address::Socket(addr), 80) if addr.is_ipv6() => format!("[{}]", addr.ip()),
            (_, 80) => target.host(),
            _ => target.to_string(),
        };
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: noderelay\r\nConnection: close\r\n\r\n",
            path, host
        )
        .into_bytes();

        Ok(Self { target, request })
    }

    /// Destination the request is sent to.
    pub fn target(&self) -> &Address {
        &self.target
    }
}

/// Outcome counts of one probe round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeSummary {
    /// Nodes that answered
    pub reachable: usize,
    /// Nodes that timed out or refused
    pub unreachable: usize,
}

impl ProbeSummary {
    /// Number of probes run.
    pub fn total(&self) -> usize {
        self.reachable + self.unreachable
    }
}

/// Concurrent latency prober.
#[derive(Debug, Clone)]
pub struct Prober {
    timeout: Duration,
    concurrency: usize,
    interval: Duration,
    method: ProbeMethod,
}

impl Default for Prober {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
            interval: DEFAULT_INTERVAL,
            method: ProbeMethod::Connect,
        }
    }
}

impl Prober {
    /// Create a prober. A concurrency of zero is treated as one.
    pub fn new(timeout: Duration, concurrency: usize, interval: Duration) -> Self {
        Self {
            timeout,
            concurrency: concurrency.max(1),
            interval,
            method: ProbeMethod::Connect,
        }
    }

    /// Use `method` instead of a plain TCP connect.
    pub fn with_method(mut self, method: ProbeMethod) -> Self {
        self.method = method;
        self
    }

    /// Per-probe deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe every node once and record the results.
    ///
    /// Returns after every probe finished or hit its deadline. A failing or
    /// panicking probe never affects the others.
    pub async fn probe_all(&self, nodes: &[Arc<Node>]) -> ProbeSummary {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for node in nodes {
            let node = Arc::clone(node);
            let permits = Arc::clone(&permits);
            let deadline = self.timeout;
            let method = self.method.clone();

            tasks.spawn(async move {
                // The semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                let latency = match &method {
                    ProbeMethod::Connect => probe_node(&node, deadline).await,
                    ProbeMethod::Http(check) => probe_http(&node, check, deadline).await,
                };
                match latency {
                    Latency::Measured(d) => node.record_success(d),
                    Latency::Unreachable => node.record_probe_failure(),
                }
                tracing::debug!("Probe {}: {}", node.name(), latency);
                latency
            });
        }

        let mut summary = ProbeSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(latency) if latency.is_reachable() => summary.reachable += 1,
                Ok(_) => summary.unreachable += 1,
                Err(e) => {
                    tracing::warn!("Probe task failed: {}", e);
                    summary.unreachable += 1;
                }
            }
        }

        tracing::info!(
            "Probe round done: {}/{} nodes reachable",
            summary.reachable,
            summary.total()
        );
        summary
    }

    /// Probe the registry's current snapshot periodically until cancelled.
    ///
    /// The first round starts immediately. A round in flight when the token
    /// fires is abandoned; nodes it had already measured keep their results.
    pub async fn run(&self, registry: Arc<Registry>, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let snapshot = registry.snapshot();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.probe_all(&snapshot) => {}
            }
        }

        tracing::debug!("Prober stopped");
    }
}

/// Measure one node: TCP connect time, or unreachable.
pub async fn probe_node(node: &Node, deadline: Duration) -> Latency {
    let start = Instant::now();
    match timeout(deadline, TcpStream::connect((node.server(), node.port()))).await {
        Ok(Ok(_stream)) => Latency::Measured(start.elapsed()),
        Ok(Err(e)) => {
            tracing::trace!("Probe {} refused: {}", node.name(), e);
            Latency::Unreachable
        }
        Err(_) => Latency::Unreachable,
    }
}

/// Measure one node by an HTTP round trip through a tunnel session.
///
/// The whole exchange, connect included, shares one deadline. A node that
/// closes the session or answers with data that fails to decrypt is
/// unreachable.
pub async fn probe_http(node: &Node, check: &HttpCheck, deadline: Duration) -> Latency {
    let client = TunnelClient::new(TunnelConfig {
        connect_timeout: deadline,
        handshake_timeout: deadline,
        auth_grace: Duration::ZERO,
    });

    let start = Instant::now();
    let exchange = async {
        let mut tunnel = client.open(node, &check.target).await?;
        tunnel.send(&check.request).await?;
        tunnel.recv().await
    };

    match timeout(deadline, exchange).await {
        Ok(Ok(Some(_))) => Latency::Measured(start.elapsed()),
        Ok(Ok(None)) => {
            tracing::trace!("Probe {}: session closed without a response", node.name());
            Latency::Unreachable
        }
        Ok(Err(e)) => {
            tracing::trace!("Probe {} failed: {}", node.name(), e);
            Latency::Unreachable
        }
        Err(_) => Latency::Unreachable,
    }
}

/// Label for nodes without a region tag
pub const UNTAGGED_REGION: &str = "OTHER";

/// Availability of one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionSummary {
    /// Region tag
    pub region: String,
    /// Nodes in the region
    pub total: usize,
    /// Reachable nodes in the region
    pub reachable: usize,
    /// Fastest reachable node in the region
    pub fastest: Option<String>,
}

/// One entry of the fastest-nodes list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedNode {
    /// Node name
    pub name: String,
    /// Region tag
    pub region: Option<String>,
    /// Latency in milliseconds
    pub latency_ms: u64,
}

/// Human- and machine-readable view of the latest probe results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    /// Number of nodes
    pub total: usize,
    /// Reachable nodes
    pub reachable: usize,
    /// Per-region availability, sorted by tag
    pub regions: Vec<RegionSummary>,
    /// Fastest reachable nodes, best first
    pub fastest: Vec<RankedNode>,
}

impl ProbeReport {
    /// Build a report from current node health, listing `top` fastest nodes.
    pub fn from_nodes(nodes: &[Arc<Node>], top: usize) -> Self {
        let ranked = rank(nodes);
        let mut regions: BTreeMap<String, RegionSummary> = BTreeMap::new();

        // Ranked order means the first reachable node seen per region is its fastest
        for node in &ranked {
            let tag = node.region().unwrap_or(UNTAGGED_REGION).to_string();
            let entry = regions.entry(tag.clone()).or_insert_with(|| RegionSummary {
                region: tag,
                total: 0,
                reachable: 0,
                fastest: None,
            });
            entry.total += 1;
            if node.latency().is_reachable() {
                entry.reachable += 1;
                if entry.fastest.is_none() {
                    entry.fastest = Some(node.name().to_string());
                }
            }
        }

        let fastest: Vec<RankedNode> = ranked
            .iter()
            .filter_map(|n| {
                n.latency().as_millis().map(|ms| RankedNode {
                    name: n.name().to_string(),
                    region: n.region().map(str::to_string),
                    latency_ms: ms,
                })
            })
            .take(top)
            .collect();

        Self {
            total: nodes.len(),
            reachable: ranked.iter().filter(|n| n.latency().is_reachable()).count(),
            regions: regions.into_values().collect(),
            fastest,
        }
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Nodes: {} total, {} reachable", self.total, self.reachable)?;
        writeln!(f)?;
        writeln!(f, "Regions:")?;
        for region in &self.regions {
            writeln!(
                f,
                "  {:<6} {:>3}/{:<3} {}",
                region.region,
                region.reachable,
                region.total,
                region.fastest.as_deref().unwrap_or("-")
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Fastest:")?;
        for (i, node) in self.fastest.iter().enumerate() {
            writeln!(f, "  {}. {} ({}ms)", i + 1, node.name, node.latency_ms)?;
        }
        Ok(())
    }
}
