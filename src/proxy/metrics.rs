//! Proxy metrics collection.
//!
//! Aggregate counters only; nothing here identifies a client or destination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::rules::Action;

/// Proxy metrics collector.
pub struct ProxyMetrics {
    /// Collector start time
    start_time: Instant,
    /// Total connections accepted
    total_connections: AtomicU64,
    /// Current active connections
    active_connections: AtomicU64,
    /// Connections routed DIRECT
    direct_connections: AtomicU64,
    /// Connections relayed through a node
    proxied_connections: AtomicU64,
    /// Connections refused by a REJECT rule or fallback policy
    rejected_connections: AtomicU64,
    /// Tunnel opens retried on another node
    failovers: AtomicU64,
    /// Connections that could not be routed at all
    failures: AtomicU64,
    /// Bytes from clients toward destinations
    bytes_up: AtomicU64,
    /// Bytes from destinations back to clients
    bytes_down: AtomicU64,
}

impl ProxyMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            direct_connections: AtomicU64::new(0),
            proxied_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Count the route a connection took.
    pub fn record_route(&self, action: Action) {
        let counter = match action {
            Action::Direct => &self.direct_connections,
            Action::Proxy => &self.proxied_connections,
            Action::Reject => &self.rejected_connections,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment failover count.
    pub fn increment_failovers(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment routing failure count.
    pub fn increment_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Add relayed byte counts.
    pub fn add_bytes(&self, up: u64, down: u64) {
        self.bytes_up.fetch_add(up, Ordering::Relaxed);
        self.bytes_down.fetch_add(down, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            direct_connections: self.direct_connections.load(Ordering::Relaxed),
            proxied_connections: self.proxied_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub direct_connections: u64,
    pub proxied_connections: u64,
    pub rejected_connections: u64,
    pub failovers: u64,
    pub failures: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl MetricsSnapshot {
    /// Share of connections relayed through a node.
    pub fn proxy_rate(&self) -> f64 {
        if self.total_connections == 0 {
            0.0
        } else {
            self.proxied_connections as f64 / self.total_connections as f64
        }
    }

    /// Throughput in bytes per second over the uptime.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_up + self.bytes_down) as f64 / self.uptime_secs as f64
        }
    }
}
