//! Node selection policy.
//!
//! Picks the reachable node with the lowest measured latency among those
//! passing an optional [`Constraint`]. Ties go to the node declared first.
//! Health values are read once per node as a point-in-time copy; a probe
//! landing mid-selection can only change which snapshot value is seen.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::node::{normalize_region, Node};

/// Default failure threshold above which a node is skipped
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// Filter applied before picking the fastest node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraint {
    /// Only nodes tagged with this region (tag or keyword, e.g. `HK`, `香港`)
    pub region: Option<String>,
    /// Node names that must not be chosen
    pub exclude: Vec<String>,
    /// Skip nodes whose consecutive failures reached this count
    pub max_failures: Option<u32>,
    /// Skip nodes slower than this many milliseconds
    pub max_latency_ms: Option<u64>,
}

impl Constraint {
    /// Constraint restricted to one region.
    pub fn region(region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            ..Self::default()
        }
    }

    /// Add a node name to the exclusion list.
    pub fn excluding(mut self, name: impl Into<String>) -> Self {
        self.exclude.push(name.into());
        self
    }

    /// Set the failure threshold.
    pub fn with_max_failures(mut self, max: u32) -> Self {
        self.max_failures = Some(max);
        self
    }

    /// Set the latency ceiling.
    pub fn with_max_latency(mut self, max: Duration) -> Self {
        self.max_latency_ms = Some(max.as_millis() as u64);
        self
    }

    fn admits(&self, node: &Node, region: Option<&str>, latency: Duration, failures: u32) -> bool {
        if self.exclude.iter().any(|n| n == node.name()) {
            return false;
        }
        if let Some(max) = self.max_latency_ms {
            if latency > Duration::from_millis(max) {
                return false;
            }
        }
        if let Some(wanted) = region {
            if node.region() != Some(wanted) {
                return false;
            }
        }
        failures < self.max_failures.unwrap_or(DEFAULT_MAX_FAILURES)
    }
}

/// Choose the fastest reachable node.
///
/// Without a constraint only reachability is checked. Returns
/// [`Error::NoAvailableNode`] when nothing qualifies.
pub fn select(nodes: &[Arc<Node>], constraint: Option<&Constraint>) -> Result<Arc<Node>> {
    let region = constraint
        .and_then(|c| c.region.as_deref())
        .map(normalize_region);

    let mut best: Option<(&Arc<Node>, Duration)> = None;

    for node in nodes {
        let health = node.health();
        let latency = match health.latency.as_duration() {
            Some(d) => d,
            None => continue,
        };

        if let Some(c) = constraint {
            if !c.admits(node, region.as_deref(), latency, health.consecutive_failures) {
                continue;
            }
        }

        // Strict comparison keeps the earlier node on ties
        match best {
            Some((_, current)) if latency >= current => {}
            _ => best = Some((node, latency)),
        }
    }

    best.map(|(node, _)| Arc::clone(node))
        .ok_or(Error::NoAvailableNode)
}

/// Nodes ordered by latency, unreachable last; stable on declaration order.
pub fn rank(nodes: &[Arc<Node>]) -> Vec<Arc<Node>> {
    let mut ranked: Vec<(Arc<Node>, crate::node::Latency)> = nodes
        .iter()
        .map(|n| (Arc::clone(n), n.latency()))
        .collect();
    ranked.sort_by(|a, b| a.1.cmp(&b.1));
    ranked.into_iter().map(|(n, _)| n).collect()
}
