//! Node registry.
//!
//! Holds the current [`NodeSet`] behind a lock that is only taken to clone
//! or swap the `Arc`. Readers iterate an immutable snapshot; a reload builds
//! a complete new set and swaps it in, so the list never changes under a
//! reader. Health records are updated in place on the shared `Node`s.

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::node::{Node, NodeDescriptor};

/// Immutable, ordered set of nodes (declaration order).
#[derive(Debug, Default)]
pub struct NodeSet {
    nodes: Vec<Arc<Node>>,
}

impl NodeSet {
    /// Build a node set, rejecting duplicate names.
    pub fn from_descriptors(descriptors: &[NodeDescriptor]) -> Result<Self> {
        let mut seen = HashSet::with_capacity(descriptors.len());
        let mut nodes = Vec::with_capacity(descriptors.len());

        for desc in descriptors {
            if !seen.insert(desc.name.as_str()) {
                return Err(Error::config(format!("duplicate node name: {}", desc.name)));
            }
            nodes.push(Arc::new(Node::from_descriptor(desc)?));
        }

        Ok(Self { nodes })
    }

    /// Look up a node by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.name() == name)
    }
}

impl Deref for NodeSet {
    type Target = [Arc<Node>];

    fn deref(&self) -> &Self::Target {
        &self.nodes
    }
}

/// Shared registry of tunnel nodes.
pub struct Registry {
    current: RwLock<Arc<NodeSet>>,
}

impl Registry {
    /// Create a registry from node descriptors.
    pub fn new(descriptors: &[NodeDescriptor]) -> Result<Self> {
        Ok(Self::from_set(NodeSet::from_descriptors(descriptors)?))
    }

    /// Create a registry around an existing node set.
    pub fn from_set(set: NodeSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    /// Current snapshot of the node list.
    pub fn snapshot(&self) -> Arc<NodeSet> {
        Arc::clone(&self.current.read())
    }

    /// Replace the whole node list.
    ///
    /// Nothing is swapped if the new descriptors are invalid. Health and
    /// traffic of the old nodes are not carried over.
    pub fn reload(&self, descriptors: &[NodeDescriptor]) -> Result<()> {
        let set = NodeSet::from_descriptors(descriptors)?;
        let count = set.len();
        *self.current.write() = Arc::new(set);
        tracing::info!("Registry reloaded with {} nodes", count);
        Ok(())
    }

    /// Look up a node by name in the current snapshot.
    pub fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.snapshot().get(name).cloned()
    }

    /// Number of nodes in the current snapshot.
    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    /// Check if the registry holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cumulative per-node byte counters for the statistics collaborator.
    pub fn traffic_report(&self) -> TrafficReport {
        let snapshot = self.snapshot();
        let nodes: Vec<NodeReport> = snapshot.iter().map(|n| NodeReport::from_node(n)).collect();

        TrafficReport {
            total_upload: nodes.iter().map(|n| n.upload).sum(),
            total_download: nodes.iter().map(|n| n.download).sum(),
            nodes,
        }
    }
}

/// Per-node statistics entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    /// Node name
    pub name: String,
    /// Region tag
    pub region: Option<String>,
    /// Latest latency in milliseconds, `None` when unreachable
    pub latency_ms: Option<u64>,
    /// Failures since the last successful probe
    pub consecutive_failures: u32,
    /// Bytes sent through the node
    pub upload: u64,
    /// Bytes received through the node
    pub download: u64,
}

impl NodeReport {
    fn from_node(node: &Node) -> Self {
        let health = node.health();
        Self {
            name: node.name().to_string(),
            region: node.region().map(str::to_string),
            latency_ms: health.latency.as_millis(),
            consecutive_failures: health.consecutive_failures,
            upload: node.traffic().upload(),
            download: node.traffic().download(),
        }
    }
}

/// Traffic counters of every node, ready for export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficReport {
    /// Per-node entries in declaration order
    pub nodes: Vec<NodeReport>,
    /// Sum of uploads
    pub total_upload: u64,
    /// Sum of downloads
    pub total_download: u64,
}
