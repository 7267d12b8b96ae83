//! # noderelay
//!
//! A local forwarding proxy that spreads client connections over a pool of
//! encrypted tunnel nodes, picking nodes by measured latency and routing
//! destinations by Clash-style domain rules.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Local Proxy (SOCKS5 + HTTP inbound, relay, failover)   │
//! ├────────────────────────────┬────────────────────────────┤
//! │  Rule Matcher (host→route) │  Selector (fastest node)   │
//! ├────────────────────────────┼────────────────────────────┤
//! │  DNS (DIRECT destinations) │  Prober (latency rounds)   │
//! ├────────────────────────────┴────────────────────────────┤
//! │  Node Registry (descriptors, health, traffic)           │
//! ├─────────────────────────────────────────────────────────┤
//! │  Tunnel (salt + AEAD chunks, SOCKS5-style address)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto (AES-GCM, ChaCha20-Poly1305, EVP/HKDF-SHA1)     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The registry is the only shared mutable state. The prober writes node
//! health; the proxy reads immutable snapshots of the node list and records
//! failures and traffic per node.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod crypto;
pub mod dns;
pub mod error;
pub mod node;
pub mod probe;
pub mod proxy;
pub mod rules;
pub mod selector;
pub mod tunnel;

pub use config::Config;
pub use error::{Error, Result};
