//! Configuration files.
//!
//! The local proxy reads JSON ([`ConfigFile`]) shaped after Clash: a
//! `proxies` list, `rules` strings and a `dns` block, plus tuning sections.
//! A tunnel node reads TOML ([`NodeConfigFile`]). Both convert into
//! validated runtime structs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::CipherKind;
use crate::dns::DnsSettings;
use crate::error::{Error, Result};
use crate::node::{NodeDescriptor, NodeSet};
use crate::probe::{
    HttpCheck, ProbeMethod, Prober, DEFAULT_CONCURRENCY, DEFAULT_INTERVAL, DEFAULT_PROBE_TIMEOUT,
};
use crate::proxy::{FallbackPolicy, ProxySettings};
use crate::rules::RuleSet;
use crate::selector::{Constraint, DEFAULT_MAX_FAILURES};
use crate::tunnel::{TunnelConfig, TunnelServerConfig};

/// Listen address used when none is configured
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7890";

/// Node type understood by the tunnel
const NODE_TYPE_SS: &str = "ss";

/// Prober settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Per-probe deadline
    pub timeout: Duration,
    /// Probes in flight
    pub concurrency: usize,
    /// Period between rounds
    pub interval: Duration,
    /// Fastest nodes listed in a probe report
    pub report_top: usize,
    /// What each probe measures
    pub method: ProbeMethod,
}

impl ProbeSettings {
    /// Build the prober these settings describe.
    pub fn prober(&self) -> Prober {
        Prober::new(self.timeout, self.concurrency, self.interval).with_method(self.method.clone())
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
            interval: DEFAULT_INTERVAL,
            report_top: 5,
            method: ProbeMethod::Connect,
        }
    }
}

/// Validated runtime configuration of the local proxy.
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy listen address
    pub listen: String,
    /// Tunnel nodes, unique by name
    pub nodes: Vec<NodeDescriptor>,
    /// Routing rules
    pub rules: RuleSet,
    /// Resolver settings for DIRECT connections
    pub dns: DnsSettings,
    /// Prober settings
    pub probe: ProbeSettings,
    /// Tunnel timeouts
    pub tunnel: TunnelConfig,
    /// Routing and relay settings
    pub proxy: ProxySettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            nodes: Vec::new(),
            rules: RuleSet::default(),
            dns: DnsSettings::default(),
            probe: ProbeSettings::default(),
            tunnel: TunnelConfig::default(),
            proxy: ProxySettings::default(),
        }
    }
}

impl Config {
    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        ConfigFile::from_json(&content)?.to_config()
    }
}

/// One entry of the `proxies` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Clash node type; only `ss` is relayed
    #[serde(rename = "type", default = "default_node_type")]
    pub kind: String,
    /// Node fields
    #[serde(flatten)]
    pub node: NodeDescriptor,
}

fn default_node_type() -> String {
    NODE_TYPE_SS.to_string()
}

/// `probe` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    /// Per-probe deadline (milliseconds)
    pub timeout_ms: u64,
    /// Probes in flight
    pub concurrency: usize,
    /// Period between rounds (seconds)
    pub interval_secs: u64,
    /// Fastest nodes listed in a probe report
    pub report_top: usize,
    /// `http://` URL fetched through each node; unset means a TCP connect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
            concurrency: DEFAULT_CONCURRENCY,
            interval_secs: DEFAULT_INTERVAL.as_secs(),
            report_top: 5,
            url: None,
        }
    }
}

/// `tunnel` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    /// TCP connect deadline (milliseconds)
    pub connect_timeout_ms: u64,
    /// Deadline for sending salt and address (milliseconds)
    pub handshake_timeout_ms: u64,
    /// Window for detecting a rejected session (milliseconds, 0 disables)
    pub auth_grace_ms: u64,
}

impl Default for TunnelSection {
    fn default() -> Self {
        let defaults = TunnelConfig::default();
        Self {
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
            handshake_timeout_ms: defaults.handshake_timeout.as_millis() as u64,
            auth_grace_ms: defaults.auth_grace.as_millis() as u64,
        }
    }
}

/// `proxy` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    /// Only select nodes of this region
    pub region: Option<String>,
    /// Skip nodes with this many consecutive failures
    pub max_failures: u32,
    /// Skip nodes slower than this (milliseconds)
    pub max_latency_ms: Option<u64>,
    /// What to do when no node is available
    pub fallback: FallbackPolicy,
    /// Deadline for reading a client's request (seconds)
    pub handshake_timeout_secs: u64,
    /// DIRECT connect deadline (seconds)
    pub connect_timeout_secs: u64,
    /// Drain period after one relay direction closes (seconds)
    pub close_grace_secs: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        let defaults = ProxySettings::default();
        Self {
            region: None,
            max_failures: DEFAULT_MAX_FAILURES,
            max_latency_ms: None,
            fallback: defaults.fallback,
            handshake_timeout_secs: defaults.handshake_timeout.as_secs(),
            connect_timeout_secs: defaults.connect_timeout.as_secs(),
            close_grace_secs: defaults.close_grace.as_secs(),
        }
    }
}

/// Configuration file format of the local proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Listen address, e.g. `127.0.0.1:7890`
    pub listen: Option<String>,
    /// Clash `mixed-port`; listens on 127.0.0.1 when `listen` is absent
    #[serde(rename = "mixed-port")]
    pub mixed_port: Option<u16>,
    /// Tunnel nodes
    #[serde(alias = "proxies")]
    pub nodes: Vec<NodeEntry>,
    /// Clash rule strings
    pub rules: Vec<String>,
    /// Resolver settings
    pub dns: DnsSettings,
    /// Prober tuning
    pub probe: ProbeSection,
    /// Tunnel tuning
    pub tunnel: TunnelSection,
    /// Routing tuning
    pub proxy: ProxySection,
}

impl ConfigFile {
    /// Parse JSON text.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::config(format!("invalid JSON: {}", e)))
    }

    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<Config> {
        let listen = match (&self.listen, self.mixed_port) {
            (Some(listen), _) => listen.clone(),
            (None, Some(port)) => format!("127.0.0.1:{}", port),
            (None, None) => DEFAULT_LISTEN.to_string(),
        };
        if listen.is_empty() {
            return Err(Error::config("listen cannot be empty"));
        }

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for entry in &self.nodes {
            if !entry.kind.eq_ignore_ascii_case(NODE_TYPE_SS) {
                tracing::warn!(
                    "Skipping node {} of unsupported type {}",
                    entry.node.name,
                    entry.kind
                );
                continue;
            }
            nodes.push(entry.node.clone());
        }
        // Rejects duplicate names and unknown ciphers
        NodeSet::from_descriptors(&nodes)?;
        if nodes.is_empty() {
            tracing::warn!("No tunnel nodes configured; PROXY traffic will use the fallback");
        }

        let rules = RuleSet::parse(&self.rules)?;

        if self.probe.concurrency == 0 {
            return Err(Error::config("probe.concurrency must be at least 1"));
        }
        if self.probe.timeout_ms == 0 {
            return Err(Error::config("probe.timeout_ms must be positive"));
        }
        if self.probe.interval_secs == 0 {
            return Err(Error::config("probe.interval_secs must be positive"));
        }
        let probe_method = match &self.probe.url {
            Some(url) => ProbeMethod::Http(HttpCheck::parse(url)?),
            None => ProbeMethod::Connect,
        };

        let constraint = Constraint {
            region: self.proxy.region.clone(),
            exclude: Vec::new(),
            max_failures: Some(self.proxy.max_failures),
            max_latency_ms: self.proxy.max_latency_ms,
        };

        Ok(Config {
            listen,
            nodes,
            rules,
            dns: self.dns.clone(),
            probe: ProbeSettings {
                timeout: Duration::from_millis(self.probe.timeout_ms),
                concurrency: self.probe.concurrency,
                interval: Duration::from_secs(self.probe.interval_secs),
                report_top: self.probe.report_top,
                method: probe_method,
            },
            tunnel: TunnelConfig {
                connect_timeout: Duration::from_millis(self.tunnel.connect_timeout_ms),
                handshake_timeout: Duration::from_millis(self.tunnel.handshake_timeout_ms),
                auth_grace: Duration::from_millis(self.tunnel.auth_grace_ms),
            },
            proxy: ProxySettings {
                constraint,
                fallback: self.proxy.fallback,
                handshake_timeout: Duration::from_secs(self.proxy.handshake_timeout_secs),
                connect_timeout: Duration::from_secs(self.proxy.connect_timeout_secs),
                close_grace: Duration::from_secs(self.proxy.close_grace_secs),
            },
        })
    }
}

/// Configuration file format of a tunnel node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigFile {
    /// Listen address
    pub listen: String,
    /// Cipher identifier
    pub cipher: String,
    /// Pre-shared secret
    pub password: String,
    /// Deadline for receiving salt and address (seconds)
    #[serde(default = "default_node_handshake_secs")]
    pub handshake_timeout_secs: u64,
    /// Deadline for connecting to destinations (seconds)
    #[serde(default = "default_node_connect_secs")]
    pub connect_timeout_secs: u64,
    /// Drain period after one direction closes (seconds)
    #[serde(default = "default_close_grace_secs")]
    pub close_grace_secs: u64,
}

fn default_node_handshake_secs() -> u64 {
    10
}

fn default_node_connect_secs() -> u64 {
    10
}

fn default_close_grace_secs() -> u64 {
    5
}

impl NodeConfigFile {
    /// Sample configuration with a random password.
    pub fn sample() -> Self {
        let secret: [u8; 18] = crate::crypto::SecureRandom::bytes();
        let password: String = secret.iter().map(|b| format!("{:02x}", b)).collect();
        Self {
            listen: "0.0.0.0:8388".to_string(),
            cipher: CipherKind::ChaCha20Poly1305.to_string(),
            password,
            handshake_timeout_secs: default_node_handshake_secs(),
            connect_timeout_secs: default_node_connect_secs(),
            close_grace_secs: default_close_grace_secs(),
        }
    }

    /// Parse TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("invalid TOML: {}", e)))
    }

    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<TunnelServerConfig> {
        if self.listen.is_empty() {
            return Err(Error::config("listen cannot be empty"));
        }
        if self.password.is_empty() {
            return Err(Error::config("password cannot be empty"));
        }
        let cipher: CipherKind = self.cipher.parse()?;

        let mut config = TunnelServerConfig::new(self.listen.clone(), cipher, &self.password);
        config.handshake_timeout = Duration::from_secs(self.handshake_timeout_secs);
        config.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        config.close_grace = Duration::from_secs(self.close_grace_secs);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Action;

    const SAMPLE: &str = r#"{
        "mixed-port": 7891,
        "proxies": [
            {"name": "香港 01", "type": "ss", "server": "hk.example.net", "port": 8388,
             "cipher": "aes-256-gcm", "password": "pw", "udp": true},
            {"name": "日本 01", "server": "jp.example.net", "port": 8389,
             "cipher": "chacha20-ietf-poly1305", "password": "pw"},
            {"name": "trojan", "type": "trojan", "server": "t.example.net", "port": 443,
             "cipher": "", "password": "pw"}
        ],
        "rules": [
            "DOMAIN-SUFFIX,google.com,Proxy",
            "IP-CIDR,10.0.0.0/8,DIRECT",
            "MATCH,DIRECT"
        ],
        "dns": {"nameservers": ["223.5.5.5"], "fallback": ["8.8.8.8"]},
        "proxy": {"region": "HK", "fallback": "reject"}
    }"#;

    #[test]
    fn test_sample_config() {
        let config = ConfigFile::from_json(SAMPLE).unwrap().to_config().unwrap();

        assert_eq!(config.listen, "127.0.0.1:7891");
        let names: Vec<&str> = config.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["香港 01", "日本 01"]);

        // IP-CIDR is skipped
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules.match_host("mail.google.com"), Action::Proxy);

        assert_eq!(config.dns.fallback, ["8.8.8.8"]);
        assert_eq!(config.proxy.fallback, FallbackPolicy::Reject);
        assert_eq!(config.proxy.constraint.region.as_deref(), Some("HK"));
        assert_eq!(config.proxy.constraint.max_failures, Some(DEFAULT_MAX_FAILURES));
    }

    #[test]
    fn test_defaults() {
        let config = ConfigFile::from_json("{}").unwrap().to_config().unwrap();
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert!(config.nodes.is_empty());
        assert!(config.rules.is_empty());
        assert_eq!(config.probe, ProbeSettings::default());
        assert_eq!(config.tunnel, TunnelConfig::default());
        assert_eq!(config.proxy.fallback, FallbackPolicy::Direct);
        assert_eq!(config.proxy.close_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let json = r#"{"nodes": [
            {"name": "a", "server": "h", "port": 1, "cipher": "aes-128-gcm", "password": "p"},
            {"name": "a", "server": "h", "port": 2, "cipher": "aes-128-gcm", "password": "p"}
        ]}"#;
        let err = ConfigFile::from_json(json).unwrap().to_config().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bad_cipher_rejected() {
        let json = r#"{"nodes": [
            {"name": "a", "server": "h", "port": 1, "cipher": "rc4-md5", "password": "p"}
        ]}"#;
        assert!(ConfigFile::from_json(json).unwrap().to_config().is_err());
    }

    #[test]
    fn test_malformed_rule_rejected() {
        for rule in ["DOMAIN-SUFFIX,google.com", "NOT-A-TYPE,x,DIRECT", ""] {
            let file = ConfigFile {
                rules: vec![rule.to_string()],
                ..ConfigFile::default()
            };
            assert!(
                matches!(file.to_config(), Err(Error::Config(_))),
                "accepted {:?}",
                rule
            );
        }
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(ConfigFile::from_json("{nodes"), Err(Error::Config(_))));
        assert!(matches!(
            ConfigFile::from_json(r#"{"proxy": {"fallback": "sometimes"}}"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let file = ConfigFile {
            probe: ProbeSection {
                concurrency: 0,
                ..ProbeSection::default()
            },
            ..ConfigFile::default()
        };
        assert!(file.to_config().is_err());
    }

    #[test]
    fn test_check_url_selects_http_round_trip() {
        let json = r#"{"probe": {"url": "http://www.gstatic.com/generate_204"}}"#;
        let config = ConfigFile::from_json(json).unwrap().to_config().unwrap();
        let ProbeMethod::Http(check) = &config.probe.method else {
            panic!("expected an HTTP check, got {:?}", config.probe.method);
        };
        assert_eq!(check.target().to_string(), "www.gstatic.com:80");

        let json = r#"{"probe": {"url": "https://www.gstatic.com/generate_204"}}"#;
        let err = ConfigFile::from_json(json).unwrap().to_config().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_node_config_toml() {
        let file = NodeConfigFile::from_toml(
            r#"
            listen = "0.0.0.0:8388"
            cipher = "aes-128-gcm"
            password = "secret"
            close_grace_secs = 2
            "#,
        )
        .unwrap();
        let config = file.to_config().unwrap();
        assert_eq!(config.cipher, CipherKind::Aes128Gcm);
        assert_eq!(config.close_grace, Duration::from_secs(2));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));

        let bad = NodeConfigFile {
            cipher: "none".into(),
            ..file
        };
        assert!(bad.to_config().is_err());
    }

    #[test]
    fn test_node_sample_round_trips_through_toml() {
        let sample = NodeConfigFile::sample();
        let text = toml::to_string_pretty(&sample).unwrap();
        let parsed = NodeConfigFile::from_toml(&text).unwrap();
        assert_eq!(parsed.password, sample.password);
        assert!(parsed.to_config().is_ok());
    }
}
