//! Domain routing rules.
//!
//! Rules are evaluated top to bottom and the first match decides the
//! action. When no rule matches, traffic goes DIRECT.
//!
//! Rule strings use the Clash syntax:
//!
//! ```text
//! DOMAIN,www.example.com,DIRECT
//! DOMAIN-SUFFIX,google.com,Proxy
//! DOMAIN-KEYWORD,ads,REJECT
//! MATCH,Proxy
//! ```
//!
//! Any action other than `DIRECT`/`REJECT` names a proxy group and routes
//! through a node.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{Error, Result};

/// What to do with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Action {
    /// Connect to the destination directly
    Direct,
    /// Relay through a tunnel node
    Proxy,
    /// Refuse the connection
    Reject,
}

impl Action {
    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "DIRECT" => Action::Direct,
            "REJECT" | "REJECT-DROP" | "REJECT-TINYGIF" => Action::Reject,
            _ => Action::Proxy,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Direct => f.write_str("DIRECT"),
            Action::Proxy => f.write_str("PROXY"),
            Action::Reject => f.write_str("REJECT"),
        }
    }
}

/// How a rule matches a host. Patterns are stored lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Matcher {
    /// Exact host equality
    Domain(String),
    /// Host equals the pattern or ends with `.pattern`
    DomainSuffix(String),
    /// Host contains the pattern
    DomainKeyword(String),
    /// Matches every host
    Default,
}

impl Matcher {
    /// Check a normalized (lower-case, no trailing dot) host.
    fn matches(&self, host: &str) -> bool {
        match self {
            Matcher::Domain(pattern) => host == pattern,
            Matcher::DomainSuffix(pattern) => {
                host == pattern
                    || (host.len() > pattern.len()
                        && host.ends_with(pattern.as_str())
                        && host.as_bytes()[host.len() - pattern.len() - 1] == b'.')
            }
            Matcher::DomainKeyword(pattern) => host.contains(pattern.as_str()),
            Matcher::Default => true,
        }
    }
}

/// Rule types that are valid Clash syntax but evaluated elsewhere.
const SKIPPED_TYPES: &[&str] = &[
    "IP-CIDR",
    "IP-CIDR6",
    "SRC-IP-CIDR",
    "GEOIP",
    "GEOSITE",
    "DST-PORT",
    "SRC-PORT",
    "PROCESS-NAME",
    "RULE-SET",
    "DOMAIN-REGEX",
    "IP-ASN",
];

/// A single routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    /// Match condition
    pub matcher: Matcher,
    /// Action taken on match
    pub action: Action,
}

impl Rule {
    /// Create a rule.
    pub fn new(matcher: Matcher, action: Action) -> Self {
        Self { matcher, action }
    }

    /// Parse a Clash rule string.
    ///
    /// Returns `Ok(None)` for well-formed rules of a type this matcher does
    /// not evaluate (e.g. `IP-CIDR`).
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let malformed = || Error::config(format!("malformed rule: {:?}", line));

        if fields.len() < 2 || fields.iter().take(2).any(|f| f.is_empty()) {
            return Err(malformed());
        }

        let kind = fields[0].to_ascii_uppercase();
        if kind == "MATCH" || kind == "FINAL" {
            return Ok(Some(Rule::new(Matcher::Default, Action::parse(fields[1]))));
        }

        // Everything else is TYPE,PATTERN,ACTION[,options]
        if fields.len() < 3 || fields[2].is_empty() {
            return Err(malformed());
        }

        let pattern = normalize_pattern(fields[1]);
        if pattern.is_empty() {
            return Err(malformed());
        }
        let action = Action::parse(fields[2]);

        let matcher = match kind.as_str() {
            "DOMAIN" => Matcher::Domain(pattern),
            "DOMAIN-SUFFIX" => Matcher::DomainSuffix(pattern),
            "DOMAIN-KEYWORD" => Matcher::DomainKeyword(pattern),
            other if SKIPPED_TYPES.contains(&other) => {
                tracing::warn!("Skipping unsupported rule type: {}", line);
                return Ok(None);
            }
            _ => {
                return Err(Error::config(format!("unknown rule type in {:?}", line)));
            }
        };

        Ok(Some(Rule::new(matcher, action)))
    }
}

impl FromStr for Rule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Rule::parse(s)?.ok_or_else(|| Error::config(format!("unsupported rule: {:?}", s)))
    }
}

/// Ordered, immutable rule list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Wrap an ordered rule list.
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Parse Clash rule strings, skipping unsupported types.
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Result<Self> {
        let mut rules = Vec::with_capacity(lines.len());
        for line in lines {
            if let Some(rule) = Rule::parse(line.as_ref())? {
                rules.push(rule);
            }
        }
        Ok(Self { rules })
    }

    /// Action for `host`: the first matching rule's action, else DIRECT.
    pub fn match_host(&self, host: &str) -> Action {
        let host = normalize_host(host);
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(&host))
            .map(|rule| rule.action)
            .unwrap_or(Action::Direct)
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Check if there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Iterate rules in evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn normalize_pattern(pattern: &str) -> String {
    let pattern = pattern.trim();
    let pattern = pattern
        .strip_prefix("+.")
        .or_else(|| pattern.strip_prefix('.'))
        .unwrap_or(pattern);
    normalize_host(pattern)
}
