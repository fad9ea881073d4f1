use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The upstream's own protocol. Not currently used to select dial framing
/// (see the raw-relay open question in the design notes) — it is still
/// recorded because the admin surface and the rule-based scheduler's
/// expression grammar both need it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeProtocol {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl NodeProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for NodeProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeProtocol {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "socks4" => Ok(Self::Socks4),
            "socks5" => Ok(Self::Socks5),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// A durable upstream proxy node. Field semantics and invariants per the
/// data model: `current_connections` is saturating at zero,
/// `success_rate` is clamped to `[0, 100]`, `weight`/`max_connections` are
/// at least 1, `updated_at >= created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyNode {
    pub id: i64,
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub protocol: NodeProtocol,
    pub username: Option<String>,
    pub password: Option<String>,
    pub is_active: bool,
    pub is_healthy: bool,
    pub response_time_ms: f64,
    pub success_rate: f64,
    pub weight: i32,
    pub max_connections: i32,
    pub current_connections: i32,
    pub country: Option<String>,
    pub region: Option<String>,
    pub tags: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_check: Option<DateTime<Utc>>,
}

impl ProxyNode {
    /// The candidate set predicate used by every scheduler: `is_active AND
    /// is_healthy`.
    pub fn is_candidate(&self) -> bool {
        self.is_active && self.is_healthy
    }

    /// `user:pass@host:port` (or bare `host:port`) form used to build the
    /// probe URL and, eventually, any per-protocol upstream handshake.
    pub fn authority(&self) -> String {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) if !u.is_empty() => format!("{u}:{p}@{}:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// Full dial-through-this-node probe URL: `{protocol}://[user:pass@]host:port`.
    pub fn probe_proxy_url(&self) -> String {
        format!("{}://{}", self.protocol, self.authority())
    }

    /// A field lookup used by the rule-based scheduler's expression
    /// evaluator. Returns `None` for identifiers this node has no value
    /// for (the evaluator treats that as a null, not a parse error).
    pub fn field_as_str(&self, field: &str) -> Option<String> {
        match field {
            "host" => Some(self.host.clone()),
            "name" => self.name.clone(),
            "protocol" => Some(self.protocol.as_str().to_string()),
            "country" => self.country.clone(),
            "region" => self.region.clone(),
            "tags" => self.tags.clone(),
            _ => None,
        }
    }

    pub fn field_as_num(&self, field: &str) -> Option<f64> {
        match field {
            "response_time_ms" => Some(self.response_time_ms),
            "success_rate" => Some(self.success_rate),
            "weight" => Some(self.weight as f64),
            "max_connections" => Some(self.max_connections as f64),
            "current_connections" => Some(self.current_connections as f64),
            "id" => Some(self.id as f64),
            _ => None,
        }
    }
}

/// Fields required (or optionally supplied) to create a node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeCreate {
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub protocol: NodeProtocol,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: i32,
    #[serde(default = "default_max_connections")]
    pub max_connections: i32,
    pub country: Option<String>,
    pub region: Option<String>,
    pub tags: Option<String>,
}

fn default_weight() -> i32 {
    1
}

fn default_max_connections() -> i32 {
    100
}

/// Sparse admin-facing patch — only fields explicitly present mutate the
/// row. Deliberately excludes the checker/scheduler-authoritative fields
/// (`is_healthy`, `response_time_ms`, `success_rate`, `current_connections`,
/// `last_check`): those are mutated through dedicated store methods.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodePatch {
    #[serde(default)]
    pub name: Option<Option<String>>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<NodeProtocol>,
    #[serde(default)]
    pub username: Option<Option<String>>,
    #[serde(default)]
    pub password: Option<Option<String>>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub weight: Option<i32>,
    #[serde(default)]
    pub max_connections: Option<i32>,
    #[serde(default)]
    pub country: Option<Option<String>>,
    #[serde(default)]
    pub region: Option<Option<String>>,
    #[serde(default)]
    pub tags: Option<Option<String>>,
}

/// Conjunctive filters accepted by `NodeStore::list`.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub is_active: Option<bool>,
    pub is_healthy: Option<bool>,
    pub protocol: Option<NodeProtocol>,
    pub country: Option<String>,
    /// Case-sensitive substring match against `host OR name OR tags`.
    pub search: Option<String>,
}

/// Aggregate pool statistics, computed at call time (no cache).
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatistics {
    pub total: i64,
    pub active: i64,
    pub healthy_active: i64,
    pub avg_response_time_ms: f64,
    pub by_protocol: HashMap<String, i64>,
    pub by_country: HashMap<String, i64>,
}

/// Transient result of a single health probe.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub success: bool,
    pub response_time_ms: f64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HealthCheckResult {
    /// The canonical failure sentinel response time per the data model.
    pub const FAILURE_SENTINEL_MS: f64 = 10_000.0;

    pub fn success(response_time_ms: f64) -> Self {
        Self {
            success: true,
            response_time_ms,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            response_time_ms: Self::FAILURE_SENTINEL_MS,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_round_trips_through_str() {
        for p in [
            NodeProtocol::Http,
            NodeProtocol::Https,
            NodeProtocol::Socks4,
            NodeProtocol::Socks5,
        ] {
            assert_eq!(NodeProtocol::from_str(p.as_str()).unwrap(), p);
        }
        assert!(NodeProtocol::from_str("carrier-pigeon").is_err());
    }

    #[test]
    fn authority_omits_credentials_when_absent() {
        let node = sample_node();
        assert_eq!(node.authority(), "proxy.example.com:8080");
    }

    #[test]
    fn authority_includes_credentials_when_present() {
        let mut node = sample_node();
        node.username = Some("u".to_string());
        node.password = Some("p".to_string());
        assert_eq!(node.authority(), "u:p@proxy.example.com:8080");
    }

    #[test]
    fn probe_url_includes_scheme() {
        let node = sample_node();
        assert_eq!(node.probe_proxy_url(), "http://proxy.example.com:8080");
    }

    fn sample_node() -> ProxyNode {
        let now = Utc::now();
        ProxyNode {
            id: 1,
            name: None,
            host: "proxy.example.com".to_string(),
            port: 8080,
            protocol: NodeProtocol::Http,
            username: None,
            password: None,
            is_active: true,
            is_healthy: true,
            response_time_ms: 50.0,
            success_rate: 100.0,
            weight: 1,
            max_connections: 100,
            current_connections: 0,
            country: None,
            region: None,
            tags: None,
            created_at: now,
            updated_at: now,
            last_check: None,
        }
    }
}
