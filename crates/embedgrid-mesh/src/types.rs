//! Proxy mesh records: nodes, pools, bindings, events, and metrics.

use serde::{Deserialize, Serialize};

use embedgrid_model::{ProxyProtocol, ProxyRequirement, SessionId};

/// Id of the node every unplaceable session ends up on.
pub const FALLBACK_NODE_ID: &str = "fallback-proxy";
/// Pseudo-pool that owns the fallback node.
pub const FALLBACK_POOL_ID: &str = "pool-fallback";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Throttled,
    Error,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    RoundRobin,
    Random,
    LeastConnections,
    Performance,
    Sticky,
}

/// Relative importance of scoring factors for a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolPriorities {
    pub latency: f64,
    pub reliability: f64,
    pub geography: f64,
}

impl Default for PoolPriorities {
    fn default() -> Self {
        Self {
            latency: 0.4,
            reliability: 0.4,
            geography: 0.2,
        }
    }
}

/// A single synthetic proxy endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyNode {
    pub id: String,
    pub endpoint: String,
    pub region: String,
    pub country_code: String,
    pub protocol: ProxyProtocol,
    pub port: u16,
    pub latency_ms: f64,
    pub reliability: f64,
    /// Sessions currently bound to this node.
    pub concurrent: u32,
    pub max_concurrent: u32,
    pub status: NodeStatus,
    pub tags: Vec<String>,
    /// Unix milliseconds; 0 until first checked.
    pub last_health_check: u64,
    pub error_count: u32,
    pub success_rate: f64,
}

impl ProxyNode {
    /// Fraction of `max_concurrent` in use.
    pub fn load(&self) -> f64 {
        if self.max_concurrent == 0 {
            1.0
        } else {
            f64::from(self.concurrent) / f64::from(self.max_concurrent)
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.concurrent < self.max_concurrent
    }

    /// Fixed-profile node used when no pool can take a session.
    pub fn fallback() -> Self {
        Self {
            id: FALLBACK_NODE_ID.to_string(),
            endpoint: "fallback.mesh.embedgrid.net".to_string(),
            region: "global".to_string(),
            country_code: "XX".to_string(),
            protocol: ProxyProtocol::Http,
            port: 8080,
            latency_ms: 120.0,
            reliability: 0.85,
            concurrent: 0,
            max_concurrent: 50,
            status: NodeStatus::Active,
            tags: vec!["fallback".to_string()],
            last_health_check: 0,
            error_count: 0,
            success_rate: 0.85,
        }
    }
}

/// A group of nodes, one per country.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyPool {
    pub id: String,
    pub name: String,
    pub region: String,
    pub country_code: Option<String>,
    pub nodes: Vec<ProxyNode>,
    pub rotation_strategy: RotationStrategy,
    pub rotation_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub max_failures: u32,
    pub enable_geo_affinity: bool,
    pub priorities: PoolPriorities,
}

/// A session's current proxy binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySession {
    pub session_id: SessionId,
    pub proxy_id: String,
    pub pool_id: String,
    pub assigned_at: u64,
    pub last_used_at: u64,
    pub request_count: u64,
    pub error_count: u64,
    pub sticky: bool,
    /// Original requirement, replayed on rotation.
    pub requirement: ProxyRequirement,
}

/// Where the caller would like its proxy to be.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoHint {
    pub region: Option<String>,
    pub country: Option<String>,
}

impl GeoHint {
    /// First requested region and country of `requirement`.
    pub fn from_requirement(requirement: &ProxyRequirement) -> Self {
        Self {
            region: requirement.regions.first().map(|r| r.trim().to_ascii_lowercase()),
            country: requirement.normalized_countries().into_iter().next(),
        }
    }
}

/// Result of binding a session to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyAssignment {
    pub session_id: SessionId,
    pub pool_id: String,
    pub node: ProxyNode,
    pub score: f64,
    /// True when the session landed on the fallback node.
    pub fallback: bool,
}

/// Notifications published on the mesh event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    PoolMaterialized {
        pool_id: String,
        country_code: String,
        nodes: usize,
    },
    Assigned {
        session_id: SessionId,
        pool_id: String,
        proxy_id: String,
    },
    Released {
        session_id: SessionId,
        proxy_id: String,
    },
    Rotated {
        session_id: SessionId,
        from: String,
        to: String,
    },
    NodeFailed {
        pool_id: String,
        node_id: String,
    },
}

/// Per-pool slice of [`ProxyMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub pool_id: String,
    pub country_code: Option<String>,
    pub region: String,
    pub nodes: usize,
    pub active_nodes: usize,
    pub concurrent: u64,
    pub max_concurrent: u64,
    pub average_latency_ms: f64,
    pub average_success_rate: f64,
}

/// Mesh-wide aggregate for observability.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyMetrics {
    pub total_pools: usize,
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub active_sessions: usize,
    pub total_capacity: u64,
    pub used_capacity: u64,
    pub average_latency_ms: f64,
    pub average_success_rate: f64,
    pub pools: Vec<PoolMetrics>,
}
