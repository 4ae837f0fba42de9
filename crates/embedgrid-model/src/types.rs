//! Domain types for Embedgrid.
//!
//! These types describe session intent (`SessionDefinition`), the owned
//! registry record (`SessionBlueprint`), its regional capacity shards, and
//! the ephemeral observations derived from it (replica samples, metrics).

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Unique identifier for a session / blueprint.
pub type SessionId = String;

/// Region used when a definition declares no geo affinity.
pub const DEFAULT_REGION: &str = "global-default";

/// Metadata key carrying the proxy node bound at creation time.
pub const PROXY_NODE_METADATA_KEY: &str = "proxyNodeId";

/// Metadata key carrying the content imprint of a synthesized target.
pub const CONTENT_IMPRINT_METADATA_KEY: &str = "contentImprint";

// ── Target ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    #[default]
    Desktop,
    Mobile,
    Tablet,
}

/// How the remote target is rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderingProfile {
    pub mode: RenderMode,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub javascript: bool,
}

impl Default for RenderingProfile {
    fn default() -> Self {
        Self {
            mode: RenderMode::Desktop,
            viewport_width: 1280,
            viewport_height: 720,
            javascript: true,
        }
    }
}

/// Expected network shape between a replica and its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkProfile {
    /// Baseline round-trip latency in milliseconds.
    pub base_latency_ms: f64,
    pub bandwidth_kbps: f64,
    pub jitter_ms: f64,
}

impl Default for NetworkProfile {
    fn default() -> Self {
        Self {
            base_latency_ms: 80.0,
            bandwidth_kbps: 4096.0,
            jitter_ms: 12.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

/// Proxy constraints a session places on the mesh.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyRequirement {
    /// Explicit pool preference.
    pub pool_id: Option<String>,
    /// Pool used by shards outside the preferred regions.
    pub failover_pool_id: Option<String>,
    pub regions: Vec<String>,
    /// ISO 3166-1 alpha-2 codes.
    pub countries: Vec<String>,
    /// Acceptable protocols; empty accepts any.
    pub protocols: Vec<ProxyProtocol>,
    /// Sticky sessions are never rotated.
    pub sticky: bool,
}

impl ProxyRequirement {
    /// Whether `region` was explicitly requested (case-insensitive).
    pub fn prefers_region(&self, region: &str) -> bool {
        self.regions.iter().any(|r| r.trim().eq_ignore_ascii_case(region))
    }

    /// Upper-cased, trimmed, de-duplicated country codes in declaration order.
    pub fn normalized_countries(&self) -> Vec<String> {
        normalize_country_codes(&self.countries)
    }
}

/// Upper-case, trim, and de-duplicate country codes, keeping first occurrence order.
pub fn normalize_country_codes(codes: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    codes
        .iter()
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty() && seen.insert(c.clone()))
        .collect()
}

/// What a session embeds and how it reaches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTarget {
    pub url: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub rendering: RenderingProfile,
    #[serde(default)]
    pub network: NetworkProfile,
    #[serde(default)]
    pub proxy: Option<ProxyRequirement>,
    /// Ordered region preference; earlier regions get more capacity.
    #[serde(default)]
    pub geo_affinity: Vec<String>,
}

/// Replica sizing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionPolicy {
    pub target_replica_count: u64,
    pub max_replica_burst: u64,
    /// Fraction of replicas sampled for observability, in `[0, 1]`.
    pub sample_rate: f64,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            target_replica_count: 1,
            max_replica_burst: 0,
            sample_rate: 0.05,
        }
    }
}

// ── Shards ─────────────────────────────────────────────────────────

/// A regional slice of a session's replica capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaShard {
    pub id: String,
    pub label: String,
    pub region: String,
    /// Always at least 1.
    pub capacity: u64,
    pub warm_pool: u64,
    #[serde(default)]
    pub proxy_pool_id: Option<String>,
    pub latency_budget_ms: u64,
    pub autoscale_window_sec: u64,
}

// ── Definition ─────────────────────────────────────────────────────

/// Declared intent for a session. Replaced wholesale on upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDefinition {
    /// Assigned by the orchestrator when absent.
    #[serde(default)]
    pub id: Option<SessionId>,
    pub target: SessionTarget,
    #[serde(default)]
    pub policy: SessionPolicy,
    /// May be empty before normalization.
    #[serde(default)]
    pub shards: Vec<ReplicaShard>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SessionDefinition {
    /// A definition for `url` with default profiles and policy.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: None,
            target: SessionTarget {
                url: url.into(),
                label: None,
                rendering: RenderingProfile::default(),
                network: NetworkProfile::default(),
                proxy: None,
                geo_affinity: Vec::new(),
            },
            policy: SessionPolicy::default(),
            shards: Vec::new(),
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Lower-cased, trimmed, de-duplicated geo affinity, or the default region.
    pub fn regions(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let regions: Vec<String> = self
            .target
            .geo_affinity
            .iter()
            .map(|r| r.trim().to_ascii_lowercase())
            .filter(|r| !r.is_empty() && seen.insert(r.clone()))
            .collect();
        if regions.is_empty() {
            vec![DEFAULT_REGION.to_string()]
        } else {
            regions
        }
    }

    /// Total capacity a topology with `unit_count` shards must carry.
    pub fn desired_replicas(&self, unit_count: usize) -> u64 {
        self.policy
            .target_replica_count
            .max(unit_count as u64)
            .max(1)
    }

    pub fn base_latency_ms(&self) -> f64 {
        let base = self.target.network.base_latency_ms;
        if base.is_finite() { base.max(0.0) } else { 0.0 }
    }

    /// Country codes requested through the proxy requirement.
    pub fn proxy_countries(&self) -> Vec<String> {
        self.target
            .proxy
            .as_ref()
            .map(ProxyRequirement::normalized_countries)
            .unwrap_or_default()
    }

    /// Reject definitions that cannot be planned.
    pub fn validate(&self) -> ModelResult<()> {
        if self.target.url.trim().is_empty() {
            return Err(ModelError::InvalidDefinition("target url is empty".to_string()));
        }
        let rate = self.policy.sample_rate;
        if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
            return Err(ModelError::InvalidDefinition(format!(
                "sample rate {rate} outside [0, 1]"
            )));
        }
        let latency = self.target.network.base_latency_ms;
        if !latency.is_finite() || latency < 0.0 {
            return Err(ModelError::InvalidDefinition(format!(
                "base network latency {latency} is not a non-negative number"
            )));
        }
        if self.id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(ModelError::InvalidDefinition("session id is blank".to_string()));
        }
        let mut shard_ids = HashSet::new();
        for shard in &self.shards {
            if shard.id.trim().is_empty() {
                return Err(ModelError::InvalidDefinition("shard id is blank".to_string()));
            }
            if !shard_ids.insert(shard.id.as_str()) {
                return Err(ModelError::InvalidDefinition(format!(
                    "duplicate shard id {}",
                    shard.id
                )));
            }
        }
        Ok(())
    }
}

// ── Blueprint ──────────────────────────────────────────────────────

/// Lifecycle status of a blueprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlueprintStatus {
    /// Set by upstream producers before first ingestion.
    Draft,
    Steady,
    Scaling,
    Degraded,
    Terminated,
}

impl BlueprintStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlueprintStatus::Draft => "draft",
            BlueprintStatus::Steady => "steady",
            BlueprintStatus::Scaling => "scaling",
            BlueprintStatus::Degraded => "degraded",
            BlueprintStatus::Terminated => "terminated",
        }
    }
}

/// A registered session: its normalized definition plus lifecycle data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBlueprint {
    pub id: SessionId,
    pub definition: SessionDefinition,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Unix milliseconds.
    pub updated_at: u64,
    /// Starts at 1, +1 per upsert.
    pub version: u64,
    pub status: BlueprintStatus,
    pub metrics_ttl_ms: u64,
}

impl SessionBlueprint {
    /// Sum of shard capacities.
    pub fn desired_replicas(&self) -> u64 {
        self.definition.shards.iter().map(|s| s.capacity).sum()
    }
}

// ── Replicas ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    Active,
    Initializing,
    Throttled,
    Error,
    Terminated,
}

/// Synthetic view of one replica. Regenerated per query, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSummary {
    pub id: String,
    pub session_id: SessionId,
    pub status: ReplicaStatus,
    pub region: String,
    pub last_seen_at: u64,
    pub latency_ms: u64,
    pub proxy_id: Option<String>,
    pub error_code: Option<String>,
}

// ── Metrics ────────────────────────────────────────────────────────

/// Smoothed point-in-time metrics for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub session_id: SessionId,
    /// Unix milliseconds.
    pub timestamp: u64,
    pub active_replicas: f64,
    pub errors_per_minute: f64,
    pub median_latency_ms: f64,
    pub bandwidth_kbps: f64,
}

// ── Coverage ───────────────────────────────────────────────────────

/// How much of the known country catalog the mesh has materialized.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageSnapshot {
    pub materialized_countries: usize,
    /// Static catalog plus synthesized dynamic blueprints.
    pub known_countries: usize,
    pub coverage_ratio: f64,
    pub countries: Vec<String>,
}
