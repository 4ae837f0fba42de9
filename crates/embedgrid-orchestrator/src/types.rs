//! Request and response records of the orchestrator call surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use embedgrid_hypergrid::GlobalStats;
use embedgrid_mesh::ProxyMetrics;
use embedgrid_model::{BlueprintStatus, CoverageSnapshot, SessionBlueprint, SessionId};

/// Filters and paging for [`list_blueprints`](crate::SessionOrchestrator::list_blueprints).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListOptions {
    pub status: Option<BlueprintStatus>,
    pub tag: Option<String>,
    pub offset: usize,
    /// `None` returns everything after `offset`.
    pub limit: Option<usize>,
}

/// One item that did not make it through a batch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkFailure {
    /// Position in the request.
    pub index: usize,
    /// Session id or raw input, when known.
    pub input: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpsertResult {
    pub successes: Vec<SessionBlueprint>,
    pub failures: Vec<BulkFailure>,
}

/// Lightweight per-session row of a [`BlueprintSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintSummary {
    pub id: SessionId,
    pub label: Option<String>,
    pub url: String,
    pub status: BlueprintStatus,
    pub version: u64,
    pub desired_replicas: u64,
    pub regions: Vec<String>,
    pub updated_at: u64,
}

impl From<&SessionBlueprint> for BlueprintSummary {
    fn from(bp: &SessionBlueprint) -> Self {
        Self {
            id: bp.id.clone(),
            label: bp.definition.target.label.clone(),
            url: bp.definition.target.url.clone(),
            status: bp.status,
            version: bp.version,
            desired_replicas: bp.desired_replicas(),
            regions: bp.definition.shards.iter().map(|s| s.region.clone()).collect(),
            updated_at: bp.updated_at,
        }
    }
}

/// Registry view polled by push streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintSnapshot {
    pub generated_at: u64,
    pub count: usize,
    pub status_counts: BTreeMap<String, usize>,
    /// Ordered by id.
    pub sessions: Vec<BlueprintSummary>,
}

/// Population-wide health, combining the hypergrid and the proxy mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalMetrics {
    pub generated_at: u64,
    pub total_sessions: usize,
    pub desired_replicas: u64,
    pub status_counts: BTreeMap<String, usize>,
    pub sessions: GlobalStats,
    pub proxy: ProxyMetrics,
    pub coverage: CoverageSnapshot,
}
