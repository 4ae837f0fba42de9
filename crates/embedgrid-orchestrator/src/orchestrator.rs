//! Session orchestrator: the blueprint registry and its derived caches.
//!
//! The `SessionOrchestrator` is the facade that:
//! - Normalizes definitions into blueprints and versions them
//! - Indexes blueprints by shard region and proxy pool
//! - Serves replica samples and TTL-cached metrics
//! - Recomputes the hypergrid lazily, invalidating it on every mutation

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use embedgrid_hypergrid::{HypergridSnapshot, HypergridSources, compute_snapshot};
use embedgrid_mesh::{ProxyMeshManager, pool_id_for};
use embedgrid_model::{
    BlueprintStatus, MetricsSnapshot, ReplicaShard, ReplicaSummary, SessionBlueprint,
    SessionDefinition, SessionId, epoch_millis,
};
use embedgrid_topology::{SampleOptions, ensure_shard_topology, sample_replicas, synthesize_metrics};

use crate::config::OrchestratorConfig;
use crate::content::{ContentFactory, SaltedContentFactory};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{
    BlueprintSnapshot, BlueprintSummary, BulkFailure, BulkUpsertResult, GlobalMetrics, ListOptions,
};

/// New blueprints above this target start out `scaling`.
pub const SCALING_START_THRESHOLD: u64 = 10_000;
/// Growth beyond this factor of the previous target marks a blueprint `scaling`.
pub const SCALE_UP_FACTOR: f64 = 1.4;
/// Shrinking below this factor of the previous target marks a blueprint `degraded`.
pub const SCALE_DOWN_FACTOR: f64 = 0.6;

/// Per-blueprint lookup structures.
#[derive(Debug, Clone, Default)]
struct BlueprintIndex {
    /// region → position in `definition.shards`.
    shard_by_region: HashMap<String, usize>,
    proxy_pools: BTreeSet<String>,
}

impl BlueprintIndex {
    fn build(definition: &SessionDefinition) -> Self {
        let mut index = Self::default();
        for (position, shard) in definition.shards.iter().enumerate() {
            index.shard_by_region.entry(shard.region.clone()).or_insert(position);
            if let Some(pool) = &shard.proxy_pool_id {
                index.proxy_pools.insert(pool.clone());
            }
        }
        if let Some(pool) = definition.target.proxy.as_ref().and_then(|p| p.pool_id.clone()) {
            index.proxy_pools.insert(pool);
        }
        for country in definition.proxy_countries() {
            index.proxy_pools.insert(pool_id_for(&country));
        }
        index
    }
}

/// Blueprints plus their indexes, mutated together under one lock.
#[derive(Default)]
struct Registry {
    blueprints: HashMap<SessionId, SessionBlueprint>,
    index: HashMap<SessionId, BlueprintIndex>,
    /// pool_id → sessions referencing it.
    pool_sessions: HashMap<String, BTreeSet<SessionId>>,
}

impl Registry {
    fn insert(&mut self, blueprint: SessionBlueprint) {
        self.unindex(&blueprint.id);
        let index = BlueprintIndex::build(&blueprint.definition);
        for pool in &index.proxy_pools {
            self.pool_sessions
                .entry(pool.clone())
                .or_default()
                .insert(blueprint.id.clone());
        }
        self.index.insert(blueprint.id.clone(), index);
        self.blueprints.insert(blueprint.id.clone(), blueprint);
    }

    fn remove(&mut self, id: &str) -> Option<SessionBlueprint> {
        self.unindex(id);
        self.blueprints.remove(id)
    }

    fn unindex(&mut self, id: &str) {
        let Some(index) = self.index.remove(id) else {
            return;
        };
        for pool in index.proxy_pools {
            if let Some(sessions) = self.pool_sessions.get_mut(&pool) {
                sessions.remove(id);
                if sessions.is_empty() {
                    self.pool_sessions.remove(&pool);
                }
            }
        }
    }
}

pub(crate) fn new_session_id() -> SessionId {
    format!("sess-{}", Uuid::new_v4())
}

/// Status of a blueprint created from `definition`.
fn initial_status(definition: &SessionDefinition) -> BlueprintStatus {
    if definition.policy.target_replica_count > SCALING_START_THRESHOLD {
        BlueprintStatus::Scaling
    } else {
        BlueprintStatus::Steady
    }
}

/// Status after replacing `previous`'s definition with `next`.
fn next_status(previous: &SessionBlueprint, next: &SessionDefinition) -> BlueprintStatus {
    let old = previous.definition.policy.target_replica_count as f64;
    let new = next.policy.target_replica_count as f64;
    if new > old * SCALE_UP_FACTOR {
        BlueprintStatus::Scaling
    } else if new < old * SCALE_DOWN_FACTOR {
        BlueprintStatus::Degraded
    } else {
        previous.status
    }
}

/// Owns every session blueprint and composes the planner, mesh, and hypergrid.
pub struct SessionOrchestrator {
    pub(crate) config: OrchestratorConfig,
    pub(crate) mesh: Arc<ProxyMeshManager>,
    pub(crate) content: Arc<dyn ContentFactory>,
    registry: RwLock<Registry>,
    /// Latest smoothed metrics per session.
    metrics: RwLock<HashMap<SessionId, MetricsSnapshot>>,
    hypergrid: RwLock<Option<Arc<HypergridSnapshot>>>,
}

impl SessionOrchestrator {
    pub fn new(config: OrchestratorConfig, mesh: Arc<ProxyMeshManager>) -> Self {
        let content = Arc::new(SaltedContentFactory::new(config.content_salt.clone()));
        Self {
            config,
            mesh,
            content,
            registry: RwLock::new(Registry::default()),
            metrics: RwLock::new(HashMap::new()),
            hypergrid: RwLock::new(None),
        }
    }

    /// Replace the content factory used for fallback URLs.
    pub fn with_content_factory(mut self, content: Arc<dyn ContentFactory>) -> Self {
        self.content = content;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn mesh(&self) -> &Arc<ProxyMeshManager> {
        &self.mesh
    }

    pub async fn session_count(&self) -> usize {
        self.registry.read().await.blueprints.len()
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Create or replace a blueprint from `definition`.
    pub async fn upsert(&self, definition: SessionDefinition) -> OrchestratorResult<SessionBlueprint> {
        self.upsert_inner(definition, None).await
    }

    /// Upsert only if the stored version equals `expected_version` (0 = must not exist).
    pub async fn upsert_if_version(
        &self,
        definition: SessionDefinition,
        expected_version: u64,
    ) -> OrchestratorResult<SessionBlueprint> {
        self.upsert_inner(definition, Some(expected_version)).await
    }

    async fn upsert_inner(
        &self,
        mut definition: SessionDefinition,
        expected_version: Option<u64>,
    ) -> OrchestratorResult<SessionBlueprint> {
        definition.validate()?;
        let id = definition.id.clone().unwrap_or_else(new_session_id);
        definition.id = Some(id.clone());
        definition.shards = ensure_shard_topology(&definition);
        let now = epoch_millis();

        let blueprint = {
            let mut registry = self.registry.write().await;
            let existing = registry.blueprints.get(&id);

            if let Some(expected) = expected_version {
                let actual = existing.map_or(0, |bp| bp.version);
                if actual != expected {
                    return Err(OrchestratorError::ConcurrentModification { id, expected, actual });
                }
            }

            let blueprint = match existing {
                Some(previous) => SessionBlueprint {
                    id: id.clone(),
                    status: next_status(previous, &definition),
                    created_at: previous.created_at,
                    updated_at: now,
                    version: previous.version + 1,
                    metrics_ttl_ms: self.config.metrics_ttl_ms,
                    definition,
                },
                None => SessionBlueprint {
                    id: id.clone(),
                    status: initial_status(&definition),
                    created_at: now,
                    updated_at: now,
                    version: 1,
                    metrics_ttl_ms: self.config.metrics_ttl_ms,
                    definition,
                },
            };
            registry.insert(blueprint.clone());
            blueprint
        };

        self.invalidate_hypergrid().await;
        debug!(
            session_id = %blueprint.id,
            version = blueprint.version,
            status = blueprint.status.as_str(),
            shards = blueprint.definition.shards.len(),
            desired = blueprint.desired_replicas(),
            "upserted blueprint"
        );
        Ok(blueprint)
    }

    /// Upsert each definition independently; one bad item never aborts the rest.
    pub async fn bulk_upsert(&self, definitions: Vec<SessionDefinition>) -> BulkUpsertResult {
        let mut result = BulkUpsertResult::default();
        for (index, definition) in definitions.into_iter().enumerate() {
            let input = definition.id.clone();
            match self.upsert(definition).await {
                Ok(blueprint) => result.successes.push(blueprint),
                Err(e) => {
                    debug!(index, error = %e, "bulk upsert item rejected");
                    result.failures.push(BulkFailure {
                        index,
                        input,
                        reason: e.to_string(),
                    });
                }
            }
        }
        info!(
            successes = result.successes.len(),
            failures = result.failures.len(),
            "bulk upsert complete"
        );
        result
    }

    /// Remove a blueprint without a status transition. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.registry.write().await.remove(id);
        if removed.is_none() {
            return false;
        }
        self.forget_session(id).await;
        info!(session_id = %id, "deleted blueprint");
        true
    }

    /// Change a session's target replica count, re-normalizing its shards.
    pub async fn scale_session(&self, id: &str, target_replica_count: u64) -> OrchestratorResult<SessionBlueprint> {
        let mut definition = self.get_blueprint(id).await?.definition;
        definition.policy.target_replica_count = target_replica_count;
        let blueprint = self.upsert(definition).await?;
        info!(
            session_id = %id,
            target = target_replica_count,
            status = blueprint.status.as_str(),
            "scaled session"
        );
        Ok(blueprint)
    }

    /// Mark a session terminated, release its proxy, and drop it from the registry.
    pub async fn terminate_session(&self, id: &str) -> OrchestratorResult<SessionBlueprint> {
        let mut blueprint = self
            .registry
            .write()
            .await
            .remove(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        blueprint.status = BlueprintStatus::Terminated;
        blueprint.updated_at = epoch_millis();

        self.forget_session(id).await;
        info!(session_id = %id, version = blueprint.version, "terminated session");
        Ok(blueprint)
    }

    /// Release the proxy binding and cached state of a removed session.
    async fn forget_session(&self, id: &str) {
        if let Err(e) = self.mesh.release_proxy(id).await {
            debug!(session_id = %id, error = %e, "no proxy binding to release");
        }
        self.metrics.write().await.remove(id);
        self.invalidate_hypergrid().await;
    }

    async fn invalidate_hypergrid(&self) {
        *self.hypergrid.write().await = None;
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub async fn get_blueprint(&self, id: &str) -> OrchestratorResult<SessionBlueprint> {
        self.registry
            .read()
            .await
            .blueprints
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    /// Blueprints ordered by creation time, then id.
    pub async fn list_blueprints(&self, options: &ListOptions) -> Vec<SessionBlueprint> {
        let registry = self.registry.read().await;
        let mut matching: Vec<&SessionBlueprint> = registry
            .blueprints
            .values()
            .filter(|bp| options.status.is_none_or(|s| bp.status == s))
            .filter(|bp| {
                options
                    .tag
                    .as_ref()
                    .is_none_or(|tag| bp.definition.tags.iter().any(|t| t == tag))
            })
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        matching
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Deterministic replica sample. `as_of_ms == 0` means now.
    pub async fn get_replica_sample(
        &self,
        id: &str,
        options: SampleOptions,
    ) -> OrchestratorResult<Vec<ReplicaSummary>> {
        let blueprint = self.get_blueprint(id).await?;
        let options = SampleOptions {
            as_of_ms: if options.as_of_ms == 0 { epoch_millis() } else { options.as_of_ms },
            ..options
        };
        Ok(sample_replicas(&blueprint, &options))
    }

    /// Smoothed metrics, re-synthesized once the cached snapshot is older than the blueprint's TTL.
    pub async fn get_metrics(&self, id: &str) -> OrchestratorResult<MetricsSnapshot> {
        let blueprint = self.get_blueprint(id).await?;
        let now = epoch_millis();

        if let Some(cached) = self.metrics.read().await.get(id) {
            if now.saturating_sub(cached.timestamp) < blueprint.metrics_ttl_ms {
                return Ok(cached.clone());
            }
        }

        let mut cache = self.metrics.write().await;
        let snapshot = synthesize_metrics(&blueprint, cache.get(id), now);
        cache.insert(id.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    /// Cached hypergrid, recomputed when older than `ttl_ms` (default from config).
    pub async fn get_hypergrid_snapshot(&self, ttl_ms: Option<u64>) -> Arc<HypergridSnapshot> {
        let ttl = ttl_ms.unwrap_or(self.config.hypergrid_ttl_ms);
        let now = epoch_millis();
        let fresh = |generated_at: u64| now.saturating_sub(generated_at) < ttl;

        if let Some(snapshot) = self.hypergrid.read().await.as_ref().filter(|s| fresh(s.generated_at)) {
            debug!("hypergrid cache hit");
            return snapshot.clone();
        }

        let coverage = self.mesh.get_coverage_snapshot().await;
        let mut slot = self.hypergrid.write().await;
        // Another caller may have refreshed it while we waited.
        if let Some(snapshot) = slot.as_ref().filter(|s| fresh(s.generated_at)) {
            return snapshot.clone();
        }

        let snapshot = {
            let registry = self.registry.read().await;
            let metrics = self.metrics.read().await;
            let mut blueprints: Vec<&SessionBlueprint> = registry.blueprints.values().collect();
            blueprints.sort_by(|a, b| a.id.cmp(&b.id));
            Arc::new(compute_snapshot(
                &HypergridSources {
                    blueprints: &blueprints,
                    metrics: &*metrics,
                    coverage: &coverage,
                },
                now,
            ))
        };
        *slot = Some(snapshot.clone());
        snapshot
    }

    /// Population-wide statistics for dashboards.
    pub async fn get_global_metrics(&self) -> OrchestratorResult<GlobalMetrics> {
        let hypergrid = self.get_hypergrid_snapshot(None).await;
        let proxy = self.mesh.get_proxy_metrics(None).await?;
        let coverage = self.mesh.get_coverage_snapshot().await;

        let registry = self.registry.read().await;
        let mut status_counts = BTreeMap::new();
        let mut desired_replicas = 0;
        for bp in registry.blueprints.values() {
            *status_counts.entry(bp.status.as_str().to_string()).or_insert(0) += 1;
            desired_replicas += bp.desired_replicas();
        }

        Ok(GlobalMetrics {
            generated_at: epoch_millis(),
            total_sessions: registry.blueprints.len(),
            desired_replicas,
            status_counts,
            sessions: hypergrid.global.clone(),
            proxy,
            coverage,
        })
    }

    /// Summaries of every blueprint, for push streams.
    pub async fn get_blueprint_snapshot(&self) -> BlueprintSnapshot {
        let registry = self.registry.read().await;
        let mut sessions: Vec<BlueprintSummary> = registry.blueprints.values().map(BlueprintSummary::from).collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));

        let mut status_counts = BTreeMap::new();
        for s in &sessions {
            *status_counts.entry(s.status.as_str().to_string()).or_insert(0) += 1;
        }

        BlueprintSnapshot {
            generated_at: epoch_millis(),
            count: sessions.len(),
            status_counts,
            sessions,
        }
    }

    /// The shard serving `region` in session `id`, if any.
    pub async fn shard_for_region(&self, id: &str, region: &str) -> OrchestratorResult<Option<ReplicaShard>> {
        let registry = self.registry.read().await;
        let blueprint = registry
            .blueprints
            .get(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        let region = region.trim().to_ascii_lowercase();
        Ok(registry
            .index
            .get(id)
            .and_then(|index| index.shard_by_region.get(&region))
            .and_then(|&position| blueprint.definition.shards.get(position))
            .cloned())
    }

    /// Sessions whose shards or proxy requirement reference `pool_id`, ordered by id.
    pub async fn sessions_for_pool(&self, pool_id: &str) -> Vec<SessionId> {
        self.registry
            .read()
            .await
            .pool_sessions
            .get(pool_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }
}
