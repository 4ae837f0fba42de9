//! Proxy mesh manager: pool registry, assignment, rotation, and metrics.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use embedgrid_model::{
    CoverageSnapshot, ProxyRequirement, SessionId, epoch_millis, normalize_country_codes,
};

use crate::catalog::{self, CountryBlueprint, build_pool, pool_id_for};
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::hooks::{FailoverStrategy, HealthProbe, NoFailover, TouchProbe};
use crate::scorer::{NodeScore, pick_weighted, rank_candidates};
use crate::types::{
    FALLBACK_POOL_ID, GeoHint, MeshEvent, NodeStatus, PoolMetrics, ProxyAssignment, ProxyMetrics,
    ProxyNode, ProxyPool, ProxySession,
};

/// Smoothing factor for a node's success rate on each recorded request.
const SUCCESS_RATE_ALPHA: f64 = 0.1;

/// What [`ProxyMeshManager::rotate_proxy`] did with a binding.
#[derive(Debug, Clone, PartialEq)]
pub enum RotationOutcome {
    /// Sticky binding left in place.
    Sticky { proxy_id: String },
    /// Re-assigned through normal scoring.
    Rotated { from: String, assignment: ProxyAssignment },
    /// Scoring found nothing; the failover strategy supplied a node.
    FailedOver { from: String, assignment: ProxyAssignment },
    /// Nothing else worked; bound to the fallback node.
    Fallback { from: String, assignment: ProxyAssignment },
}

impl RotationOutcome {
    /// The binding after rotation, if it changed.
    pub fn assignment(&self) -> Option<&ProxyAssignment> {
        match self {
            RotationOutcome::Sticky { .. } => None,
            RotationOutcome::Rotated { assignment, .. }
            | RotationOutcome::FailedOver { assignment, .. }
            | RotationOutcome::Fallback { assignment, .. } => Some(assignment),
        }
    }
}

/// Registry of proxy pools and the sessions bound to their nodes.
///
/// Locks are taken in the order `dynamic_blueprints` → `pools` → `sessions`.
pub struct ProxyMeshManager {
    pub(crate) config: MeshConfig,
    /// Blueprints synthesized for countries outside the static catalog.
    dynamic_blueprints: RwLock<HashMap<String, CountryBlueprint>>,
    /// pool_id → pool.
    pub(crate) pools: RwLock<BTreeMap<String, ProxyPool>>,
    /// session_id → binding.
    pub(crate) sessions: RwLock<HashMap<SessionId, ProxySession>>,
    events: broadcast::Sender<MeshEvent>,
    failover: Arc<dyn FailoverStrategy>,
    pub(crate) probe: Arc<dyn HealthProbe>,
}

impl ProxyMeshManager {
    /// Create an empty mesh. Pools materialize on first reference.
    pub fn new(config: MeshConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            dynamic_blueprints: RwLock::new(HashMap::new()),
            pools: RwLock::new(BTreeMap::new()),
            sessions: RwLock::new(HashMap::new()),
            events,
            failover: Arc::new(NoFailover),
            probe: Arc::new(TouchProbe),
        }
    }

    /// Replace the failover strategy.
    pub fn with_failover(mut self, failover: Arc<dyn FailoverStrategy>) -> Self {
        self.failover = failover;
        self
    }

    /// Replace the health probe.
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Subscribe to mesh events. Slow subscribers lag rather than block the mesh.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: MeshEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Blueprint for `code`: static catalog, cached synthesis, or fresh synthesis.
    pub async fn resolve_blueprint(&self, code: &str) -> CountryBlueprint {
        let code = code.trim().to_ascii_uppercase();
        if let Some(bp) = catalog::static_blueprint(&code) {
            return bp;
        }
        if let Some(bp) = self.dynamic_blueprints.read().await.get(&code) {
            return bp.clone();
        }

        let mut dynamic = self.dynamic_blueprints.write().await;
        dynamic
            .entry(code.clone())
            .or_insert_with(|| {
                let bp = catalog::synthesize_blueprint(&code);
                debug!(country = %code, region = %bp.region, nodes = bp.node_count, "synthesized country blueprint");
                bp
            })
            .clone()
    }

    /// Make sure a pool exists for each country. Returns pool ids in normalized input order.
    pub async fn ensure_country_pools(&self, countries: &[String]) -> Vec<String> {
        let codes = normalize_country_codes(countries);
        if codes.is_empty() {
            return Vec::new();
        }

        let mut blueprints = Vec::with_capacity(codes.len());
        for code in &codes {
            blueprints.push(self.resolve_blueprint(code).await);
        }

        let now = epoch_millis();
        let mut pools = self.pools.write().await;
        blueprints
            .iter()
            .map(|bp| {
                let pool_id = pool_id_for(&bp.country_code);
                if !pools.contains_key(&pool_id) {
                    let pool = build_pool(bp, &self.config, now);
                    info!(
                        pool = %pool_id,
                        country = %bp.country_code,
                        region = %bp.region,
                        nodes = pool.nodes.len(),
                        "materialized proxy pool"
                    );
                    self.emit(MeshEvent::PoolMaterialized {
                        pool_id: pool_id.clone(),
                        country_code: bp.country_code.clone(),
                        nodes: pool.nodes.len(),
                    });
                    pools.insert(pool_id.clone(), pool);
                }
                pool_id
            })
            .collect()
    }

    /// Bind `session_id` to the best available node.
    ///
    /// An existing binding is replaced only once a new node has been picked;
    /// its slot counts as free while picking, so the same node may be kept.
    /// On failure the previous binding stays in place. The returned node is
    /// the node as it was when selected, before its `concurrent` counter was
    /// bumped.
    pub async fn assign_proxy(
        &self,
        session_id: &str,
        requirement: &ProxyRequirement,
        hint: Option<GeoHint>,
    ) -> MeshResult<ProxyAssignment> {
        if !requirement.countries.is_empty() {
            self.ensure_country_pools(&requirement.countries).await;
        }
        let hint = hint.unwrap_or_else(|| GeoHint::from_requirement(requirement));

        let now = epoch_millis();
        let mut pools = self.pools.write().await;
        let mut sessions = self.sessions.write().await;

        let previous = sessions
            .get(session_id)
            .map(|b| (b.pool_id.clone(), b.proxy_id.clone()));
        if let Some((pool_id, proxy_id)) = &previous {
            if let Some(node) = find_node_mut(&mut pools, pool_id, proxy_id) {
                node.concurrent = node.concurrent.saturating_sub(1);
            }
        }

        let picked = self.pick_locked(&pools, session_id, requirement, &hint, now);

        // Put the slot back; release_locked frees it again on success.
        if let Some((pool_id, proxy_id)) = &previous {
            if let Some(node) = find_node_mut(&mut pools, pool_id, proxy_id) {
                node.concurrent += 1;
            }
        }

        let picked = picked?;
        self.release_locked(&mut pools, &mut sessions, session_id);
        self.commit_locked(&mut pools, &mut sessions, session_id, requirement, picked, now)
    }

    /// Like [`assign_proxy`](Self::assign_proxy), but binds the fallback node
    /// instead of failing.
    pub async fn assign_or_fallback(
        &self,
        session_id: &str,
        requirement: &ProxyRequirement,
        hint: Option<GeoHint>,
    ) -> ProxyAssignment {
        match self.assign_proxy(session_id, requirement, hint).await {
            Ok(assignment) => assignment,
            Err(e) => {
                warn!(%session_id, error = %e, "proxy assignment unavailable, using fallback node");
                let mut pools = self.pools.write().await;
                let mut sessions = self.sessions.write().await;
                self.release_locked(&mut pools, &mut sessions, session_id);
                self.bind_fallback_locked(&mut sessions, session_id, requirement, epoch_millis())
            }
        }
    }

    /// Drop the binding for `session_id` and free its node slot.
    pub async fn release_proxy(&self, session_id: &str) -> MeshResult<ProxySession> {
        let mut pools = self.pools.write().await;
        let mut sessions = self.sessions.write().await;
        self.release_locked(&mut pools, &mut sessions, session_id)
            .ok_or_else(|| MeshError::SessionNotBound(session_id.to_string()))
    }

    /// Move a non-sticky session to a new node.
    ///
    /// Tries normal scoring with the session's original requirement, then the
    /// failover strategy, then the fallback node. Never leaves the session unbound.
    pub async fn rotate_proxy(&self, session_id: &str) -> MeshResult<RotationOutcome> {
        let mut pools = self.pools.write().await;
        let mut sessions = self.sessions.write().await;
        self.rotate_locked(&mut pools, &mut sessions, session_id, epoch_millis())
    }

    pub(crate) fn rotate_locked(
        &self,
        pools: &mut BTreeMap<String, ProxyPool>,
        sessions: &mut HashMap<SessionId, ProxySession>,
        session_id: &str,
        now_ms: u64,
    ) -> MeshResult<RotationOutcome> {
        let current = sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| MeshError::SessionNotBound(session_id.to_string()))?;

        if current.sticky {
            return Ok(RotationOutcome::Sticky {
                proxy_id: current.proxy_id,
            });
        }

        self.release_locked(pools, sessions, session_id);
        let from = current.proxy_id.clone();
        let hint = GeoHint::from_requirement(&current.requirement);

        let outcome = match self.assign_locked(pools, sessions, session_id, &current.requirement, &hint, now_ms) {
            Ok(assignment) => RotationOutcome::Rotated { from, assignment },
            Err(e) => {
                debug!(%session_id, error = %e, "rotation found no scored node, trying failover");
                match self.failover_locked(pools, sessions, &current, now_ms) {
                    Some(assignment) => RotationOutcome::FailedOver { from, assignment },
                    None => {
                        warn!(%session_id, "rotation fell back to default node");
                        let assignment =
                            self.bind_fallback_locked(sessions, session_id, &current.requirement, now_ms);
                        RotationOutcome::Fallback { from, assignment }
                    }
                }
            }
        };

        if let Some(assignment) = outcome.assignment() {
            self.emit(MeshEvent::Rotated {
                session_id: session_id.to_string(),
                from: current.proxy_id,
                to: assignment.node.id.clone(),
            });
        }
        Ok(outcome)
    }

    /// Record one request made through the session's proxy.
    pub async fn record_usage(&self, session_id: &str, success: bool) -> MeshResult<()> {
        let mut pools = self.pools.write().await;
        let mut sessions = self.sessions.write().await;
        let binding = sessions
            .get_mut(session_id)
            .ok_or_else(|| MeshError::SessionNotBound(session_id.to_string()))?;

        binding.request_count += 1;
        if !success {
            binding.error_count += 1;
        }
        binding.last_used_at = epoch_millis();

        if let Some(node) = find_node_mut(&mut pools, &binding.pool_id, &binding.proxy_id) {
            let observed = if success { 1.0 } else { 0.0 };
            node.success_rate = node.success_rate * (1.0 - SUCCESS_RATE_ALPHA) + observed * SUCCESS_RATE_ALPHA;
        }
        Ok(())
    }

    /// Current binding for `session_id`.
    pub async fn binding(&self, session_id: &str) -> Option<ProxySession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Snapshot of a pool.
    pub async fn pool(&self, pool_id: &str) -> Option<ProxyPool> {
        self.pools.read().await.get(pool_id).cloned()
    }

    pub async fn pool_ids(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }

    /// Force a node into `status`, e.g. for maintenance.
    pub async fn set_node_status(&self, pool_id: &str, node_id: &str, status: NodeStatus) -> MeshResult<()> {
        let mut pools = self.pools.write().await;
        let pool = pools
            .get_mut(pool_id)
            .ok_or_else(|| MeshError::PoolNotFound(pool_id.to_string()))?;
        let node = pool
            .nodes
            .iter_mut()
            .find(|n| n.id == node_id)
            .ok_or_else(|| MeshError::NodeNotFound {
                pool_id: pool_id.to_string(),
                node_id: node_id.to_string(),
            })?;
        node.status = status;
        if status == NodeStatus::Active {
            node.error_count = 0;
        }
        Ok(())
    }

    /// Aggregate node and pool statistics, optionally for a single pool.
    pub async fn get_proxy_metrics(&self, pool_id: Option<&str>) -> MeshResult<ProxyMetrics> {
        let pools = self.pools.read().await;
        let sessions = self.sessions.read().await;

        let selected: Vec<&ProxyPool> = match pool_id {
            Some(id) => vec![pools.get(id).ok_or_else(|| MeshError::PoolNotFound(id.to_string()))?],
            None => pools.values().collect(),
        };

        let mut metrics = ProxyMetrics {
            total_pools: selected.len(),
            ..ProxyMetrics::default()
        };
        let mut latency_sum = 0.0;
        let mut success_sum = 0.0;

        for pool in &selected {
            let pm = pool_metrics(pool);
            metrics.total_nodes += pm.nodes;
            metrics.active_nodes += pm.active_nodes;
            metrics.total_capacity += pm.max_concurrent;
            metrics.used_capacity += pm.concurrent;
            latency_sum += pm.average_latency_ms * pm.nodes as f64;
            success_sum += pm.average_success_rate * pm.nodes as f64;
            metrics.pools.push(pm);
        }

        if metrics.total_nodes > 0 {
            metrics.average_latency_ms = latency_sum / metrics.total_nodes as f64;
            metrics.average_success_rate = success_sum / metrics.total_nodes as f64;
        }
        metrics.active_sessions = match pool_id {
            Some(id) => sessions.values().filter(|s| s.pool_id == id).count(),
            None => sessions.len(),
        };
        Ok(metrics)
    }

    /// Ratio of materialized countries to every country the mesh knows about.
    pub async fn get_coverage_snapshot(&self) -> CoverageSnapshot {
        let dynamic = self.dynamic_blueprints.read().await;
        let pools = self.pools.read().await;

        let materialized: BTreeSet<String> = pools.values().filter_map(|p| p.country_code.clone()).collect();
        let known: BTreeSet<String> = catalog::static_country_codes()
            .map(str::to_string)
            .chain(dynamic.keys().cloned())
            .chain(materialized.iter().cloned())
            .collect();

        let coverage_ratio = if known.is_empty() {
            0.0
        } else {
            materialized.len() as f64 / known.len() as f64
        };

        CoverageSnapshot {
            materialized_countries: materialized.len(),
            known_countries: known.len(),
            coverage_ratio,
            countries: materialized.into_iter().collect(),
        }
    }

    // ── Locked helpers ─────────────────────────────────────────────

    fn assign_locked(
        &self,
        pools: &mut BTreeMap<String, ProxyPool>,
        sessions: &mut HashMap<SessionId, ProxySession>,
        session_id: &str,
        requirement: &ProxyRequirement,
        hint: &GeoHint,
        now_ms: u64,
    ) -> MeshResult<ProxyAssignment> {
        let picked = self.pick_locked(pools, session_id, requirement, hint, now_ms)?;
        self.commit_locked(pools, sessions, session_id, requirement, picked, now_ms)
    }

    /// Score candidates and pick one, without touching any state.
    fn pick_locked(
        &self,
        pools: &BTreeMap<String, ProxyPool>,
        session_id: &str,
        requirement: &ProxyRequirement,
        hint: &GeoHint,
        now_ms: u64,
    ) -> MeshResult<NodeScore> {
        let ranked = rank_candidates(pools.values(), requirement, hint, now_ms);
        let mut rng = rand::thread_rng();
        pick_weighted(&ranked, &mut rng)
            .cloned()
            .ok_or_else(|| MeshError::AssignmentUnavailable {
                session_id: session_id.to_string(),
                reason: format!("no candidate node across {} pools", pools.len()),
            })
    }

    /// Take a slot on `picked` and bind `session_id` to it.
    fn commit_locked(
        &self,
        pools: &mut BTreeMap<String, ProxyPool>,
        sessions: &mut HashMap<SessionId, ProxySession>,
        session_id: &str,
        requirement: &ProxyRequirement,
        picked: NodeScore,
        now_ms: u64,
    ) -> MeshResult<ProxyAssignment> {
        let node = pools
            .get_mut(&picked.pool_id)
            .and_then(|p| p.nodes.get_mut(picked.node_index))
            .ok_or_else(|| MeshError::NodeNotFound {
                pool_id: picked.pool_id.clone(),
                node_id: picked.node_id.clone(),
            })?;
        let selected = node.clone();
        node.concurrent += 1;

        debug!(
            %session_id,
            pool = %picked.pool_id,
            node = %picked.node_id,
            score = picked.score,
            "assigned proxy"
        );
        self.insert_binding(sessions, session_id, &picked.pool_id, &selected.id, requirement, now_ms);

        Ok(ProxyAssignment {
            session_id: session_id.to_string(),
            pool_id: picked.pool_id,
            node: selected,
            score: picked.score,
            fallback: false,
        })
    }

    fn failover_locked(
        &self,
        pools: &mut BTreeMap<String, ProxyPool>,
        sessions: &mut HashMap<SessionId, ProxySession>,
        previous: &ProxySession,
        now_ms: u64,
    ) -> Option<ProxyAssignment> {
        let pool = pools.get_mut(&previous.pool_id)?;
        let node_id = self.failover.failover(pool, previous)?;
        let node = pool
            .nodes
            .iter_mut()
            .find(|n| n.id == node_id && n.status == NodeStatus::Active && n.has_capacity())?;
        let selected = node.clone();
        node.concurrent += 1;

        let pool_id = pool.id.clone();
        self.insert_binding(sessions, &previous.session_id, &pool_id, &selected.id, &previous.requirement, now_ms);
        Some(ProxyAssignment {
            session_id: previous.session_id.clone(),
            pool_id,
            node: selected,
            score: 0.0,
            fallback: false,
        })
    }

    fn bind_fallback_locked(
        &self,
        sessions: &mut HashMap<SessionId, ProxySession>,
        session_id: &str,
        requirement: &ProxyRequirement,
        now_ms: u64,
    ) -> ProxyAssignment {
        let node = ProxyNode::fallback();
        self.insert_binding(sessions, session_id, FALLBACK_POOL_ID, &node.id, requirement, now_ms);
        ProxyAssignment {
            session_id: session_id.to_string(),
            pool_id: FALLBACK_POOL_ID.to_string(),
            node,
            score: 0.0,
            fallback: true,
        }
    }

    fn insert_binding(
        &self,
        sessions: &mut HashMap<SessionId, ProxySession>,
        session_id: &str,
        pool_id: &str,
        proxy_id: &str,
        requirement: &ProxyRequirement,
        now_ms: u64,
    ) {
        sessions.insert(
            session_id.to_string(),
            ProxySession {
                session_id: session_id.to_string(),
                proxy_id: proxy_id.to_string(),
                pool_id: pool_id.to_string(),
                assigned_at: now_ms,
                last_used_at: now_ms,
                request_count: 0,
                error_count: 0,
                sticky: requirement.sticky,
                requirement: requirement.clone(),
            },
        );
        self.emit(MeshEvent::Assigned {
            session_id: session_id.to_string(),
            pool_id: pool_id.to_string(),
            proxy_id: proxy_id.to_string(),
        });
    }

    /// Remove a binding and free its slot. The fallback node is not counted.
    fn release_locked(
        &self,
        pools: &mut BTreeMap<String, ProxyPool>,
        sessions: &mut HashMap<SessionId, ProxySession>,
        session_id: &str,
    ) -> Option<ProxySession> {
        let binding = sessions.remove(session_id)?;
        if let Some(node) = find_node_mut(pools, &binding.pool_id, &binding.proxy_id) {
            node.concurrent = node.concurrent.saturating_sub(1);
        }
        self.emit(MeshEvent::Released {
            session_id: session_id.to_string(),
            proxy_id: binding.proxy_id.clone(),
        });
        Some(binding)
    }
}

fn find_node_mut<'a>(
    pools: &'a mut BTreeMap<String, ProxyPool>,
    pool_id: &str,
    node_id: &str,
) -> Option<&'a mut ProxyNode> {
    pools
        .get_mut(pool_id)?
        .nodes
        .iter_mut()
        .find(|n| n.id == node_id)
}

fn pool_metrics(pool: &ProxyPool) -> PoolMetrics {
    let nodes = pool.nodes.len();
    let (latency, success) = pool
        .nodes
        .iter()
        .fold((0.0, 0.0), |(l, s), n| (l + n.latency_ms, s + n.success_rate));
    let divisor = nodes.max(1) as f64;

    PoolMetrics {
        pool_id: pool.id.clone(),
        country_code: pool.country_code.clone(),
        region: pool.region.clone(),
        nodes,
        active_nodes: pool.nodes.iter().filter(|n| n.status == NodeStatus::Active).count(),
        concurrent: pool.nodes.iter().map(|n| u64::from(n.concurrent)).sum(),
        max_concurrent: pool.nodes.iter().map(|n| u64::from(n.max_concurrent)).sum(),
        average_latency_ms: latency / divisor,
        average_success_rate: success / divisor,
    }
}
