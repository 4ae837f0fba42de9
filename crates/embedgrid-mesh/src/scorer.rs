//! Node scoring for proxy assignment.
//!
//! Evaluates candidate nodes using an additive combination of:
//! - **Performance**: success rate, latency, current load
//! - **Geography**: same region / same country as the caller's hint
//! - **Freshness**: a recent successful health check
//! - **Headroom**: spare concurrency
//!
//! The final pick is weighted-random among the top candidates so that a
//! burst of assignments spreads over several good nodes instead of piling
//! onto the single best one. This path is intentionally not seeded.

use rand::Rng;
use rand::seq::SliceRandom;

use embedgrid_model::ProxyRequirement;

use crate::types::{GeoHint, NodeStatus, ProxyNode, ProxyPool};

/// A health check newer than this earns the freshness bonus.
pub const FRESHNESS_WINDOW_MS: u64 = 30_000;
/// Candidates considered by the weighted pick.
pub const TOP_CANDIDATES: usize = 5;

/// Scored candidate node.
#[derive(Debug, Clone)]
pub struct NodeScore {
    pub pool_id: String,
    /// Position of the node inside its pool's `nodes`.
    pub node_index: usize,
    pub node_id: String,
    /// Total score (higher = better). Not bounded.
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Individual score components for debugging.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBreakdown {
    pub performance: f64,
    pub geography: f64,
    pub freshness: f64,
    pub headroom: f64,
}

/// Whether `pool` satisfies the pool, region, and country constraints of `requirement`.
///
/// With both regions and countries given, matching either is enough. With
/// only one given, that one must match. With neither, every pool qualifies.
pub fn pool_is_eligible(pool: &ProxyPool, requirement: &ProxyRequirement) -> bool {
    if let Some(pool_id) = &requirement.pool_id {
        if &pool.id != pool_id {
            return false;
        }
    }

    let countries = requirement.normalized_countries();
    let region_match = requirement.prefers_region(&pool.region);
    let country_match = pool
        .country_code
        .as_deref()
        .is_some_and(|code| countries.iter().any(|c| c == code));

    match (requirement.regions.is_empty(), countries.is_empty()) {
        (false, false) => region_match || country_match,
        (false, true) => region_match,
        (true, false) => country_match,
        (true, true) => true,
    }
}

/// Whether `node` can take one more session under `requirement`.
pub fn is_candidate(node: &ProxyNode, requirement: &ProxyRequirement) -> bool {
    node.status == NodeStatus::Active
        && node.has_capacity()
        && (requirement.protocols.is_empty() || requirement.protocols.contains(&node.protocol))
}

fn geo_score(node: &ProxyNode, hint: &GeoHint) -> f64 {
    let mut score = 0.5;
    if hint
        .region
        .as_deref()
        .is_some_and(|r| r.eq_ignore_ascii_case(&node.region))
    {
        score += 0.3;
    }
    if hint
        .country
        .as_deref()
        .is_some_and(|c| c.eq_ignore_ascii_case(&node.country_code))
    {
        score += 0.2;
    }
    score
}

/// Score a single node for a caller at `hint`, evaluated at `now_ms`.
pub fn score_node(
    pool_id: &str,
    node_index: usize,
    node: &ProxyNode,
    hint: &GeoHint,
    now_ms: u64,
) -> NodeScore {
    let load = node.load();
    let performance = 100.0 + node.success_rate * 40.0 - node.latency_ms / 10.0 - load * 20.0;
    let geography = geo_score(node, hint) * 25.0;
    let freshness = if now_ms.saturating_sub(node.last_health_check) <= FRESHNESS_WINDOW_MS {
        20.0
    } else {
        0.0
    };
    let headroom = (15.0 - load * 15.0).max(0.0);

    NodeScore {
        pool_id: pool_id.to_string(),
        node_index,
        node_id: node.id.clone(),
        score: performance + geography + freshness + headroom,
        breakdown: ScoreBreakdown {
            performance,
            geography,
            freshness,
            headroom,
        },
    }
}

/// Score every candidate node of every eligible pool, best first.
pub fn rank_candidates<'a>(
    pools: impl IntoIterator<Item = &'a ProxyPool>,
    requirement: &ProxyRequirement,
    hint: &GeoHint,
    now_ms: u64,
) -> Vec<NodeScore> {
    let mut scores: Vec<NodeScore> = pools
        .into_iter()
        .filter(|pool| pool_is_eligible(pool, requirement))
        .flat_map(|pool| {
            pool.nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| is_candidate(node, requirement))
                .map(|(i, node)| score_node(&pool.id, i, node, hint, now_ms))
        })
        .collect();

    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    scores
}

/// Weighted-random pick among the first [`TOP_CANDIDATES`] of a ranked list.
pub fn pick_weighted<'a, R: Rng + ?Sized>(ranked: &'a [NodeScore], rng: &mut R) -> Option<&'a NodeScore> {
    let top = &ranked[..ranked.len().min(TOP_CANDIDATES)];
    top.choose_weighted(rng, |s| s.score.max(1.0)).ok()
}
