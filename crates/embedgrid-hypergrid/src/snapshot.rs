//! Snapshot computation: the one O(N) pass over the session population.
//!
//! Each tile keeps at most [`MAX_TILE_SAMPLES`] representative sessions,
//! ranked by `SHA-1(sessionId)[0:4] / 2^32`. A candidate only displaces the
//! current lowest-ranked sample when its priority is strictly higher, so
//! the selection is a stable top-K by hash rather than a random reservoir
//! and does not depend on input order.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use embedgrid_model::seed::sha1_unit;
use embedgrid_model::{
    BlueprintStatus, CoverageSnapshot, MetricsSnapshot, SessionBlueprint, SessionId,
};

use crate::grid::{TileKey, compute_tile_key, grid_side};

pub const MAX_TILE_SAMPLES: usize = 12;
/// Country bucket for sessions that declare no proxy countries.
pub const GLOBAL_COUNTRY_BUCKET: &str = "GLOBAL";

/// A representative session kept by a tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileSample {
    pub session_id: SessionId,
    pub label: Option<String>,
    pub url: String,
    pub status: BlueprintStatus,
    pub latency_ms: f64,
    pub active_replicas: f64,
    pub priority: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HypergridTile {
    pub x: u32,
    pub y: u32,
    pub session_count: usize,
    pub avg_latency_ms: f64,
    pub active_replicas: f64,
    pub errors_per_minute: f64,
    /// Status name → sessions.
    pub status_counts: BTreeMap<String, usize>,
    /// Country code (or `GLOBAL`) → sessions.
    pub proxy_countries: BTreeMap<String, usize>,
    /// Highest priority first.
    pub samples: Vec<TileSample>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub total_sessions: usize,
    pub active_replicas: f64,
    pub errors_per_minute: f64,
    /// `min(1, Σerrors / max(1, Σactive))`.
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    /// Materialized share of known proxy countries, in `[0, 1]`.
    pub proxy_coverage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HypergridSnapshot {
    pub generated_at: u64,
    pub grid_side: u32,
    /// Non-empty tiles, ordered by `(y, x)`.
    pub tiles: Vec<HypergridTile>,
    pub global: GlobalStats,
}

/// Everything a snapshot is computed from.
pub struct HypergridSources<'a> {
    pub blueprints: &'a [&'a SessionBlueprint],
    /// Latest cached metrics per session; sessions without one use defaults.
    pub metrics: &'a HashMap<SessionId, MetricsSnapshot>,
    pub coverage: &'a CoverageSnapshot,
}

#[derive(Default)]
struct TileAccumulator {
    session_count: usize,
    latency_sum: f64,
    active_sum: f64,
    error_sum: f64,
    status_counts: BTreeMap<String, usize>,
    proxy_countries: BTreeMap<String, usize>,
    samples: Vec<TileSample>,
}

impl TileAccumulator {
    fn offer(&mut self, sample: TileSample) {
        if self.samples.len() < MAX_TILE_SAMPLES {
            self.samples.push(sample);
            return;
        }
        let lowest = self
            .samples
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.priority.total_cmp(&b.priority))
            .map(|(i, s)| (i, s.priority));
        if let Some((index, priority)) = lowest {
            if sample.priority > priority {
                self.samples[index] = sample;
            }
        }
    }

    fn finish(mut self, key: TileKey) -> HypergridTile {
        self.samples.sort_by(|a, b| {
            b.priority
                .total_cmp(&a.priority)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        HypergridTile {
            x: key.x,
            y: key.y,
            session_count: self.session_count,
            avg_latency_ms: self.latency_sum / self.session_count.max(1) as f64,
            active_replicas: self.active_sum,
            errors_per_minute: self.error_sum,
            status_counts: self.status_counts,
            proxy_countries: self.proxy_countries,
            samples: self.samples,
        }
    }
}

/// Aggregate `sources` into a grid snapshot stamped `generated_at`.
pub fn compute_snapshot(sources: &HypergridSources<'_>, generated_at: u64) -> HypergridSnapshot {
    let started = Instant::now();
    let side = grid_side(sources.blueprints.len());
    let mut tiles: BTreeMap<(u32, u32), TileAccumulator> = BTreeMap::new();

    let mut latency_total = 0.0;
    let mut active_total = 0.0;
    let mut error_total = 0.0;

    for bp in sources.blueprints {
        let metrics = sources.metrics.get(&bp.id);
        let latency = metrics.map_or_else(|| bp.definition.base_latency_ms(), |m| m.median_latency_ms);
        let active = metrics.map_or(bp.desired_replicas() as f64, |m| m.active_replicas);
        let errors = metrics.map_or(0.0, |m| m.errors_per_minute);

        latency_total += latency;
        active_total += active;
        error_total += errors;

        let key = compute_tile_key(&bp.id, side);
        let tile = tiles.entry((key.y, key.x)).or_default();
        tile.session_count += 1;
        tile.latency_sum += latency;
        tile.active_sum += active;
        tile.error_sum += errors;
        *tile.status_counts.entry(bp.status.as_str().to_string()).or_default() += 1;

        let countries = bp.definition.proxy_countries();
        if countries.is_empty() {
            *tile.proxy_countries.entry(GLOBAL_COUNTRY_BUCKET.to_string()).or_default() += 1;
        } else {
            for country in countries {
                *tile.proxy_countries.entry(country).or_default() += 1;
            }
        }

        tile.offer(TileSample {
            session_id: bp.id.clone(),
            label: bp.definition.target.label.clone(),
            url: bp.definition.target.url.clone(),
            status: bp.status,
            latency_ms: latency,
            active_replicas: active,
            priority: sha1_unit(&bp.id),
        });
    }

    let total = sources.blueprints.len();
    let global = GlobalStats {
        total_sessions: total,
        active_replicas: active_total,
        errors_per_minute: error_total,
        error_rate: (error_total / active_total.max(1.0)).min(1.0),
        avg_latency_ms: if total == 0 { 0.0 } else { latency_total / total as f64 },
        proxy_coverage: sources.coverage.coverage_ratio.clamp(0.0, 1.0),
    };

    let tiles: Vec<HypergridTile> = tiles
        .into_iter()
        .map(|((y, x), acc)| acc.finish(TileKey { x, y }))
        .collect();

    debug!(
        sessions = total,
        grid_side = side,
        tiles = tiles.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "computed hypergrid snapshot"
    );

    HypergridSnapshot {
        generated_at,
        grid_side: side,
        tiles,
        global,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedgrid_model::{ProxyRequirement, ReplicaShard, SessionDefinition};

    fn blueprint(id: &str, countries: &[&str]) -> SessionBlueprint {
        let mut def = SessionDefinition::new(format!("https://example.com/{id}"));
        if !countries.is_empty() {
            def.target.proxy = Some(ProxyRequirement {
                countries: countries.iter().map(|c| c.to_string()).collect(),
                ..ProxyRequirement::default()
            });
        }
        def.policy.target_replica_count = 10;
        def.shards = vec![ReplicaShard {
            id: "shard-00-global-default".to_string(),
            label: "global-default replicas".to_string(),
            region: "global-default".to_string(),
            capacity: 10,
            warm_pool: 1,
            proxy_pool_id: None,
            latency_budget_ms: 240,
            autoscale_window_sec: 60,
        }];
        SessionBlueprint {
            id: id.to_string(),
            definition: def,
            created_at: 0,
            updated_at: 0,
            version: 1,
            status: BlueprintStatus::Steady,
            metrics_ttl_ms: 2_000,
        }
    }

    fn population(n: usize) -> Vec<SessionBlueprint> {
        (0..n).map(|i| blueprint(&format!("sess-{i:05}"), &[])).collect()
    }

    fn snapshot(blueprints: &[SessionBlueprint], metrics: &HashMap<SessionId, MetricsSnapshot>) -> HypergridSnapshot {
        let blueprints: Vec<&SessionBlueprint> = blueprints.iter().collect();
        let coverage = CoverageSnapshot {
            coverage_ratio: 0.25,
            ..CoverageSnapshot::default()
        };
        compute_snapshot(
            &HypergridSources {
                blueprints: &blueprints,
                metrics,
                coverage: &coverage,
            },
            1_000,
        )
    }

    #[test]
    fn snapshot_is_deterministic_and_order_independent() {
        let bps = population(500);
        let mut reversed = bps.clone();
        reversed.reverse();
        let metrics = HashMap::new();

        let a = serde_json::to_vec(&snapshot(&bps, &metrics)).unwrap();
        let b = serde_json::to_vec(&snapshot(&reversed, &metrics)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tiles_cover_population() {
        let bps = population(300);
        let snap = snapshot(&bps, &HashMap::new());
        assert_eq!(snap.grid_side, 32);
        let counted: usize = snap.tiles.iter().map(|t| t.session_count).sum();
        assert_eq!(counted, 300);
        assert!(snap.tiles.windows(2).all(|w| (w[0].y, w[0].x) < (w[1].y, w[1].x)));
    }

    #[test]
    fn samples_are_bounded_and_complete_for_small_tiles() {
        // One tile holds everything when the grid is 1×1.
        let bps = population(1);
        let snap = snapshot(&bps, &HashMap::new());
        assert_eq!(snap.tiles.len(), 1);
        assert_eq!(snap.tiles[0].samples.len(), 1);

        let bps = population(2_000);
        let snap = snapshot(&bps, &HashMap::new());
        for tile in &snap.tiles {
            assert!(tile.samples.len() <= MAX_TILE_SAMPLES);
            if tile.session_count <= MAX_TILE_SAMPLES {
                assert_eq!(tile.samples.len(), tile.session_count);
            }
            assert!(tile.samples.windows(2).all(|w| w[0].priority >= w[1].priority));
        }
    }

    #[test]
    fn crowded_tile_keeps_highest_priorities() {
        let mut acc = TileAccumulator::default();
        let ids: Vec<String> = (0..40).map(|i| format!("s{i}")).collect();
        for id in &ids {
            acc.offer(TileSample {
                session_id: id.clone(),
                label: None,
                url: String::new(),
                status: BlueprintStatus::Steady,
                latency_ms: 0.0,
                active_replicas: 0.0,
                priority: sha1_unit(id),
            });
        }
        let mut expected: Vec<(f64, &String)> = ids.iter().map(|id| (sha1_unit(id), id)).collect();
        expected.sort_by(|a, b| b.0.total_cmp(&a.0));
        let expected: Vec<&String> = expected.iter().take(MAX_TILE_SAMPLES).map(|(_, id)| *id).collect();

        let tile = acc.finish(TileKey { x: 0, y: 0 });
        let kept: Vec<&String> = tile.samples.iter().map(|s| &s.session_id).collect();
        assert_eq!(kept, expected);
    }

    #[test]
    fn country_histogram_uses_global_bucket() {
        let bps = vec![blueprint("a", &["us", "DE"]), blueprint("b", &[])];
        let mut metrics = HashMap::new();
        let single = snapshot(&bps, &metrics);
        let merged: BTreeMap<String, usize> = single
            .tiles
            .iter()
            .flat_map(|t| t.proxy_countries.clone())
            .fold(BTreeMap::new(), |mut acc, (k, v)| {
                *acc.entry(k).or_default() += v;
                acc
            });
        assert_eq!(merged.get("US"), Some(&1));
        assert_eq!(merged.get("DE"), Some(&1));
        assert_eq!(merged.get(GLOBAL_COUNTRY_BUCKET), Some(&1));

        metrics.insert(
            "a".to_string(),
            MetricsSnapshot {
                session_id: "a".to_string(),
                timestamp: 0,
                active_replicas: 8.0,
                errors_per_minute: 2.0,
                median_latency_ms: 50.0,
                bandwidth_kbps: 0.0,
            },
        );
        let snap = snapshot(&bps, &metrics);
        // b falls back to desired replicas and base latency.
        assert_eq!(snap.global.active_replicas, 18.0);
        assert_eq!(snap.global.errors_per_minute, 2.0);
        assert!((snap.global.error_rate - 2.0 / 18.0).abs() < 1e-12);
        assert!((snap.global.avg_latency_ms - (50.0 + 80.0) / 2.0).abs() < 1e-9);
        assert_eq!(snap.global.proxy_coverage, 0.25);
    }

    #[test]
    fn empty_population() {
        let snap = snapshot(&[], &HashMap::new());
        assert_eq!(snap.grid_side, 1);
        assert!(snap.tiles.is_empty());
        assert_eq!(snap.global.error_rate, 0.0);
        assert_eq!(snap.global.avg_latency_ms, 0.0);
    }
}
