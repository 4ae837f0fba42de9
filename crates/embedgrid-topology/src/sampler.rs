//! Replica sampling: deterministic synthetic replica states.
//!
//! Replica `i` of a blueprint lives on `shards[i mod len]` and draws from a
//! mulberry32 generator seeded by `(blueprintId, version, shardId, i)`. The
//! same blueprint version therefore always yields the same sample, which is
//! what makes the sample usable in tests and stable between polls.

use serde::{Deserialize, Serialize};

use embedgrid_model::{
    BlueprintStatus, Mulberry32, PROXY_NODE_METADATA_KEY, ReplicaStatus, ReplicaSummary,
    SessionBlueprint,
};

/// Sample size cap never drops below this, whatever the desired count.
pub const SAMPLE_CEILING_FLOOR: u64 = 1_000_000;
/// Latency floor for any sampled replica.
pub const MIN_REPLICA_LATENCY_MS: u64 = 25;
/// Window in which a replica's last heartbeat falls.
const LAST_SEEN_WINDOW_MS: f64 = 30_000.0;

/// Error codes assigned to replicas in the `error` bucket, by quartile.
pub const ERROR_CODES: [&str; 4] = [
    "PROXY_TIMEOUT",
    "RENDER_CRASH",
    "NAVIGATION_FAILED",
    "TLS_HANDSHAKE",
];

/// Options for [`sample_replicas`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SampleOptions {
    pub limit: usize,
    pub include_terminated: bool,
    /// Reference time for `lastSeenAt`, unix milliseconds.
    pub as_of_ms: u64,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            include_terminated: false,
            as_of_ms: 0,
        }
    }
}

/// Categorical weights for the replica status draw.
fn status_weights(status: BlueprintStatus, include_terminated: bool) -> [(ReplicaStatus, f64); 5] {
    if status == BlueprintStatus::Terminated {
        return [
            (ReplicaStatus::Active, 0.0),
            (ReplicaStatus::Initializing, 0.0),
            (ReplicaStatus::Throttled, 0.0),
            (ReplicaStatus::Error, 0.15),
            (ReplicaStatus::Terminated, 0.85),
        ];
    }

    let mut active = 0.86;
    let mut initializing = 0.06;
    let mut throttled = 0.04;
    let mut error = 0.03;
    let terminated = if include_terminated { 0.01 } else { 0.0 };

    match status {
        BlueprintStatus::Scaling => initializing += 0.04,
        BlueprintStatus::Degraded => {
            throttled += 0.03;
            error += 0.03;
            active -= 0.04;
        }
        _ => {}
    }

    [
        (ReplicaStatus::Active, active),
        (ReplicaStatus::Initializing, initializing),
        (ReplicaStatus::Throttled, throttled),
        (ReplicaStatus::Error, error),
        (ReplicaStatus::Terminated, terminated),
    ]
}

fn draw_status(weights: &[(ReplicaStatus, f64); 5], roll: f64) -> ReplicaStatus {
    let total: f64 = weights.iter().map(|(_, w)| w).sum();
    let mut cursor = roll * total;
    for (status, weight) in weights {
        if *weight <= 0.0 {
            continue;
        }
        if cursor < *weight {
            return *status;
        }
        cursor -= weight;
    }
    // Rounding left the cursor past the last bucket.
    weights
        .iter()
        .rev()
        .find(|(_, w)| *w > 0.0)
        .map(|(s, _)| *s)
        .unwrap_or(ReplicaStatus::Active)
}

/// Number of replicas a request for `limit` samples produces.
pub fn sample_count(blueprint: &SessionBlueprint, limit: usize) -> usize {
    let ceiling = blueprint.desired_replicas().max(SAMPLE_CEILING_FLOOR);
    (limit.max(1) as u64).min(ceiling) as usize
}

/// Sample replica `index` of `blueprint`. `None` when the blueprint has no shards.
pub fn sample_replica(
    blueprint: &SessionBlueprint,
    index: usize,
    options: &SampleOptions,
) -> Option<ReplicaSummary> {
    let shards = &blueprint.definition.shards;
    if shards.is_empty() {
        return None;
    }
    let shard = &shards[index % shards.len()];
    let mut rng = Mulberry32::from_parts(&[&blueprint.id, &blueprint.version, &shard.id, &index]);

    let weights = status_weights(blueprint.status, options.include_terminated);
    let status = draw_status(&weights, rng.next_f64());

    let latency = (shard.latency_budget_ms as f64 * (0.35 + rng.next_f64() * 1.05)).floor() as u64;

    let error_code = if status == ReplicaStatus::Error {
        let quartile = ((rng.next_f64() * 4.0) as usize).min(ERROR_CODES.len() - 1);
        Some(ERROR_CODES[quartile].to_string())
    } else {
        None
    };

    let last_seen_at = options
        .as_of_ms
        .saturating_sub((rng.next_f64() * LAST_SEEN_WINDOW_MS) as u64);

    let proxy_id = blueprint
        .definition
        .metadata
        .get(PROXY_NODE_METADATA_KEY)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| shard.proxy_pool_id.clone());

    Some(ReplicaSummary {
        id: format!("{}:{}:{index}", blueprint.id, shard.id),
        session_id: blueprint.id.clone(),
        status,
        region: shard.region.clone(),
        last_seen_at,
        latency_ms: latency.max(MIN_REPLICA_LATENCY_MS),
        proxy_id,
        error_code,
    })
}

/// Sample up to `min(max(limit, 1), max(desired, 1_000_000))` replicas.
pub fn sample_replicas(blueprint: &SessionBlueprint, options: &SampleOptions) -> Vec<ReplicaSummary> {
    let count = sample_count(blueprint, options.limit);
    (0..count)
        .filter_map(|i| sample_replica(blueprint, i, options))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedgrid_model::SessionDefinition;

    use crate::planner::derive_shards;

    fn blueprint(target: u64, regions: &[&str], status: BlueprintStatus) -> SessionBlueprint {
        let mut def = SessionDefinition::new("https://example.com");
        def.policy.target_replica_count = target;
        def.target.geo_affinity = regions.iter().map(|r| r.to_string()).collect();
        def.shards = derive_shards(&def);
        SessionBlueprint {
            id: "bp-1".to_string(),
            definition: def,
            created_at: 0,
            updated_at: 0,
            version: 1,
            status,
            metrics_ttl_ms: 2_000,
        }
    }

    fn opts(limit: usize, include_terminated: bool) -> SampleOptions {
        SampleOptions {
            limit,
            include_terminated,
            as_of_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn same_blueprint_same_sample() {
        let bp = blueprint(500, &["us-east", "eu-west"], BlueprintStatus::Steady);
        let a = sample_replicas(&bp, &opts(200, false));
        let b = sample_replicas(&bp, &opts(200, false));
        assert_eq!(a, b);
        assert_eq!(a.len(), 200);
    }

    #[test]
    fn version_bump_changes_sample() {
        let bp = blueprint(500, &["us-east"], BlueprintStatus::Steady);
        let mut bumped = bp.clone();
        bumped.version += 1;
        assert_ne!(
            sample_replicas(&bp, &opts(50, false)),
            sample_replicas(&bumped, &opts(50, false))
        );
    }

    #[test]
    fn shards_are_assigned_round_robin() {
        let bp = blueprint(30, &["us-east", "eu-west", "ap-south"], BlueprintStatus::Steady);
        let sample = sample_replicas(&bp, &opts(6, false));
        let regions: Vec<&str> = sample.iter().map(|r| r.region.as_str()).collect();
        assert_eq!(
            regions,
            vec!["us-east", "eu-west", "ap-south", "us-east", "eu-west", "ap-south"]
        );
    }

    #[test]
    fn limit_is_clamped_to_at_least_one() {
        let bp = blueprint(10, &[], BlueprintStatus::Steady);
        assert_eq!(sample_replicas(&bp, &opts(0, false)).len(), 1);
    }

    #[test]
    fn sample_count_respects_ceiling() {
        let bp = blueprint(10, &[], BlueprintStatus::Steady);
        assert_eq!(sample_count(&bp, 5_000_000), 1_000_000);
        let big = blueprint(2_000_000, &[], BlueprintStatus::Steady);
        assert_eq!(sample_count(&big, 5_000_000), 2_000_000);
    }

    #[test]
    fn latency_respects_budget_bounds() {
        let bp = blueprint(1_000, &["us-east"], BlueprintStatus::Steady);
        let budget = bp.definition.shards[0].latency_budget_ms as f64;
        for replica in sample_replicas(&bp, &opts(1_000, false)) {
            let latency = replica.latency_ms as f64;
            assert!(latency >= (budget * 0.35).floor().max(25.0));
            assert!(latency <= budget * 1.4);
        }
    }

    #[test]
    fn terminated_excluded_unless_requested() {
        let bp = blueprint(5_000, &[], BlueprintStatus::Steady);
        let sample = sample_replicas(&bp, &opts(5_000, false));
        assert!(sample.iter().all(|r| r.status != ReplicaStatus::Terminated));

        let with = sample_replicas(&bp, &opts(5_000, true));
        assert!(with.iter().any(|r| r.status == ReplicaStatus::Terminated));
    }

    #[test]
    fn terminated_blueprint_forces_terminal_states() {
        let bp = blueprint(500, &[], BlueprintStatus::Terminated);
        let sample = sample_replicas(&bp, &opts(500, false));
        assert!(sample.iter().all(|r| matches!(
            r.status,
            ReplicaStatus::Terminated | ReplicaStatus::Error
        )));
    }

    #[test]
    fn steady_distribution_is_mostly_active() {
        let bp = blueprint(20_000, &[], BlueprintStatus::Steady);
        let sample = sample_replicas(&bp, &opts(20_000, false));
        let active = sample.iter().filter(|r| r.status == ReplicaStatus::Active).count();
        let ratio = active as f64 / sample.len() as f64;
        assert!((0.82..0.90).contains(&ratio), "active ratio {ratio}");
    }

    fn ratio(sample: &[ReplicaSummary], status: ReplicaStatus) -> f64 {
        sample.iter().filter(|r| r.status == status).count() as f64 / sample.len() as f64
    }

    #[test]
    fn scaling_shifts_weight_to_initializing() {
        let weights = status_weights(BlueprintStatus::Scaling, false);
        assert!((weights[1].1 - 0.10).abs() < 1e-9);
        assert!((weights[0].1 - 0.86).abs() < 1e-9);

        let steady = sample_replicas(&blueprint(20_000, &[], BlueprintStatus::Steady), &opts(20_000, false));
        let scaling = sample_replicas(&blueprint(20_000, &[], BlueprintStatus::Scaling), &opts(20_000, false));
        let init = ratio(&scaling, ReplicaStatus::Initializing);
        assert!((0.085..0.11).contains(&init), "initializing ratio {init}");
        assert!(init > ratio(&steady, ReplicaStatus::Initializing));
    }

    #[test]
    fn degraded_shifts_weight_to_throttled_and_error() {
        let weights = status_weights(BlueprintStatus::Degraded, false);
        assert!((weights[0].1 - 0.82).abs() < 1e-9);
        assert!((weights[2].1 - 0.07).abs() < 1e-9);
        assert!((weights[3].1 - 0.06).abs() < 1e-9);

        let steady = sample_replicas(&blueprint(20_000, &[], BlueprintStatus::Steady), &opts(20_000, false));
        let degraded = sample_replicas(&blueprint(20_000, &[], BlueprintStatus::Degraded), &opts(20_000, false));
        let active = ratio(&degraded, ReplicaStatus::Active);
        let throttled = ratio(&degraded, ReplicaStatus::Throttled);
        let error = ratio(&degraded, ReplicaStatus::Error);
        assert!((0.80..0.86).contains(&active), "active ratio {active}");
        assert!((0.06..0.085).contains(&throttled), "throttled ratio {throttled}");
        assert!((0.05..0.075).contains(&error), "error ratio {error}");
        assert!(active < ratio(&steady, ReplicaStatus::Active));
        assert!(throttled > ratio(&steady, ReplicaStatus::Throttled));
        assert!(error > ratio(&steady, ReplicaStatus::Error));
    }

    #[test]
    fn errors_carry_known_codes() {
        let bp = blueprint(10_000, &[], BlueprintStatus::Degraded);
        let sample = sample_replicas(&bp, &opts(10_000, false));
        let errors: Vec<_> = sample
            .iter()
            .filter(|r| r.status == ReplicaStatus::Error)
            .collect();
        assert!(!errors.is_empty());
        for replica in errors {
            let code = replica.error_code.as_deref().unwrap();
            assert!(ERROR_CODES.contains(&code));
        }
        assert!(sample
            .iter()
            .filter(|r| r.status != ReplicaStatus::Error)
            .all(|r| r.error_code.is_none()));
    }

    #[test]
    fn draw_status_covers_edges() {
        let weights = status_weights(BlueprintStatus::Steady, false);
        assert_eq!(draw_status(&weights, 0.0), ReplicaStatus::Active);
        assert_eq!(draw_status(&weights, 0.999_999), ReplicaStatus::Error);
    }

    #[test]
    fn proxy_id_prefers_bound_node() {
        let mut bp = blueprint(10, &[], BlueprintStatus::Steady);
        bp.definition.metadata.insert(
            PROXY_NODE_METADATA_KEY.to_string(),
            serde_json::Value::String("us-node-0001".to_string()),
        );
        let replica = sample_replica(&bp, 0, &opts(1, false)).unwrap();
        assert_eq!(replica.proxy_id.as_deref(), Some("us-node-0001"));
    }
}
