//! Shard planning: turns a definition's intent into regional capacity.
//!
//! Each region gets a weight built from three factors:
//! - **Position**: regions listed earlier in the geo affinity get a boost
//! - **Proxy preference**: regions the proxy requirement asks for get a boost
//! - **Latency**: slow networks shrink every weight, floored at 0.35
//!
//! Weights are normalized into fractional capacities, floored, and then
//! reconciled by [`normalize_capacity`] so the shard total always equals
//! the desired replica count exactly.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tracing::debug;

use embedgrid_model::{ProxyRequirement, ReplicaShard, SessionDefinition};

/// Boost per region still listed after this one.
pub const POSITION_BOOST_STEP: f64 = 0.05;
/// Multiplicative boost for proxy-preferred regions.
pub const PROXY_PREFERENCE_BOOST: f64 = 0.35;
pub const MIN_LATENCY_PENALTY: f64 = 0.35;
pub const LATENCY_PENALTY_SCALE_MS: f64 = 400.0;
/// Warm pool size as a fraction of capacity.
pub const WARM_POOL_RATIO: f64 = 0.08;
/// Upper bound for a repaired shard's warm pool.
pub const MAX_WARM_POOL_RATIO: f64 = 0.25;
pub const MIN_LATENCY_BUDGET_MS: u64 = 60;
/// Floor for a repaired shard's latency budget.
pub const MIN_REPAIRED_LATENCY_BUDGET_MS: u64 = 40;
pub const DEFAULT_AUTOSCALE_WINDOW_SEC: u64 = 60;

/// Weight of the region at `position` out of `region_count`.
pub fn region_weight(
    position: usize,
    region_count: usize,
    base_latency_ms: f64,
    proxy_preferred: bool,
) -> f64 {
    let remaining = region_count.saturating_sub(position + 1) as f64;
    let priority_boost = 1.0 + remaining * POSITION_BOOST_STEP;
    let proxy_boost = if proxy_preferred {
        1.0 + PROXY_PREFERENCE_BOOST
    } else {
        1.0
    };
    let latency_penalty = (1.0 - base_latency_ms / LATENCY_PENALTY_SCALE_MS).max(MIN_LATENCY_PENALTY);
    priority_boost * proxy_boost * latency_penalty
}

/// Build shards from scratch for `definition`.
///
/// The capacities always sum to `max(targetReplicaCount, regionCount)`.
pub fn derive_shards(definition: &SessionDefinition) -> Vec<ReplicaShard> {
    let regions = definition.regions();
    let desired = definition.desired_replicas(regions.len());
    let base_latency = definition.base_latency_ms();
    let proxy = definition.target.proxy.as_ref();

    let preferred: Vec<bool> = regions
        .iter()
        .map(|r| proxy.is_some_and(|p| p.prefers_region(r)))
        .collect();
    let weights: Vec<f64> = preferred
        .iter()
        .enumerate()
        .map(|(i, pref)| region_weight(i, regions.len(), base_latency, *pref))
        .collect();
    let total_weight: f64 = weights.iter().sum();

    let mut shards: Vec<ReplicaShard> = regions
        .iter()
        .enumerate()
        .map(|(i, region)| {
            let share = if total_weight > 0.0 {
                weights[i] / total_weight
            } else {
                1.0 / regions.len() as f64
            };
            ReplicaShard {
                id: shard_id(i, region),
                label: format!("{region} replicas"),
                region: region.clone(),
                capacity: (share * desired as f64).floor() as u64,
                warm_pool: 0,
                proxy_pool_id: proxy_pool_for(proxy, region),
                latency_budget_ms: latency_budget(base_latency, preferred[i]),
                autoscale_window_sec: DEFAULT_AUTOSCALE_WINDOW_SEC,
            }
        })
        .collect();

    normalize_capacity(&mut shards, desired);
    for shard in &mut shards {
        shard.warm_pool = warm_pool_for(shard.capacity);
    }

    debug!(
        regions = shards.len(),
        desired,
        "derived shard topology"
    );
    shards
}

/// Repair existing shards, or derive them when there are none.
///
/// Existing region and proxy bindings are kept; only sizes move. Re-running
/// with an unchanged target reproduces the same distribution.
pub fn ensure_shard_topology(definition: &SessionDefinition) -> Vec<ReplicaShard> {
    if definition.shards.is_empty() {
        return derive_shards(definition);
    }

    let min_budget = ((3.0 * definition.base_latency_ms()).round() as u64)
        .max(MIN_REPAIRED_LATENCY_BUDGET_MS);

    let mut shards = definition.shards.clone();
    for shard in &mut shards {
        shard.capacity = shard.capacity.max(1);
        shard.warm_pool = shard.warm_pool.min(max_warm_pool(shard.capacity));
        shard.latency_budget_ms = shard.latency_budget_ms.max(min_budget);
    }

    let desired = definition.desired_replicas(shards.len());
    normalize_capacity(&mut shards, desired);

    // Capacity may have shrunk under the warm pool.
    for shard in &mut shards {
        shard.warm_pool = shard.warm_pool.min(max_warm_pool(shard.capacity));
    }
    shards
}

/// Reconcile shard capacities so they sum to exactly `desired`.
///
/// Every shard keeps at least 1 unit, so the effective target is
/// `max(desired, shards.len())`. A deficit is added one unit at a time
/// round-robin from the first shard; a surplus is removed one unit at a
/// time from the largest shard (lowest index on ties).
pub fn normalize_capacity(shards: &mut [ReplicaShard], desired: u64) {
    if shards.is_empty() {
        return;
    }
    for shard in shards.iter_mut() {
        shard.capacity = shard.capacity.max(1);
    }

    let count = shards.len() as u64;
    let desired = desired.max(count);
    let total: u64 = shards.iter().map(|s| s.capacity).sum();

    if total < desired {
        // Round-robin in closed form: everyone gets `per`, the first `extra` one more.
        let deficit = desired - total;
        let per = deficit / count;
        let extra = deficit % count;
        for (i, shard) in shards.iter_mut().enumerate() {
            shard.capacity += per + u64::from((i as u64) < extra);
        }
    } else if total > desired {
        let mut surplus = total - desired;
        let mut heap: BinaryHeap<(u64, Reverse<usize>)> = shards
            .iter()
            .enumerate()
            .map(|(i, s)| (s.capacity, Reverse(i)))
            .collect();

        while surplus > 0 {
            let Some((capacity, Reverse(i))) = heap.pop() else {
                break;
            };
            if capacity <= 1 {
                break;
            }
            // Strictly above the runner-up, this shard would be picked
            // repeatedly anyway, so take the whole gap at once.
            let level = heap.peek().map(|(next, _)| *next).unwrap_or(1).max(1);
            let step = if capacity > level {
                (capacity - level).min(surplus)
            } else {
                1
            };
            shards[i].capacity = capacity - step;
            surplus -= step;
            heap.push((capacity - step, Reverse(i)));
        }
    }
}

/// Pool hint for a shard in `region`.
fn proxy_pool_for(proxy: Option<&ProxyRequirement>, region: &str) -> Option<String> {
    let requirement = proxy?;
    let preferred = requirement.prefers_region(region);
    match &requirement.pool_id {
        Some(pool) if preferred => Some(format!("{pool}:{region}")),
        Some(pool) => Some(
            requirement
                .failover_pool_id
                .clone()
                .unwrap_or_else(|| format!("{pool}:failover")),
        ),
        None if preferred => Some(format!("dynamic-{region}")),
        None => None,
    }
}

fn latency_budget(base_latency_ms: f64, proxy_preferred: bool) -> u64 {
    let multiplier = if proxy_preferred { 3.5 } else { 3.0 };
    ((base_latency_ms * multiplier).round() as u64).max(MIN_LATENCY_BUDGET_MS)
}

fn warm_pool_for(capacity: u64) -> u64 {
    ((capacity as f64 * WARM_POOL_RATIO).floor() as u64).max(1)
}

fn max_warm_pool(capacity: u64) -> u64 {
    (capacity as f64 * MAX_WARM_POOL_RATIO).floor() as u64
}

fn shard_id(position: usize, region: &str) -> String {
    format!("shard-{position:02}-{region}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedgrid_model::{DEFAULT_REGION, ProxyRequirement};

    fn definition(target: u64, regions: &[&str]) -> SessionDefinition {
        let mut def = SessionDefinition::new("https://example.com");
        def.policy.target_replica_count = target;
        def.target.geo_affinity = regions.iter().map(|r| r.to_string()).collect();
        def
    }

    fn total(shards: &[ReplicaShard]) -> u64 {
        shards.iter().map(|s| s.capacity).sum()
    }

    fn shard(id: &str, capacity: u64) -> ReplicaShard {
        ReplicaShard {
            id: id.to_string(),
            label: id.to_string(),
            region: "us-east".to_string(),
            capacity,
            warm_pool: 0,
            proxy_pool_id: None,
            latency_budget_ms: 100,
            autoscale_window_sec: 60,
        }
    }

    #[test]
    fn single_default_region_takes_everything() {
        let def = definition(100_000, &[]);
        let shards = derive_shards(&def);

        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].region, DEFAULT_REGION);
        assert_eq!(shards[0].capacity, 100_000);
        assert_eq!(shards[0].warm_pool, 8_000);
        // Default base latency is 80ms: max(60, round(80 * 3)).
        assert_eq!(shards[0].latency_budget_ms, 240);
        assert_eq!(shards[0].proxy_pool_id, None);
    }

    #[test]
    fn capacity_sums_to_desired_for_many_shapes() {
        for target in [0, 1, 2, 3, 7, 10, 99, 1_000, 123_457] {
            for regions in [
                vec![],
                vec!["us-east"],
                vec!["us-east", "eu-west"],
                vec!["us-east", "eu-west", "ap-south", "sa-east", "af-south"],
            ] {
                let def = definition(target, &regions);
                let shards = derive_shards(&def);
                let expected = target.max(regions.len().max(1) as u64);
                assert_eq!(total(&shards), expected, "target={target} regions={regions:?}");
                assert!(shards.iter().all(|s| s.capacity >= 1));
            }
        }
    }

    #[test]
    fn earlier_regions_get_more_capacity() {
        let def = definition(1_000, &["us-east", "eu-west", "ap-south"]);
        let shards = derive_shards(&def);

        assert!(shards[0].capacity > shards[1].capacity);
        assert!(shards[1].capacity > shards[2].capacity);
    }

    #[test]
    fn proxy_preferred_region_is_boosted() {
        let mut def = definition(1_000, &["us-east", "eu-west"]);
        def.target.proxy = Some(ProxyRequirement {
            regions: vec!["eu-west".to_string()],
            ..ProxyRequirement::default()
        });
        let shards = derive_shards(&def);

        assert!(shards[1].capacity > shards[0].capacity);
        assert_eq!(shards[1].proxy_pool_id.as_deref(), Some("dynamic-eu-west"));
        assert_eq!(shards[0].proxy_pool_id, None);
        // 80ms * 3.5
        assert_eq!(shards[1].latency_budget_ms, 280);
    }

    #[test]
    fn explicit_pool_uses_region_suffix_or_failover() {
        let mut def = definition(10, &["us-east", "eu-west"]);
        def.target.proxy = Some(ProxyRequirement {
            pool_id: Some("premium".to_string()),
            regions: vec!["us-east".to_string()],
            ..ProxyRequirement::default()
        });
        let shards = derive_shards(&def);
        assert_eq!(shards[0].proxy_pool_id.as_deref(), Some("premium:us-east"));
        assert_eq!(shards[1].proxy_pool_id.as_deref(), Some("premium:failover"));

        if let Some(proxy) = def.target.proxy.as_mut() {
            proxy.failover_pool_id = Some("backup".to_string());
        }
        let shards = derive_shards(&def);
        assert_eq!(shards[1].proxy_pool_id.as_deref(), Some("backup"));
    }

    #[test]
    fn latency_penalty_is_floored() {
        let slow = region_weight(0, 1, 10_000.0, false);
        assert!((slow - MIN_LATENCY_PENALTY).abs() < 1e-9);
        let fast = region_weight(0, 1, 0.0, false);
        assert!((fast - 1.0).abs() < 1e-9);
    }

    #[test]
    fn short_latency_budget_has_floor() {
        let mut def = definition(5, &[]);
        def.target.network.base_latency_ms = 5.0;
        let shards = derive_shards(&def);
        assert_eq!(shards[0].latency_budget_ms, MIN_LATENCY_BUDGET_MS);
    }

    #[test]
    fn normalize_adds_deficit_round_robin_from_first() {
        let mut shards = vec![shard("a", 1), shard("b", 1), shard("c", 1)];
        normalize_capacity(&mut shards, 8);
        let caps: Vec<u64> = shards.iter().map(|s| s.capacity).collect();
        assert_eq!(caps, vec![3, 3, 2]);
    }

    #[test]
    fn normalize_removes_surplus_from_largest() {
        let mut shards = vec![shard("a", 5), shard("b", 10), shard("c", 2)];
        normalize_capacity(&mut shards, 12);
        let caps: Vec<u64> = shards.iter().map(|s| s.capacity).collect();
        assert_eq!(caps, vec![5, 5, 2]);
    }

    #[test]
    fn normalize_breaks_ties_towards_lower_index() {
        let mut shards = vec![shard("a", 5), shard("b", 5)];
        normalize_capacity(&mut shards, 7);
        let caps: Vec<u64> = shards.iter().map(|s| s.capacity).collect();
        assert_eq!(caps, vec![3, 4]);
    }

    #[test]
    fn normalize_clamps_zero_and_degenerate_inputs() {
        let mut shards = vec![shard("a", 0), shard("b", 0)];
        normalize_capacity(&mut shards, 0);
        assert!(shards.iter().all(|s| s.capacity == 1));

        let mut empty: Vec<ReplicaShard> = Vec::new();
        normalize_capacity(&mut empty, 10);
        assert!(empty.is_empty());
    }

    #[test]
    fn normalize_handles_large_surplus() {
        let mut shards = vec![shard("a", 600_000), shard("b", 400_000)];
        normalize_capacity(&mut shards, 10);
        assert_eq!(total(&shards), 10);
        assert!(shards.iter().all(|s| s.capacity >= 1));
    }

    #[test]
    fn ensure_keeps_bindings_and_resizes() {
        let mut def = definition(100, &["us-east", "eu-west"]);
        let mut shards = derive_shards(&def);
        shards[1].proxy_pool_id = Some("pinned".to_string());
        def.shards = shards;
        def.policy.target_replica_count = 250;

        let repaired = ensure_shard_topology(&def);
        assert_eq!(total(&repaired), 250);
        assert_eq!(repaired[1].proxy_pool_id.as_deref(), Some("pinned"));
        assert_eq!(repaired[0].region, "us-east");
    }

    #[test]
    fn ensure_is_stable_for_unchanged_target() {
        let mut def = definition(777, &["us-east", "eu-west", "ap-south"]);
        def.shards = ensure_shard_topology(&def);
        let once = def.shards.clone();
        def.shards = ensure_shard_topology(&def);
        assert_eq!(def.shards, once);
    }

    #[test]
    fn ensure_clamps_shard_fields() {
        let mut def = definition(3, &[]);
        let mut bad = shard("a", 0);
        bad.warm_pool = 50;
        bad.latency_budget_ms = 1;
        def.shards = vec![bad];

        let repaired = ensure_shard_topology(&def);
        assert_eq!(repaired[0].capacity, 3);
        assert_eq!(repaired[0].warm_pool, 0);
        assert_eq!(repaired[0].latency_budget_ms, 240);
    }

    #[test]
    fn ensure_total_uses_shard_count_when_larger() {
        let mut def = definition(1, &[]);
        def.shards = vec![shard("a", 4), shard("b", 4), shard("c", 4)];
        let repaired = ensure_shard_topology(&def);
        assert_eq!(total(&repaired), 3);
    }
}
