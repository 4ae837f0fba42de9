//! Metric synthesis: seeded estimates damped against the previous poll.
//!
//! Raw values come from a mulberry32 generator keyed by
//! `(blueprintId, 2s time bucket, desiredReplicas)`, so every poll inside
//! one bucket sees the same raw estimate. When a previous snapshot exists
//! each field is blended with it to keep dashboards from flickering.

use embedgrid_model::{MetricsSnapshot, Mulberry32, SessionBlueprint};

/// Width of the time bucket that keys the raw estimate.
pub const METRICS_BUCKET_MS: u64 = 2_000;
pub const MIN_MEDIAN_LATENCY_MS: f64 = 30.0;

/// Weight kept from the previous snapshot, per field.
const ACTIVE_PREVIOUS_WEIGHT: f64 = 0.6;
const ERRORS_PREVIOUS_WEIGHT: f64 = 0.5;
const LATENCY_PREVIOUS_WEIGHT: f64 = 0.5;
const BANDWIDTH_PREVIOUS_WEIGHT: f64 = 0.55;

fn smooth(previous: f64, fresh: f64, previous_weight: f64) -> f64 {
    previous * previous_weight + fresh * (1.0 - previous_weight)
}

/// Synthesize a metrics snapshot for `blueprint` at `now_ms`.
pub fn synthesize_metrics(
    blueprint: &SessionBlueprint,
    previous: Option<&MetricsSnapshot>,
    now_ms: u64,
) -> MetricsSnapshot {
    let desired = blueprint.desired_replicas();
    let bucket = now_ms / METRICS_BUCKET_MS;
    let mut rng = Mulberry32::from_parts(&[&blueprint.id, &bucket, &desired]);

    let desired = desired as f64;
    let base_latency = blueprint.definition.base_latency_ms();

    let active_replicas = desired * (0.86 + rng.next_f64() * 0.12);
    let errors_per_minute = desired * (0.002 + rng.next_f64() * 0.0025);
    let median_latency_ms = (base_latency * (0.72 + rng.next_f64() * 0.18)).max(MIN_MEDIAN_LATENCY_MS);
    let bandwidth_kbps = desired * (110.0 + rng.next_f64() * 90.0);

    let mut snapshot = MetricsSnapshot {
        session_id: blueprint.id.clone(),
        timestamp: now_ms,
        active_replicas,
        errors_per_minute,
        median_latency_ms,
        bandwidth_kbps,
    };

    if let Some(prev) = previous {
        snapshot.active_replicas = smooth(prev.active_replicas, active_replicas, ACTIVE_PREVIOUS_WEIGHT);
        snapshot.errors_per_minute =
            smooth(prev.errors_per_minute, errors_per_minute, ERRORS_PREVIOUS_WEIGHT);
        snapshot.median_latency_ms =
            smooth(prev.median_latency_ms, median_latency_ms, LATENCY_PREVIOUS_WEIGHT);
        snapshot.bandwidth_kbps = smooth(prev.bandwidth_kbps, bandwidth_kbps, BANDWIDTH_PREVIOUS_WEIGHT);
    }

    snapshot
}
