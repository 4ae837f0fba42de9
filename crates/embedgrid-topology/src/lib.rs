//! Embedgrid replica topology planner.
//!
//! Turns a session's declared intent into concrete regional capacity and
//! produces the synthetic observations the rest of the system reads.
//!
//! # Components
//!
//! - **`planner`**: Shard derivation, capacity normalization, topology repair
//! - **`sampler`**: Deterministic per-replica state samples
//! - **`synth`**: Seeded, exponentially smoothed session metrics

pub mod planner;
pub mod sampler;
pub mod synth;

pub use planner::{derive_shards, ensure_shard_topology, normalize_capacity, region_weight};
pub use sampler::{SampleOptions, sample_replica, sample_replicas};
pub use synth::synthesize_metrics;
