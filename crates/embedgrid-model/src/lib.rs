//! embedgrid-model — shared data model for Embedgrid.
//!
//! Holds the records exchanged between the replica topology planner, the
//! proxy mesh, the hypergrid synthesizer, and the orchestrator facade.
//!
//! # Architecture
//!
//! All records serialize to camelCase JSON so the API layer can pass them
//! through unchanged. Nothing in this crate owns state: registries live in
//! `embedgrid-orchestrator` and `embedgrid-mesh`.
//!
//! The `seed` module provides the deterministic pseudo-randomness every
//! reproducible path relies on (mulberry32 generators keyed by FNV-1a or
//! SHA-256 digests).

pub mod error;
pub mod seed;
pub mod types;

pub use error::{ModelError, ModelResult};
pub use seed::Mulberry32;
pub use types::*;

/// Milliseconds since the unix epoch.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
