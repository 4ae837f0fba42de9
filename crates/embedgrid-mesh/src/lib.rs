//! Embedgrid proxy mesh — synthetic proxy pools bound to sessions.
//!
//! Every node in the mesh is generated data with a reproducible statistical
//! shape; nothing here opens a socket.
//!
//! # Components
//!
//! - **`catalog`**: Static country blueprints, deterministic synthesis for
//!   unlisted countries, node generation
//! - **`scorer`**: Pool eligibility and multi-factor node scoring
//! - **`manager`**: Pool registry, assignment, release, rotation, metrics
//! - **`sweeper`**: Periodic health-check and rotation loops
//! - **`hooks`**: Pluggable failover and health-probe extension points
//!
//! # Concurrency
//!
//! ```text
//! ProxyMeshManager
//!   ├── dynamic blueprints  (RwLock)   ← ensure_country_pools
//!   ├── pools + nodes       (RwLock)   ← assign / release / health sweep
//!   └── session bindings    (RwLock)   ← assign / release / rotation sweep
//! ```
//!
//! Locks are always taken in that order, so assignment (which reads and
//! then bumps a node's `concurrent` counter) never races a release.

pub mod catalog;
pub mod config;
pub mod error;
pub mod hooks;
pub mod manager;
pub mod scorer;
pub mod sweeper;
pub mod types;

pub use catalog::{
    CountryBlueprint, generate_nodes, pool_id_for, static_blueprint, static_catalog,
    synthesize_blueprint,
};
pub use config::MeshConfig;
pub use error::{MeshError, MeshResult};
pub use hooks::{BoxFuture, FailoverStrategy, HealthProbe, NoFailover, ProbeOutcome, TouchProbe};
pub use manager::{ProxyMeshManager, RotationOutcome};
pub use scorer::{NodeScore, ScoreBreakdown, pool_is_eligible, score_node};
pub use sweeper::{HealthSweepStats, RotationSweepStats};
pub use types::*;
