//! Embedgrid orchestrator — the facade every caller goes through.
//!
//! Owns the blueprint registry and the derived caches built on top of it,
//! and coordinates the proxy mesh for bulk embeds and scale-out.
//!
//! # Components
//!
//! - **`orchestrator`**: Blueprint registry, upsert/delete/scale/terminate,
//!   replica samples, metrics and hypergrid caches, global metrics
//! - **`bulk`**: Batched embed creation and scale-out
//! - **`content`**: Deterministic stand-in URLs for unusable input
//!
//! # Caches
//!
//! Metrics snapshots live for the blueprint's `metrics_ttl_ms`; the
//! hypergrid snapshot lives for `hypergrid_ttl_ms` and is dropped on every
//! registry mutation.

pub mod bulk;
pub mod config;
pub mod content;
pub mod error;
pub mod orchestrator;
pub mod types;

pub use bulk::{
    BulkEmbedRequest, BulkEmbedResult, BulkEmbedSuccess, FallbackStrategy, ScaleResult, normalize_url,
    scale_batch_size,
};
pub use config::OrchestratorConfig;
pub use content::{ContentFactory, SaltedContentFactory};
pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::SessionOrchestrator;
pub use types::{BlueprintSnapshot, BlueprintSummary, BulkFailure, BulkUpsertResult, GlobalMetrics, ListOptions};
