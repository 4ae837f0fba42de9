//! Orchestrator error types.

use thiserror::Error;

use embedgrid_mesh::MeshError;
use embedgrid_model::ModelError;

/// Errors that can occur during orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("invalid session definition: {0}")]
    Validation(#[from] ModelError),

    #[error("concurrent modification of {id}: expected version {expected}, found {actual}")]
    ConcurrentModification { id: String, expected: u64, actual: u64 },

    #[error("proxy mesh error: {0}")]
    Mesh(#[from] MeshError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
