//! Error types for the shared data model.

use thiserror::Error;

/// Result type alias for model validation.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while validating session definitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid session definition: {0}")]
    InvalidDefinition(String),
}
