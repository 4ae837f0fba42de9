//! Proxy mesh error types.

use thiserror::Error;

/// Errors that can occur during mesh operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshError {
    #[error("no eligible proxy for session {session_id}: {reason}")]
    AssignmentUnavailable { session_id: String, reason: String },

    #[error("session has no proxy binding: {0}")]
    SessionNotBound(String),

    #[error("proxy pool not found: {0}")]
    PoolNotFound(String),

    #[error("proxy node not found: {pool_id}/{node_id}")]
    NodeNotFound { pool_id: String, node_id: String },
}

pub type MeshResult<T> = Result<T, MeshError>;
