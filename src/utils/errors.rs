// src/utils/errors.rs
//! Error taxonomy for the worker pool
//!
//! Local failures (capacity, spawn, crash, timeout) are variants of
//! [`PoolError`]. Application errors reported by a worker travel inside
//! session events as [`QueryFailure::Worker`] and are never rewritten.

use std::time::Duration;
use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors produced by the pool, the supervisor and the protocol layer
#[derive(Debug, Error)]
pub enum PoolError {
    /// No ready handle could be found or evicted for a new workspace
    #[error("Pool at capacity: all {capacity} workers are busy")]
    PoolAtCapacity { capacity: usize },

    /// The workspace already has a handle that is busy, spawning or draining
    #[error("Workspace {workspace} already has an active worker ({state})")]
    WorkspaceBusy { workspace: String, state: String },

    /// A worker did not reach `ready` in time or failed its handshake
    #[error("Failed to spawn worker for {workspace}: {reason}")]
    SpawnFailed { workspace: String, reason: String },

    /// A worker exited or stopped answering while it owned a query
    #[error("Worker {handle_id} crashed: {reason}")]
    WorkerCrashed { handle_id: String, reason: String },

    /// Application error reported by the worker for a query
    #[error("Worker error [{code}]: {message}")]
    WorkerError { code: String, message: String },

    /// Malformed or unexpected frame on the worker transport
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Operation was cancelled by the caller
    #[error("Cancelled")]
    Cancelled,

    /// The pool is shutting down and accepts no new work
    #[error("Pool is shut down")]
    PoolClosed,

    /// The workspace key could not be resolved to an identity
    #[error("Invalid workspace {workspace}: {reason}")]
    InvalidWorkspace { workspace: String, reason: String },

    /// A worker declared an OS identity other than the one requested
    #[error("Identity mismatch: expected uid={expected_uid} gid={expected_gid}, worker reported uid={actual_uid} gid={actual_gid}")]
    IdentityMismatch {
        expected_uid: u32,
        expected_gid: u32,
        actual_uid: u32,
        actual_gid: u32,
    },

    /// Illegal handle lifecycle edge
    #[error("Handle {handle_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        handle_id: String,
        from: &'static str,
        to: &'static str,
    },

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PoolError {
    /// Whether the caller may reasonably retry the same query later.
    ///
    /// The pool never retries on its own; this only classifies.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::PoolAtCapacity { .. }
                | PoolError::WorkspaceBusy { .. }
                | PoolError::SpawnFailed { .. }
                | PoolError::WorkerCrashed { .. }
        )
    }

    /// Short stable label, used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            PoolError::PoolAtCapacity { .. } => "pool_at_capacity",
            PoolError::WorkspaceBusy { .. } => "workspace_busy",
            PoolError::SpawnFailed { .. } => "spawn_failed",
            PoolError::WorkerCrashed { .. } => "worker_crashed",
            PoolError::WorkerError { .. } => "worker_error",
            PoolError::Protocol(_) => "protocol",
            PoolError::Timeout(_) => "timeout",
            PoolError::Cancelled => "cancelled",
            PoolError::PoolClosed => "pool_closed",
            PoolError::InvalidWorkspace { .. } => "invalid_workspace",
            PoolError::IdentityMismatch { .. } => "identity_mismatch",
            PoolError::InvalidTransition { .. } => "invalid_transition",
            PoolError::ConfigError(_) => "config",
            PoolError::Io(_) => "io",
            PoolError::Json(_) => "json",
        }
    }
}

impl From<config::ConfigError> for PoolError {
    fn from(e: config::ConfigError) -> Self {
        PoolError::ConfigError(e.to_string())
    }
}

/// Terminal failure of one query, as seen by the session owner
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryFailure {
    /// The worker reported an application error; passed through unmodified
    #[error("Worker error [{code}]: {message}")]
    Worker { code: String, message: String },

    /// The worker process died or stopped responding mid-query
    #[error("Worker crashed: {reason}")]
    WorkerCrashed { reason: String },

    /// The session deadline elapsed
    #[error("Query timed out after {0:?}")]
    TimedOut(Duration),

    /// The caller cancelled the query
    #[error("Query cancelled")]
    Cancelled,
}

impl QueryFailure {
    /// True for failures produced locally rather than by the worker
    pub fn is_local(&self) -> bool {
        !matches!(self, QueryFailure::Worker { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            QueryFailure::Worker { .. } => "worker_error",
            QueryFailure::WorkerCrashed { .. } => "worker_crashed",
            QueryFailure::TimedOut(_) => "timed_out",
            QueryFailure::Cancelled => "cancelled",
        }
    }

    /// Lift into [`PoolError`]; `handle_id` names the worker that ran the query
    pub fn into_error(self, handle_id: &str) -> PoolError {
        match self {
            QueryFailure::Worker { code, message } => PoolError::WorkerError { code, message },
            QueryFailure::WorkerCrashed { reason } => PoolError::WorkerCrashed {
                handle_id: handle_id.to_string(),
                reason,
            },
            QueryFailure::TimedOut(after) => PoolError::Timeout(after),
            QueryFailure::Cancelled => PoolError::Cancelled,
        }
    }
}
