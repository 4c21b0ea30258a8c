// src/lib.rs
//! Tenant Pool Library
//!
//! Persistent pool of per-tenant worker processes. Each worker runs as the
//! tenant's OS identity, is driven over a Unix socket with a newline-delimited
//! JSON protocol, and serves one query at a time.
//!
//! # Architecture
//!
//! The crate is structured into several key modules:
//!
//! - **runtime**: pool manager, worker handles, supervisors, sessions, spawning
//! - **protocol**: frame types and the line codec
//! - **worker**: the runtime that runs inside a worker process
//! - **observability**: Metrics, tracing, and logging
//! - **utils**: configuration and error types

// Public module exports
pub mod observability;
pub mod protocol;
pub mod runtime;
pub mod utils;
pub mod worker;

// Re-export commonly used types
pub use protocol::{Frame, FrameCodec, RequestId};
pub use runtime::{
    CancelState, DirectoryResolver, HandleSnapshot, HandleState, Identity, PoolStats,
    QueryRequest, QuerySession, SessionEvent, StaticResolver, TerminationReason, WorkerPool,
    WorkspaceKey, WorkspaceResolver,
};
pub use utils::config::PoolConfig;
pub use utils::errors::{PoolError, QueryFailure, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Crate build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
