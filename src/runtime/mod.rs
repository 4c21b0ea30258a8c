// src/runtime/mod.rs
//! Worker pool runtime
//!
//! This module provides the pool side of the system:
//!
//! - **Worker Pool**: workspace → worker map, capacity, eviction, idle sweep
//! - **Worker Handle**: per-worker lifecycle state machine
//! - **Supervisor**: one task per worker owning its transport and process
//! - **Process Manager**: socket setup, privilege drop, `ready` handshake
//! - **Session**: caller-facing event stream for one query
//! - **Identity**: workspace → uid/gid/cwd resolution
//! - **Resource Limiter**: rlimits applied before exec
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   WorkerPool                         │
//! │  workspace → WorkerHandle   (≤ max_concurrent)       │
//! │         │                                            │
//! │         │ WorkerLink (mpsc)                          │
//! │         ▼                                            │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐      │
//! │  │ Supervisor │  │ Supervisor │  │ Supervisor │ ...  │
//! │  └─────┬──────┘  └─────┬──────┘  └─────┬──────┘      │
//! └────────┼───────────────┼───────────────┼─────────────┘
//!          │ unix socket   │               │
//!   ┌──────┴─────┐  ┌──────┴─────┐  ┌──────┴─────┐
//!   │ worker     │  │ worker     │  │ worker     │
//!   │ uid=site-a │  │ uid=site-b │  │ uid=site-c │
//!   └────────────┘  └────────────┘  └────────────┘
//! ```

pub mod eviction;
pub mod identity;
pub mod process_manager;
pub mod resource_limiter;
pub mod session;
pub mod supervisor;
pub mod termination;
pub mod worker_handle;
pub mod worker_pool;

// Re-export commonly used types
pub use eviction::{EvictionPolicy, EvictionStrategy, IdleTimeout, LeastRecentlyUsed};
pub use identity::{DirectoryResolver, Identity, StaticResolver, WorkspaceResolver};
pub use process_manager::{ProcessManager, SpawnConfig};
pub use resource_limiter::ResourceLimits;
pub use session::{CancelState, QueryRequest, QuerySession, SessionEvent};
pub use supervisor::{CancelOutcome, WorkerLink};
pub use termination::TerminationReason;
pub use worker_handle::{HandleId, HandleSnapshot, HandleState, WorkspaceKey};
pub use worker_pool::{AcquiredWorker, PoolStats, WorkerPool};
