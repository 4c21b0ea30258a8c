// src/utils/mod.rs
//! Shared utilities: configuration and error types

pub mod config;
pub mod errors;

pub use config::{PoolConfig, WorkerCommand};
pub use errors::{PoolError, QueryFailure, Result};
