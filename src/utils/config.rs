// src/utils/config.rs
//! Pool configuration
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables prefixed with `TENANT_POOL__` (nested keys use `__`).
//!
//! The five capacity knobs have no defaults: a config that omits them fails to
//! load. A zero is always taken literally (see [`PoolConfig::validate`]).

use crate::runtime::eviction::EvictionStrategy;
use crate::runtime::resource_limiter::ResourceLimits;
use crate::utils::errors::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "TENANT_POOL";

/// Configuration for the worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of simultaneously live (non-dead) workers
    pub max_concurrent_workers: usize,

    /// Idle time after which the sweep retires a ready worker (0 = never)
    pub idle_eviction_threshold_ms: u64,

    /// Deadline for a spawned worker to send `ready`
    pub spawn_timeout_ms: u64,

    /// Interval between healthcheck probes (0 = disabled)
    pub healthcheck_interval_ms: u64,

    /// Time a worker gets to acknowledge `cancel` before it is killed
    pub cancel_grace_ms: u64,

    /// Deadline for a healthcheck reply
    #[serde(default = "default_healthcheck_timeout_ms")]
    pub healthcheck_timeout_ms: u64,

    /// Time a worker gets to exit after `shutdown` before SIGKILL
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Default per-query deadline, overridable per request
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Longest accepted frame line in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Directory holding `<pool_id>/<handle_id>.sock`
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// Victim selection when capacity is exhausted
    #[serde(default)]
    pub eviction: EvictionStrategy,

    /// Worker executable and arguments
    #[serde(default)]
    pub worker: WorkerCommand,

    /// Resource limits applied to every worker before exec
    #[serde(default)]
    pub limits: ResourceLimits,

    /// Root of tenant site directories, used by `DirectoryResolver`
    #[serde(default)]
    pub sites_root: Option<PathBuf>,
}

/// How to launch a worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Executable path; the current executable when unset
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Arguments placed before the supervisor-provided ones
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,

    /// Parent environment variables copied into the otherwise empty worker env
    #[serde(default = "default_env_passthrough")]
    pub env_passthrough: Vec<String>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: None,
            args: default_worker_args(),
            env_passthrough: default_env_passthrough(),
        }
    }
}

impl WorkerCommand {
    /// Resolve the executable to launch
    pub fn resolve_program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(path) if path.as_os_str().is_empty() => Err(PoolError::ConfigError(
                "Worker program path is empty".to_string(),
            )),
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(|e| {
                PoolError::ConfigError(format!("Cannot determine worker executable: {}", e))
            }),
        }
    }
}

fn default_healthcheck_timeout_ms() -> u64 {
    2_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_query_timeout_ms() -> u64 {
    600_000
}

fn default_max_frame_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("tenant-pool")
}

fn default_worker_args() -> Vec<String> {
    vec!["worker".to_string()]
}

fn default_env_passthrough() -> Vec<String> {
    vec!["RUST_LOG".to_string(), "TENANT_POOL_LOG_FORMAT".to_string()]
}

impl PoolConfig {
    /// Build a config from the five required knobs; everything else defaults
    pub fn new(
        max_concurrent_workers: usize,
        idle_eviction_threshold_ms: u64,
        spawn_timeout_ms: u64,
        healthcheck_interval_ms: u64,
        cancel_grace_ms: u64,
    ) -> Self {
        Self {
            max_concurrent_workers,
            idle_eviction_threshold_ms,
            spawn_timeout_ms,
            healthcheck_interval_ms,
            cancel_grace_ms,
            healthcheck_timeout_ms: default_healthcheck_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            runtime_dir: default_runtime_dir(),
            eviction: EvictionStrategy::default(),
            worker: WorkerCommand::default(),
            limits: ResourceLimits::default(),
            sites_root: None,
        }
    }

    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: PoolConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot describe a working pool
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_workers == 0 {
            return Err(PoolError::ConfigError(
                "max_concurrent_workers must be at least 1".to_string(),
            ));
        }
        if self.spawn_timeout_ms == 0 {
            return Err(PoolError::ConfigError(
                "spawn_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(PoolError::ConfigError(
                "query_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.healthcheck_interval_ms > 0 && self.healthcheck_timeout_ms == 0 {
            return Err(PoolError::ConfigError(
                "healthcheck_timeout_ms must be greater than 0 when healthchecks are enabled"
                    .to_string(),
            ));
        }
        if self.max_frame_bytes < 1024 {
            return Err(PoolError::ConfigError(
                "max_frame_bytes must be at least 1024".to_string(),
            ));
        }
        self.limits
            .validate()
            .map_err(|e| PoolError::ConfigError(format!("limits: {}", e)))?;
        Ok(())
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn healthcheck_timeout(&self) -> Duration {
        Duration::from_millis(self.healthcheck_timeout_ms)
    }

    /// `None` when healthchecks are disabled
    pub fn healthcheck_interval(&self) -> Option<Duration> {
        (self.healthcheck_interval_ms > 0).then(|| Duration::from_millis(self.healthcheck_interval_ms))
    }

    /// `None` when the idle sweep is disabled
    pub fn idle_eviction_threshold(&self) -> Option<Duration> {
        (self.idle_eviction_threshold_ms > 0)
            .then(|| Duration::from_millis(self.idle_eviction_threshold_ms))
    }
}
