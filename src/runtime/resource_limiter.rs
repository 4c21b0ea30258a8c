// src/runtime/resource_limiter.rs
//! Resource limits for worker processes
//!
//! Limits are applied as rlimits in the forked child, after privileges are
//! dropped and before the worker executable runs:
//! - Address space (MB limit, Linux only)
//! - Open file descriptors
//! - Processes per user
//! - CPU seconds

use serde::{Deserialize, Serialize};

/// Resource limits for a worker process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Address space limit in megabytes
    /// Example: 2048 = 2GB virtual memory
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,

    /// Maximum open file descriptors
    #[serde(default)]
    pub max_open_files: Option<u64>,

    /// Maximum processes for the worker's uid
    #[serde(default)]
    pub max_processes: Option<u64>,

    /// CPU time in seconds before SIGXCPU
    #[serde(default)]
    pub cpu_time_secs: Option<u64>,
}

impl ResourceLimits {
    /// No restrictions beyond what the parent already has
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Tight limits for untrusted tenants
    pub fn strict() -> Self {
        Self {
            memory_limit_mb: Some(1024),
            max_open_files: Some(256),
            max_processes: Some(64),
            cpu_time_secs: Some(600),
        }
    }

    /// Generous limits for development
    pub fn relaxed() -> Self {
        Self {
            memory_limit_mb: Some(8192),
            max_open_files: Some(4096),
            max_processes: None,
            cpu_time_secs: None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        *self == Self::unlimited()
    }

    /// Validate resource limits
    pub fn validate(&self) -> Result<(), String> {
        if let Some(memory) = self.memory_limit_mb {
            if memory < 64 {
                return Err("Memory limit cannot be less than 64MB".to_string());
            }
            if memory > 1024 * 1024 {
                return Err("Memory limit cannot exceed 1TB".to_string());
            }
        }

        if let Some(files) = self.max_open_files {
            if files < 16 {
                return Err("Open file limit cannot be less than 16".to_string());
            }
        }

        if let Some(procs) = self.max_processes {
            if procs == 0 {
                return Err("Process limit cannot be 0".to_string());
            }
        }

        if let Some(cpu) = self.cpu_time_secs {
            if cpu == 0 {
                return Err("CPU time limit cannot be 0".to_string());
            }
        }

        Ok(())
    }

    /// Apply the limits to the calling process.
    ///
    /// Runs between fork and exec, so it only issues raw syscalls.
    pub fn apply_to_current_process(&self) -> std::io::Result<()> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Some(mb) = self.memory_limit_mb {
            set_limit(libc::RLIMIT_AS, mb.saturating_mul(1024 * 1024))?;
        }

        if let Some(files) = self.max_open_files {
            set_limit(libc::RLIMIT_NOFILE, files)?;
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Some(procs) = self.max_processes {
            set_limit(libc::RLIMIT_NPROC, procs)?;
        }

        if let Some(cpu) = self.cpu_time_secs {
            set_limit(libc::RLIMIT_CPU, cpu)?;
        }

        Ok(())
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type RlimitResource = libc::c_int;

fn set_limit(resource: RlimitResource, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: setrlimit reads a fully initialized rlimit struct.
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
