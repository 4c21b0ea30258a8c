// src/runtime/termination.rs
//! Why a worker process ended, for crash reports and metrics

use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Reason a worker process terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code
    Exited(i32),

    /// Killed by a signal the pool did not send
    Signaled(Signal),

    /// SIGKILL the pool did not send; usually the OOM killer
    LikelyOutOfMemory,

    /// SIGSEGV/SIGBUS, often a stack overflow
    Segfault(Signal),

    /// Killed by the pool (cancel grace or shutdown grace expired)
    KilledByPool,

    /// Exit status could not be determined
    Unknown,
}

impl TerminationReason {
    /// Classify an exit status. `killed_by_pool` marks SIGKILLs we sent.
    pub fn from_status(status: ExitStatus, killed_by_pool: bool) -> Self {
        if let Some(code) = status.code() {
            return TerminationReason::Exited(code);
        }
        match status.signal().and_then(|s| Signal::try_from(s).ok()) {
            Some(Signal::SIGKILL) if killed_by_pool => TerminationReason::KilledByPool,
            Some(Signal::SIGKILL) => TerminationReason::LikelyOutOfMemory,
            Some(sig @ (Signal::SIGSEGV | Signal::SIGBUS)) => TerminationReason::Segfault(sig),
            Some(sig) => TerminationReason::Signaled(sig),
            None => TerminationReason::Unknown,
        }
    }

    pub fn is_clean_exit(&self) -> bool {
        matches!(self, TerminationReason::Exited(0))
    }

    /// Short stable label, used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            TerminationReason::Exited(0) => "exit_ok",
            TerminationReason::Exited(_) => "exit_error",
            TerminationReason::Signaled(_) => "signal",
            TerminationReason::LikelyOutOfMemory => "oom",
            TerminationReason::Segfault(_) => "segfault",
            TerminationReason::KilledByPool => "killed",
            TerminationReason::Unknown => "unknown",
        }
    }

    pub fn description(&self) -> String {
        match self {
            TerminationReason::Exited(code) => format!("exited with code {}", code),
            TerminationReason::Signaled(sig) => format!("killed by signal {:?}", sig),
            TerminationReason::LikelyOutOfMemory => {
                "killed by SIGKILL (likely out of memory)".to_string()
            }
            TerminationReason::Segfault(sig) => format!("crashed with {:?}", sig),
            TerminationReason::KilledByPool => "killed by the pool".to_string(),
            TerminationReason::Unknown => "terminated for an unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
