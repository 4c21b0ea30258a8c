// src/runtime/worker_handle.rs
//! Worker handle: the pool's record of one live worker process
//!
//! # State Machine
//!
//! ```text
//! spawning ──▶ ready ◀──▶ busy
//!    │           │          │
//!    │           └──▶ draining ◀──┘
//!    │                   │
//!    └──────────▶ dead ◀─┘
//! ```
//!
//! `dead` is terminal. `spawning → dead` only happens when the spawn fails.

use crate::protocol::RequestId;
use crate::runtime::identity::Identity;
use crate::runtime::supervisor::WorkerLink;
use crate::utils::errors::{PoolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;
use ulid::Ulid;

/// Opaque tenant identifier; at most one live worker per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceKey(String);

impl WorkspaceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkspaceKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkspaceKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&WorkspaceKey> for WorkspaceKey {
    fn from(k: &WorkspaceKey) -> Self {
        k.clone()
    }
}

impl fmt::Display for WorkspaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique per handle for the lifetime of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(Ulid);

impl HandleId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a worker handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Spawning,
    Ready,
    Busy,
    Draining,
    Dead,
}

impl HandleState {
    /// Whether `self → next` is a legal edge
    pub fn can_transition_to(self, next: HandleState) -> bool {
        use HandleState::*;
        matches!(
            (self, next),
            (Spawning, Ready)
                | (Spawning, Dead)
                | (Ready, Busy)
                | (Busy, Ready)
                | (Ready, Draining)
                | (Busy, Draining)
                | (Draining, Dead)
        )
    }

    /// Counts against pool capacity
    pub fn is_live(self) -> bool {
        self != HandleState::Dead
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HandleState::Spawning => "spawning",
            HandleState::Ready => "ready",
            HandleState::Busy => "busy",
            HandleState::Draining => "draining",
            HandleState::Dead => "dead",
        }
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool-side record of one worker.
///
/// The transport itself is owned by the handle's supervisor task; the handle
/// keeps the [`WorkerLink`] used to reach it.
#[derive(Debug)]
pub struct WorkerHandle {
    pub(crate) id: HandleId,
    pub(crate) workspace: WorkspaceKey,
    pub(crate) identity: Identity,
    pub(crate) pid: Option<u32>,
    pub(crate) state: HandleState,
    pub(crate) active_query: Option<RequestId>,
    pub(crate) last_used_at: Instant,
    pub(crate) spawned_at: Instant,
    pub(crate) spawned_at_utc: DateTime<Utc>,
    pub(crate) queries_completed: u64,
    pub(crate) link: Option<WorkerLink>,
}

impl WorkerHandle {
    /// Capacity reservation for a worker that is about to be spawned
    pub(crate) fn reserve(id: HandleId, workspace: WorkspaceKey, identity: Identity) -> Self {
        let now = Instant::now();
        Self {
            id,
            workspace,
            identity,
            pid: None,
            state: HandleState::Spawning,
            active_query: None,
            last_used_at: now,
            spawned_at: now,
            spawned_at_utc: Utc::now(),
            queries_completed: 0,
            link: None,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn workspace(&self) -> &WorkspaceKey {
        &self.workspace
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn transition(&mut self, next: HandleState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(PoolError::InvalidTransition {
                handle_id: self.id.to_string(),
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// `spawning → ready` once the worker has sent `ready`
    pub(crate) fn attach(&mut self, pid: u32, link: WorkerLink) -> Result<()> {
        self.transition(HandleState::Ready)?;
        let now = Instant::now();
        self.pid = Some(pid);
        self.link = Some(link);
        self.spawned_at = now;
        self.last_used_at = now;
        Ok(())
    }

    /// `ready → busy`, recording the query that owns the handle
    pub(crate) fn mark_busy(&mut self, request_id: RequestId) -> Result<()> {
        self.transition(HandleState::Busy)?;
        self.active_query = Some(request_id);
        Ok(())
    }

    /// `busy → ready`
    pub(crate) fn mark_ready(&mut self) -> Result<()> {
        self.transition(HandleState::Ready)?;
        self.active_query = None;
        self.last_used_at = Instant::now();
        self.queries_completed += 1;
        Ok(())
    }

    /// Terminal transition; `ready` and `busy` pass through `draining`
    pub(crate) fn mark_dead(&mut self) {
        if matches!(self.state, HandleState::Ready | HandleState::Busy) {
            self.state = HandleState::Draining;
        }
        self.state = HandleState::Dead;
        self.active_query = None;
        self.link = None;
    }

    pub fn snapshot(&self) -> HandleSnapshot {
        HandleSnapshot {
            handle_id: self.id.to_string(),
            workspace: self.workspace.to_string(),
            pid: self.pid,
            state: self.state,
            active_query: self.active_query.as_ref().map(|r| r.to_string()),
            uid: self.identity.uid,
            gid: self.identity.gid,
            cwd: self.identity.cwd.display().to_string(),
            idle_ms: self.last_used_at.elapsed().as_millis() as u64,
            spawned_at: self.spawned_at_utc,
            queries_completed: self.queries_completed,
        }
    }
}

/// Read-only view of a handle for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct HandleSnapshot {
    pub handle_id: String,
    pub workspace: String,
    pub pid: Option<u32>,
    pub state: HandleState,
    pub active_query: Option<String>,
    pub uid: u32,
    pub gid: u32,
    pub cwd: String,
    pub idle_ms: u64,
    pub spawned_at: DateTime<Utc>,
    pub queries_completed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> WorkerHandle {
        WorkerHandle::reserve(
            HandleId::new(),
            WorkspaceKey::from("site-a"),
            Identity::new(1000, 1000, "/tmp"),
        )
    }

    #[test]
    fn test_legal_edges() {
        use HandleState::*;
        let all = [Spawning, Ready, Busy, Draining, Dead];
        let legal = [
            (Spawning, Ready),
            (Spawning, Dead),
            (Ready, Busy),
            (Busy, Ready),
            (Ready, Draining),
            (Busy, Draining),
            (Draining, Dead),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_dead_is_terminal() {
        for next in [
            HandleState::Spawning,
            HandleState::Ready,
            HandleState::Busy,
            HandleState::Draining,
        ] {
            assert!(!HandleState::Dead.can_transition_to(next));
        }
        assert!(!HandleState::Dead.is_live());
    }

    #[test]
    fn test_busy_requires_ready() {
        let mut h = handle();
        assert!(h.mark_busy(RequestId::new()).is_err());
        assert_eq!(h.state(), HandleState::Spawning);
    }

    #[tokio::test]
    async fn test_ready_busy_cycle() {
        let mut h = handle();
        h.transition(HandleState::Ready).unwrap();

        let rid = RequestId::new();
        h.mark_busy(rid.clone()).unwrap();
        assert_eq!(h.active_query, Some(rid));

        h.mark_ready().unwrap();
        assert_eq!(h.state(), HandleState::Ready);
        assert!(h.active_query.is_none());
        assert_eq!(h.queries_completed, 1);

        let snap = h.snapshot();
        assert_eq!(snap.state, HandleState::Ready);
        assert_eq!(snap.workspace, "site-a");
    }

    #[test]
    fn test_invalid_transition_error() {
        let mut h = handle();
        let err = h.transition(HandleState::Busy).unwrap_err();
        assert!(err.to_string().contains("spawning"));
        assert!(err.to_string().contains("busy"));
    }
}
