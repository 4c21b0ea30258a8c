// src/runtime/worker_pool.rs
//! Per-tenant worker pool
//!
//! Maps each workspace key to at most one live worker and keeps the number
//! of live workers at or below `max_concurrent_workers`.
//!
//! # Locking
//!
//! - `state` (parking_lot) guards the handle table. It is never held across
//!   an await, so supervisors can release handles synchronously.
//! - `admission` (tokio) serializes the slow path of `acquire`: capacity
//!   check, victim choice and spawn reservation. It is released before any
//!   await on a worker. An evicted handle's slot stays promised to the
//!   acquire that evicted it until that acquire reserves it or gives up.
//! - Spawns run in a tracked task against a `spawning` reservation that
//!   already counts toward capacity, so a caller dropping its future never
//!   strands the reservation.
//!
//! # Example
//!
//! ```no_run
//! use tenant_pool::{PoolConfig, QueryRequest, SessionEvent, StaticResolver, Identity, WorkerPool};
//! use std::sync::Arc;
//!
//! # async fn run() -> tenant_pool::Result<()> {
//! let resolver = StaticResolver::new().with("site-a", Identity::current("/srv/site-a"));
//! let pool = WorkerPool::start(PoolConfig::new(8, 300_000, 10_000, 30_000, 5_000), Arc::new(resolver))?;
//!
//! let mut session = pool.query("site-a", QueryRequest::new(serde_json::json!({"prompt": "hi"}))).await?;
//! while let Some(event) = session.next_event().await {
//!     if let SessionEvent::Complete(result) = event {
//!         println!("{}", result);
//!     }
//! }
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::observability::metrics as pool_metrics;
use crate::protocol::RequestId;
use crate::runtime::eviction::{EvictionCandidate, EvictionPolicy};
use crate::runtime::identity::{Identity, WorkspaceResolver};
use crate::runtime::process_manager::{remove_socket, ProcessManager, SpawnConfig};
use crate::runtime::session::{QueryRequest, QuerySession};
use crate::runtime::supervisor::{
    HandleRegistry, ReleaseDisposition, Supervisor, SupervisorSettings, WorkerLink,
};
use crate::runtime::termination::TerminationReason;
use crate::runtime::worker_handle::{
    HandleId, HandleSnapshot, HandleState, WorkerHandle, WorkspaceKey,
};
use crate::utils::config::PoolConfig;
use crate::utils::errors::{PoolError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Point-in-time pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub live: usize,
    pub spawning: usize,
    pub ready: usize,
    pub busy: usize,
    pub draining: usize,
}

#[derive(Default)]
struct PoolState {
    /// At most one live handle per workspace
    handles: HashMap<WorkspaceKey, WorkerHandle>,

    /// Draining handles already detached from their workspace, until their process is gone
    retiring: HashMap<HandleId, WorkerHandle>,

    /// Retiring handles whose slot is promised to the acquire that evicted them
    evicting: HashSet<HandleId>,

    /// Slots of evicted handles already gone but not yet reserved by their evictor
    held_slots: usize,

    closed: bool,
}

impl PoolState {
    fn live_count(&self) -> usize {
        self.handles.len() + self.retiring.len() + self.held_slots
    }

    /// A retiring handle's process is gone
    fn retire_finished(&mut self, handle_id: HandleId) {
        if let Some(mut handle) = self.retiring.remove(&handle_id) {
            handle.mark_dead();
            if self.evicting.remove(&handle_id) {
                self.held_slots += 1;
            }
        }
    }

    /// The victim's slot now backs a new reservation (or is freed)
    fn take_evicted_slot(&mut self, victim_id: HandleId) {
        if self.evicting.remove(&victim_id) {
            if let Some(mut stale) = self.retiring.remove(&victim_id) {
                stale.mark_dead();
            }
        } else {
            self.held_slots = self.held_slots.saturating_sub(1);
        }
    }

    /// The evictor gave up; the victim's slot returns to the pool once it is gone
    fn return_evicted_slot(&mut self, victim_id: HandleId) {
        if !self.evicting.remove(&victim_id) {
            self.held_slots = self.held_slots.saturating_sub(1);
        }
    }

    /// Detach a ready handle and move it to `retiring`; returns its link
    fn retire_ready(&mut self, workspace: &WorkspaceKey) -> Option<(HandleId, WorkerLink)> {
        let mut handle = self.handles.remove(workspace)?;
        if let Err(e) = handle.transition(HandleState::Draining) {
            warn!("Cannot retire {}: {}", workspace, e);
            self.handles.insert(workspace.clone(), handle);
            return None;
        }
        let id = handle.id;
        let link = handle.link.clone();
        self.retiring.insert(id, handle);
        link.map(|link| (id, link))
    }

    fn stats(&self, capacity: usize) -> PoolStats {
        let mut stats = PoolStats {
            capacity,
            live: self.live_count(),
            ..Default::default()
        };
        for handle in self.handles.values().chain(self.retiring.values()) {
            match handle.state {
                HandleState::Spawning => stats.spawning += 1,
                HandleState::Ready => stats.ready += 1,
                HandleState::Busy => stats.busy += 1,
                HandleState::Draining => stats.draining += 1,
                HandleState::Dead => {}
            }
        }
        stats
    }
}

/// An evicted handle's capacity slot, held by the acquire that evicted it.
///
/// Dropped without being taken (caller gave up or errored), the slot goes
/// back to the pool.
struct EvictedSlot<'a> {
    state: &'a Mutex<PoolState>,
    victim_id: HandleId,
    held: bool,
}

impl<'a> EvictedSlot<'a> {
    fn new(state: &'a Mutex<PoolState>, victim_id: HandleId) -> Self {
        Self {
            state,
            victim_id,
            held: true,
        }
    }

    fn take(mut self, state: &mut PoolState) {
        self.held = false;
        state.take_evicted_slot(self.victim_id);
    }
}

impl Drop for EvictedSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.state.lock().return_evicted_slot(self.victim_id);
        }
    }
}

pub(crate) struct PoolShared {
    pool_id: String,
    config: PoolConfig,
    settings: SupervisorSettings,
    state: Mutex<PoolState>,
    admission: tokio::sync::Mutex<()>,
    processes: ProcessManager,
    resolver: Arc<dyn WorkspaceResolver>,
    policy: Box<dyn EvictionPolicy>,
    tasks: TaskTracker,
    stop: CancellationToken,
}

/// A handle marked busy for the caller, not yet carrying a query.
///
/// Dropping it releases the handle back to `ready`.
pub struct AcquiredWorker {
    handle_id: HandleId,
    workspace: WorkspaceKey,
    request_id: RequestId,
    pid: Option<u32>,
    link: WorkerLink,
    pool: Weak<PoolShared>,
    armed: bool,
}

impl AcquiredWorker {
    pub fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    pub fn workspace(&self) -> &WorkspaceKey {
        &self.workspace
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn release_now(&mut self) {
        if !std::mem::take(&mut self.armed) {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.release_unused(&self.workspace, self.handle_id);
        }
    }
}

impl std::fmt::Debug for AcquiredWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredWorker")
            .field("handle_id", &self.handle_id)
            .field("workspace", &self.workspace)
            .field("pid", &self.pid)
            .finish()
    }
}

impl Drop for AcquiredWorker {
    fn drop(&mut self) {
        self.release_now();
    }
}

/// Pool of per-tenant worker processes
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Validate `config`, prepare the socket directory and start the idle sweep.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(config: PoolConfig, resolver: Arc<dyn WorkspaceResolver>) -> Result<Self> {
        config.validate()?;

        let pool_id = Ulid::new().to_string();
        let processes = ProcessManager::new(&pool_id, &config)?;
        let policy = config.eviction.build(config.idle_eviction_threshold());

        info!(
            "Starting worker pool {} (capacity {}, eviction {})",
            pool_id,
            config.max_concurrent_workers,
            policy.name()
        );

        let shared = Arc::new(PoolShared {
            pool_id,
            settings: SupervisorSettings::from_config(&config),
            state: Mutex::new(PoolState::default()),
            admission: tokio::sync::Mutex::new(()),
            processes,
            resolver,
            policy,
            tasks: TaskTracker::new(),
            stop: CancellationToken::new(),
            config,
        });

        if let Some(threshold) = shared.config.idle_eviction_threshold() {
            spawn_idle_sweep(&shared, threshold);
        }

        Ok(Self { shared })
    }

    pub fn pool_id(&self) -> &str {
        &self.shared.pool_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Get a busy handle for `workspace`, spawning (and evicting) if needed.
    ///
    /// Fails fast with `WorkspaceBusy` if the workspace's worker is busy,
    /// spawning or draining, and with `PoolAtCapacity` if nothing can be evicted.
    pub async fn acquire(&self, workspace: impl Into<WorkspaceKey>) -> Result<AcquiredWorker> {
        let workspace = workspace.into();
        let shared = &self.shared;

        if let Some(worker) = shared.claim(&mut shared.state.lock(), &workspace)? {
            return Ok(worker);
        }

        let identity = shared.resolver.resolve(&workspace)?;
        let handle_id = HandleId::new();

        let admission = shared.admission.lock().await;
        let victim = {
            let mut state = shared.state.lock();
            if let Some(worker) = shared.claim(&mut state, &workspace)? {
                return Ok(worker);
            }
            if state.live_count() < shared.config.max_concurrent_workers {
                shared.reserve(&mut state, handle_id, &workspace, &identity);
                None
            } else {
                let (victim_id, victim_workspace, link) = shared.pick_victim(&mut state)?;
                state.evicting.insert(victim_id);
                Some((EvictedSlot::new(&shared.state, victim_id), victim_workspace, link))
            }
        };
        drop(admission);

        if let Some((slot, victim_workspace, link)) = victim {
            info!(
                "Evicting worker {} ({}) to make room for {}",
                link.handle_id(),
                victim_workspace,
                workspace
            );
            pool_metrics::record_eviction("capacity");
            link.shutdown().await;

            let mut state = shared.state.lock();
            slot.take(&mut state);
            if let Some(worker) = shared.claim(&mut state, &workspace)? {
                return Ok(worker);
            }
            shared.reserve(&mut state, handle_id, &workspace, &identity);
        }

        let spawn = {
            let pool = Arc::clone(shared);
            let workspace = workspace.clone();
            shared
                .tasks
                .spawn(async move { pool.spawn_reserved(handle_id, workspace, identity).await })
        };
        match spawn.await {
            Ok(result) => result,
            Err(e) => {
                shared.discard_reservation(&workspace, handle_id);
                Err(PoolError::SpawnFailed {
                    workspace: workspace.to_string(),
                    reason: format!("spawn task failed: {}", e),
                })
            }
        }
    }

    /// Return an acquired handle to `ready` without running a query
    pub fn release(&self, mut worker: AcquiredWorker) {
        worker.release_now();
    }

    /// Acquire a handle for `workspace` and dispatch `request` to it
    pub async fn query(
        &self,
        workspace: impl Into<WorkspaceKey>,
        request: QueryRequest,
    ) -> Result<QuerySession> {
        let mut worker = self.acquire(workspace).await?;
        let timeout = request
            .timeout
            .unwrap_or_else(|| self.shared.config.query_timeout());

        let (tx, rx) = mpsc::unbounded_channel();
        worker
            .link
            .dispatch(worker.request_id.clone(), request.input, timeout, tx)?;
        // The supervisor owns the release from here on
        worker.armed = false;

        debug!(
            "Query {} dispatched to worker {} for {}",
            worker.request_id, worker.handle_id, worker.workspace
        );

        Ok(QuerySession::new(
            worker.request_id.clone(),
            worker.workspace.clone(),
            worker.link.clone(),
            rx,
        ))
    }

    /// Retire every ready handle idle longer than the threshold; returns how many
    pub async fn evict_idle(&self) -> usize {
        self.shared.evict_idle().await
    }

    /// Retire the workspace's handle: now if ready, after its query if busy.
    ///
    /// Returns `false` if the workspace has no handle.
    pub async fn drain(&self, workspace: impl Into<WorkspaceKey>) -> Result<bool> {
        let workspace = workspace.into();
        let retired = {
            let mut state = self.shared.state.lock();
            let Some(handle) = state.handles.get_mut(&workspace) else {
                return Ok(false);
            };
            let current = handle.state;
            match current {
                HandleState::Ready => state.retire_ready(&workspace),
                HandleState::Busy => {
                    handle.transition(HandleState::Draining)?;
                    if let Some(link) = &handle.link {
                        link.drain();
                    }
                    None
                }
                HandleState::Draining => None,
                HandleState::Spawning | HandleState::Dead => {
                    return Err(PoolError::WorkspaceBusy {
                        workspace: workspace.to_string(),
                        state: current.to_string(),
                    })
                }
            }
        };

        if let Some((handle_id, link)) = retired {
            info!("Draining worker {} for {}", handle_id, workspace);
            pool_metrics::record_eviction("drain");
            link.shutdown().await;
        }
        Ok(true)
    }

    pub fn stats(&self) -> PoolStats {
        self.shared
            .state
            .lock()
            .stats(self.shared.config.max_concurrent_workers)
    }

    /// Snapshot of every live handle
    pub fn handles(&self) -> Vec<HandleSnapshot> {
        let state = self.shared.state.lock();
        state
            .handles
            .values()
            .chain(state.retiring.values())
            .map(WorkerHandle::snapshot)
            .collect()
    }

    /// Stop accepting work, stop every worker and wait for them to exit.
    ///
    /// Running queries are cancelled. Safe to call more than once.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let links = {
            let mut state = shared.state.lock();
            if !state.closed {
                info!("Shutting down worker pool {}", shared.pool_id);
            }
            state.closed = true;

            let keys: Vec<WorkspaceKey> = state.handles.keys().cloned().collect();
            let mut links = Vec::new();
            for key in keys {
                let Some(handle) = state.handles.get_mut(&key) else {
                    continue;
                };
                let current = handle.state;
                match current {
                    HandleState::Ready => {
                        if let Some((_, link)) = state.retire_ready(&key) {
                            links.push(link);
                        }
                    }
                    HandleState::Busy => {
                        if handle.transition(HandleState::Draining).is_ok() {
                            if let (Some(link), Some(request_id)) =
                                (&handle.link, &handle.active_query)
                            {
                                link.cancel(request_id);
                                link.drain();
                            }
                        }
                    }
                    HandleState::Spawning | HandleState::Draining | HandleState::Dead => {}
                }
            }
            links
        };

        shared.stop.cancel();
        futures::future::join_all(links.iter().map(|link| link.shutdown())).await;

        shared.tasks.close();
        shared.tasks.wait().await;
        shared.processes.cleanup();
        pool_metrics::set_live_handles(shared.state.lock().live_count());
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}

impl PoolShared {
    /// Fast path: take the workspace's ready handle, or report why not
    fn claim(
        self: &Arc<Self>,
        state: &mut PoolState,
        workspace: &WorkspaceKey,
    ) -> Result<Option<AcquiredWorker>> {
        if state.closed {
            return Err(PoolError::PoolClosed);
        }
        let Some(handle) = state.handles.get_mut(workspace) else {
            return Ok(None);
        };

        let link = match (handle.state, &handle.link) {
            (HandleState::Ready, Some(link)) if !link.is_closed() => link.clone(),
            (current, _) => {
                let current = match current {
                    // Supervisor exited; the handle is about to be removed
                    HandleState::Ready => HandleState::Draining,
                    other => other,
                };
                return Err(PoolError::WorkspaceBusy {
                    workspace: workspace.to_string(),
                    state: current.to_string(),
                });
            }
        };

        let request_id = RequestId::new();
        handle.mark_busy(request_id.clone())?;

        Ok(Some(AcquiredWorker {
            handle_id: handle.id,
            workspace: workspace.clone(),
            request_id,
            pid: handle.pid,
            link,
            pool: Arc::downgrade(self),
            armed: true,
        }))
    }

    fn reserve(
        &self,
        state: &mut PoolState,
        handle_id: HandleId,
        workspace: &WorkspaceKey,
        identity: &Identity,
    ) {
        state.handles.insert(
            workspace.clone(),
            WorkerHandle::reserve(handle_id, workspace.clone(), identity.clone()),
        );
        pool_metrics::set_live_handles(state.live_count());
    }

    /// Choose a ready handle to evict and move it to `retiring`
    fn pick_victim(&self, state: &mut PoolState) -> Result<(HandleId, WorkspaceKey, WorkerLink)> {
        let candidates: Vec<EvictionCandidate> = state
            .handles
            .values()
            .filter(|h| h.state == HandleState::Ready)
            .map(|h| EvictionCandidate {
                handle_id: h.id,
                workspace: h.workspace.clone(),
                last_used_at: h.last_used_at,
                spawned_at: h.spawned_at,
            })
            .collect();

        let at_capacity = || PoolError::PoolAtCapacity {
            capacity: self.config.max_concurrent_workers,
        };

        let victim = self
            .policy
            .select_victim(&candidates, Instant::now())
            .and_then(|id| candidates.iter().find(|c| c.handle_id == id))
            .ok_or_else(at_capacity)?;

        let (handle_id, link) = state
            .retire_ready(&victim.workspace)
            .ok_or_else(at_capacity)?;
        Ok((handle_id, victim.workspace.clone(), link))
    }

    async fn spawn_reserved(
        self: &Arc<Self>,
        handle_id: HandleId,
        workspace: WorkspaceKey,
        identity: Identity,
    ) -> Result<AcquiredWorker> {
        let launch = SpawnConfig {
            handle_id,
            workspace: workspace.clone(),
            identity,
        };

        let spawned = match self.processes.spawn(&launch).await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.discard_reservation(&workspace, handle_id);
                pool_metrics::record_spawn_failure();
                return Err(e);
            }
        };

        let pid = spawned.pid;
        let version = spawned.ready.version.clone();
        let weak: Weak<PoolShared> = Arc::downgrade(self);
        let registry: Weak<dyn HandleRegistry> = weak;
        let (link, supervisor) =
            Supervisor::new(spawned, handle_id, workspace.clone(), self.settings, registry);
        self.tasks.spawn(supervisor.run());

        let claimed = {
            let mut state = self.state.lock();
            let owned = state
                .handles
                .get(&workspace)
                .map_or(false, |h| h.id == handle_id);
            if !owned {
                Err(PoolError::PoolClosed)
            } else if state.closed {
                if let Some(mut handle) = state.handles.remove(&workspace) {
                    handle.mark_dead();
                }
                Err(PoolError::PoolClosed)
            } else {
                match state.handles.get_mut(&workspace) {
                    Some(handle) => {
                        let request_id = RequestId::new();
                        handle
                            .attach(pid, link.clone())
                            .and_then(|_| handle.mark_busy(request_id.clone()))
                            .map(|_| request_id)
                    }
                    None => Err(PoolError::PoolClosed),
                }
            }
        };

        match claimed {
            Ok(request_id) => {
                pool_metrics::record_spawn();
                info!(
                    "Worker {} for {} is up (pid {}, version {})",
                    handle_id,
                    workspace,
                    pid,
                    version.as_deref().unwrap_or("unknown")
                );
                Ok(AcquiredWorker {
                    handle_id,
                    workspace,
                    request_id,
                    pid: Some(pid),
                    link,
                    pool: Arc::downgrade(self),
                    armed: true,
                })
            }
            Err(e) => {
                link.shutdown().await;
                Err(e)
            }
        }
    }

    /// Drop a `spawning` reservation that will never be attached
    fn discard_reservation(&self, workspace: &WorkspaceKey, handle_id: HandleId) {
        let mut state = self.state.lock();
        let owned = state
            .handles
            .get(workspace)
            .map_or(false, |h| h.id == handle_id && h.state == HandleState::Spawning);
        if owned {
            if let Some(mut handle) = state.handles.remove(workspace) {
                handle.mark_dead();
            }
        }
        pool_metrics::set_live_handles(state.live_count());
        drop(state);
        remove_socket(&self.processes.socket_path(&handle_id));
    }

    /// `busy → ready` for a handle that never ran a query
    fn release_unused(&self, workspace: &WorkspaceKey, handle_id: HandleId) {
        let mut state = self.state.lock();
        let Some(handle) = state.handles.get_mut(workspace) else {
            return;
        };
        if handle.id != handle_id {
            return;
        }
        match handle.state {
            HandleState::Busy => {
                if handle.transition(HandleState::Ready).is_ok() {
                    handle.active_query = None;
                    handle.last_used_at = Instant::now();
                }
            }
            HandleState::Draining => {
                if let Some(link) = &handle.link {
                    link.drain();
                }
            }
            _ => {}
        }
    }

    async fn evict_idle(&self) -> usize {
        let Some(threshold) = self.config.idle_eviction_threshold() else {
            return 0;
        };

        let retired: Vec<(HandleId, WorkspaceKey, WorkerLink)> = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let idle: Vec<WorkspaceKey> = state
                .handles
                .values()
                .filter(|h| {
                    h.state == HandleState::Ready
                        && now.saturating_duration_since(h.last_used_at) > threshold
                })
                .map(|h| h.workspace.clone())
                .collect();

            idle.into_iter()
                .filter_map(|ws| state.retire_ready(&ws).map(|(id, link)| (id, ws, link)))
                .collect()
        };

        for (handle_id, workspace, _) in &retired {
            info!(
                "Retiring worker {} for {} after {:?} idle",
                handle_id, workspace, threshold
            );
            pool_metrics::record_eviction("idle");
        }

        futures::future::join_all(retired.iter().map(|(_, _, link)| link.shutdown())).await;
        retired.len()
    }
}

impl HandleRegistry for PoolShared {
    fn query_finished(&self, workspace: &WorkspaceKey, handle_id: HandleId) -> ReleaseDisposition {
        let mut state = self.state.lock();
        let Some(handle) = state.handles.get_mut(workspace) else {
            return ReleaseDisposition::Retire;
        };
        if handle.id != handle_id {
            return ReleaseDisposition::Retire;
        }
        match handle.state {
            HandleState::Busy => match handle.mark_ready() {
                Ok(()) => ReleaseDisposition::Reuse,
                Err(e) => {
                    warn!("Release of {} failed: {}", handle_id, e);
                    ReleaseDisposition::Retire
                }
            },
            _ => ReleaseDisposition::Retire,
        }
    }

    fn handle_dead(&self, workspace: &WorkspaceKey, handle_id: HandleId, reason: &TerminationReason) {
        let mut state = self.state.lock();
        let owned = state
            .handles
            .get(workspace)
            .map_or(false, |h| h.id == handle_id);
        if owned {
            if let Some(mut handle) = state.handles.remove(workspace) {
                handle.mark_dead();
            }
        }
        state.retire_finished(handle_id);
        debug!(
            "Worker {} for {} removed from pool ({})",
            handle_id, workspace, reason
        );
        pool_metrics::set_live_handles(state.live_count());
    }
}

fn spawn_idle_sweep(shared: &Arc<PoolShared>, threshold: Duration) {
    let period = (threshold / 2).max(Duration::from_millis(10));
    let weak = Arc::downgrade(shared);
    let stop = shared.stop.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(shared) = weak.upgrade() else {
                break;
            };
            let evicted = shared.evict_idle().await;
            if evicted > 0 {
                debug!("Idle sweep retired {} worker(s)", evicted);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::identity::StaticResolver;

    fn pool(dir: &std::path::Path, capacity: usize) -> WorkerPool {
        let mut config = PoolConfig::new(capacity, 0, 500, 0, 100);
        config.runtime_dir = dir.to_path_buf();
        config.worker.program = Some("/nonexistent/worker".into());
        let resolver = StaticResolver::new()
            .with("a", Identity::current(dir))
            .with("b", Identity::current(dir));
        WorkerPool::start(config, Arc::new(resolver)).unwrap()
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 1);

        let err = pool.acquire("a").await.unwrap_err();
        assert!(matches!(err, PoolError::SpawnFailed { .. }));
        assert_eq!(pool.stats().live, 0);

        // The reservation is gone, so the next attempt spawns again
        let err = pool.acquire("b").await.unwrap_err();
        assert!(matches!(err, PoolError::SpawnFailed { .. }));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_workspace_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 1);
        let err = pool.acquire("nope").await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidWorkspace { .. }));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 1);
        pool.shutdown().await;
        pool.shutdown().await;
        assert!(matches!(
            pool.acquire("a").await.unwrap_err(),
            PoolError::PoolClosed
        ));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PoolConfig::new(0, 0, 500, 0, 100);
        config.runtime_dir = dir.path().to_path_buf();
        let result = WorkerPool::start(config, Arc::new(StaticResolver::new()));
        assert!(matches!(result, Err(PoolError::ConfigError(_))));
    }

    #[test]
    fn test_state_stats() {
        let mut state = PoolState::default();
        let identity = Identity::new(1, 1, "/tmp");
        state.handles.insert(
            "a".into(),
            WorkerHandle::reserve(HandleId::new(), "a".into(), identity.clone()),
        );
        let mut draining = WorkerHandle::reserve(HandleId::new(), "b".into(), identity);
        draining.state = HandleState::Draining;
        state.retiring.insert(draining.id, draining);

        let stats = state.stats(4);
        assert_eq!(stats.live, 2);
        assert_eq!(stats.spawning, 1);
        assert_eq!(stats.draining, 1);
        assert_eq!(stats.capacity, 4);
    }

    fn retiring_victim(state: &mut PoolState) -> HandleId {
        let mut victim =
            WorkerHandle::reserve(HandleId::new(), "a".into(), Identity::new(1, 1, "/tmp"));
        victim.state = HandleState::Draining;
        let id = victim.id;
        state.retiring.insert(id, victim);
        state.evicting.insert(id);
        id
    }

    #[test]
    fn test_evicted_slot_held_after_victim_exits() {
        let mut state = PoolState::default();
        let victim = retiring_victim(&mut state);
        assert_eq!(state.live_count(), 1);

        state.retire_finished(victim);
        assert!(state.retiring.is_empty());
        assert_eq!(state.live_count(), 1);

        state.take_evicted_slot(victim);
        assert_eq!(state.live_count(), 0);
        assert_eq!(state.held_slots, 0);
    }

    #[test]
    fn test_dropped_evicted_slot_returns_capacity() {
        let state = Mutex::new(PoolState::default());
        let victim = retiring_victim(&mut state.lock());

        drop(EvictedSlot::new(&state, victim));
        // Still counted until the victim is gone, then freed for anyone
        assert_eq!(state.lock().live_count(), 1);
        state.lock().retire_finished(victim);
        assert_eq!(state.lock().live_count(), 0);

        let victim = retiring_victim(&mut state.lock());
        state.lock().retire_finished(victim);
        drop(EvictedSlot::new(&state, victim));
        assert_eq!(state.lock().live_count(), 0);
    }
}
