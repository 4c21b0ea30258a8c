// src/runtime/supervisor.rs
//! Per-worker supervisor task
//!
//! One task per live worker owns the transport and the child process. Every
//! other part of the pool talks to it through a [`WorkerLink`]. The task:
//! - Routes `message`/`complete`/`error` frames to the active query
//! - Enforces the query deadline and the cancel grace period
//! - Probes liveness with `healthcheck` frames
//! - Detects process exit and reports it back to the pool
//!
//! Pool state is updated (release or retire) before the terminal event is
//! forwarded to the session, so a caller that sees `complete` can immediately
//! acquire the same handle again.

use crate::observability::metrics as pool_metrics;
use crate::protocol::{Decoded, Frame, RequestId};
use crate::runtime::process_manager::{remove_socket, FrameReader, FrameWriter, SpawnedWorker};
use crate::runtime::termination::TerminationReason;
use crate::runtime::worker_handle::{HandleId, WorkspaceKey};
use crate::utils::config::PoolConfig;
use crate::utils::errors::{PoolError, QueryFailure, Result};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Weak;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// After the transport closes, how long to wait for the process to exit on its own
const EXIT_WAIT_AFTER_DISCONNECT: Duration = Duration::from_millis(250);

/// After the process exits, how long to keep reading frames it already wrote
const FLUSH_WAIT_AFTER_EXIT: Duration = Duration::from_millis(50);

/// How a cancel request was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The worker sent a terminal frame within the grace period
    Acked,
    /// The grace period expired and the worker was killed
    ForceKilled,
}

/// Events delivered from the supervisor to a query session
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Message(Value),
    Finished {
        result: std::result::Result<Value, QueryFailure>,
        cancel: Option<CancelOutcome>,
    },
}

#[derive(Debug)]
pub(crate) enum LinkCommand {
    Dispatch {
        request_id: RequestId,
        input: Value,
        timeout: Duration,
        events: mpsc::UnboundedSender<LinkEvent>,
    },
    Cancel {
        request_id: RequestId,
    },
    Drain,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// What the pool does with a handle after its query finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseDisposition {
    Reuse,
    Retire,
}

/// Pool-side callbacks invoked by a supervisor
pub(crate) trait HandleRegistry: Send + Sync {
    /// The active query reached a terminal state; `busy → ready` unless draining
    fn query_finished(&self, workspace: &WorkspaceKey, handle_id: HandleId) -> ReleaseDisposition;

    /// The worker process is gone; the handle must leave the pool
    fn handle_dead(&self, workspace: &WorkspaceKey, handle_id: HandleId, reason: &TerminationReason);
}

/// Timing knobs a supervisor needs
#[derive(Debug, Clone, Copy)]
pub(crate) struct SupervisorSettings {
    pub healthcheck_interval: Option<Duration>,
    pub healthcheck_timeout: Duration,
    pub cancel_grace: Duration,
    pub shutdown_grace: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            healthcheck_interval: config.healthcheck_interval(),
            healthcheck_timeout: config.healthcheck_timeout(),
            cancel_grace: config.cancel_grace(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

/// Channel to a worker's supervisor task
#[derive(Debug, Clone)]
pub struct WorkerLink {
    handle_id: HandleId,
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl WorkerLink {
    pub fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    /// The supervisor task has exited
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub(crate) fn dispatch(
        &self,
        request_id: RequestId,
        input: Value,
        timeout: Duration,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<()> {
        self.commands
            .send(LinkCommand::Dispatch {
                request_id,
                input,
                timeout,
                events,
            })
            .map_err(|_| PoolError::WorkerCrashed {
                handle_id: self.handle_id.to_string(),
                reason: "supervisor is gone".to_string(),
            })
    }

    pub(crate) fn cancel(&self, request_id: &RequestId) {
        let _ = self.commands.send(LinkCommand::Cancel {
            request_id: request_id.clone(),
        });
    }

    /// Shut down once the active query (if any) finishes
    pub(crate) fn drain(&self) {
        let _ = self.commands.send(LinkCommand::Drain);
    }

    /// Stop the worker and wait until it is gone. Idempotent.
    pub(crate) async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(LinkCommand::Shutdown { done }).is_err() {
            return;
        }
        let _ = wait.await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelReason {
    Caller,
    Timeout(Duration),
}

impl CancelReason {
    fn failure(self) -> QueryFailure {
        match self {
            CancelReason::Caller => QueryFailure::Cancelled,
            CancelReason::Timeout(d) => QueryFailure::TimedOut(d),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CancelPhase {
    None,
    Requested { reason: CancelReason, kill_at: Instant },
}

struct ActiveQuery {
    request_id: RequestId,
    events: mpsc::UnboundedSender<LinkEvent>,
    timeout: Duration,
    deadline: Instant,
    started_at: Instant,
    cancel: CancelPhase,
}

#[derive(Default)]
struct HealthProbe {
    seq: u64,
    next_probe_at: Option<Instant>,
    awaiting: Option<(u64, Instant)>,
}

/// Why the event loop stopped
enum Exit {
    /// Pool asked for shutdown
    Shutdown(oneshot::Sender<()>),
    /// Draining handle went idle
    Drained,
    /// Every link was dropped
    Orphaned,
    /// The process exited on its own
    Exited(std::io::Result<ExitStatus>),
    /// Transport failed or healthcheck went unanswered
    Lost(String),
    /// Cancel grace expired
    ForceKilled,
}

pub(crate) struct Supervisor {
    handle_id: HandleId,
    workspace: WorkspaceKey,
    pid: u32,
    child: Child,
    reader: FrameReader,
    writer: FrameWriter,
    socket_path: PathBuf,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    registry: Weak<dyn HandleRegistry>,
    settings: SupervisorSettings,
    active: Option<ActiveQuery>,
    draining: bool,
    health: HealthProbe,
    killed_by_pool: bool,
}

impl Supervisor {
    pub(crate) fn new(
        spawned: SpawnedWorker,
        handle_id: HandleId,
        workspace: WorkspaceKey,
        settings: SupervisorSettings,
        registry: Weak<dyn HandleRegistry>,
    ) -> (WorkerLink, Supervisor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = WorkerLink {
            handle_id,
            commands: tx,
        };

        let health = HealthProbe {
            next_probe_at: settings.healthcheck_interval.map(|i| Instant::now() + i),
            ..Default::default()
        };

        let supervisor = Supervisor {
            handle_id,
            workspace,
            pid: spawned.pid,
            child: spawned.child,
            reader: spawned.reader,
            writer: spawned.writer,
            socket_path: spawned.socket_path,
            commands: rx,
            registry,
            settings,
            active: None,
            draining: false,
            health,
            killed_by_pool: false,
        };

        (link, supervisor)
    }

    /// Drive the worker until it is gone.
    ///
    /// A panic inside the loop drops (and so kills) the child, then the
    /// handle is still reported dead so its slot is not lost.
    pub(crate) async fn run(self) {
        let handle_id = self.handle_id;
        let workspace = self.workspace.clone();
        let registry = self.registry.clone();
        let socket_path = self.socket_path.clone();

        report_panic(self.supervise(), move || {
            error!("Supervisor for worker {} ({}) panicked", handle_id, workspace);
            remove_socket(&socket_path);
            if let Some(registry) = registry.upgrade() {
                registry.handle_dead(&workspace, handle_id, &TerminationReason::Unknown);
            }
        })
        .await;
    }

    async fn supervise(mut self) {
        debug!("Supervisor for worker {} (pid {}) started", self.handle_id, self.pid);
        let exit = self.event_loop().await;
        self.finish(exit).await;
    }

    async fn event_loop(&mut self) -> Exit {
        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(exit) = self.handle_command(command).await {
                            return exit;
                        }
                    }
                    None => return Exit::Orphaned,
                },
                inbound = self.reader.next() => match inbound {
                    Some(Ok(Decoded::Frame(frame))) => {
                        if let Some(exit) = self.handle_frame(frame).await {
                            return exit;
                        }
                    }
                    Some(Ok(Decoded::Malformed(e))) => {
                        warn!("Worker {} sent a malformed frame: {}", self.handle_id, e);
                    }
                    Some(Err(e)) => return Exit::Lost(format!("transport error: {}", e)),
                    None => return Exit::Lost("worker closed its connection".to_string()),
                },
                status = self.child.wait() => {
                    self.flush_pending_frames().await;
                    return Exit::Exited(status);
                }
                _ = sleep_until_opt(deadline) => {
                    if let Some(exit) = self.on_timer().await {
                        return exit;
                    }
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let query = self.active.as_ref().map(|a| match a.cancel {
            CancelPhase::None => a.deadline,
            CancelPhase::Requested { kill_at, .. } => kill_at,
        });
        [
            query,
            self.health.awaiting.map(|(_, at)| at),
            self.health.next_probe_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn handle_command(&mut self, command: LinkCommand) -> Option<Exit> {
        match command {
            LinkCommand::Dispatch {
                request_id,
                input,
                timeout,
                events,
            } => {
                if self.active.is_some() || self.draining {
                    let _ = events.send(LinkEvent::Finished {
                        result: Err(QueryFailure::WorkerCrashed {
                            reason: "worker is not accepting queries".to_string(),
                        }),
                        cancel: None,
                    });
                    return None;
                }

                let now = Instant::now();
                let frame = Frame::query(
                    request_id.clone(),
                    input,
                    Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
                );
                debug!("Dispatching query {} to worker {}", request_id, self.handle_id);
                self.active = Some(ActiveQuery {
                    request_id,
                    events,
                    timeout,
                    deadline: deadline_after(now, timeout),
                    started_at: now,
                    cancel: CancelPhase::None,
                });

                if let Err(e) = self.writer.send(frame).await {
                    return Some(Exit::Lost(format!("failed to send query: {}", e)));
                }
                None
            }
            LinkCommand::Cancel { request_id } => {
                let matches = self
                    .active
                    .as_ref()
                    .map_or(false, |a| a.request_id == request_id);
                if matches {
                    return self.begin_cancel(CancelReason::Caller).await;
                }
                None
            }
            LinkCommand::Drain => {
                self.draining = true;
                self.active.is_none().then_some(Exit::Drained)
            }
            LinkCommand::Shutdown { done } => Some(Exit::Shutdown(done)),
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Option<Exit> {
        match frame {
            Frame::Message {
                request_id,
                payload,
            } => {
                match &self.active {
                    Some(active) if active.request_id == request_id => {
                        if matches!(active.cancel, CancelPhase::None) {
                            let _ = active.events.send(LinkEvent::Message(payload));
                        }
                    }
                    _ => debug!(
                        "Worker {} sent message for inactive request {}",
                        self.handle_id, request_id
                    ),
                }
                None
            }
            Frame::Complete {
                request_id,
                payload,
            } => self.finish_active(&request_id, Ok(payload.result)),
            Frame::Error {
                request_id: Some(request_id),
                payload,
            } => self.finish_active(
                &request_id,
                Err(QueryFailure::Worker {
                    code: payload.code,
                    message: payload.message,
                }),
            ),
            Frame::Error {
                request_id: None,
                payload,
            } => {
                warn!(
                    "Worker {} reported [{}]: {}",
                    self.handle_id, payload.code, payload.message
                );
                None
            }
            Frame::Healthcheck { payload } => {
                if let Some((seq, _)) = self.health.awaiting {
                    if payload.seq == seq {
                        self.health.awaiting = None;
                    }
                }
                None
            }
            Frame::Unknown => {
                debug!("Ignoring unknown frame type from worker {}", self.handle_id);
                None
            }
            other => {
                warn!(
                    "Unexpected {} frame from worker {}",
                    other.kind(),
                    self.handle_id
                );
                None
            }
        }
    }

    fn finish_active(
        &mut self,
        request_id: &RequestId,
        result: std::result::Result<Value, QueryFailure>,
    ) -> Option<Exit> {
        let owned = self
            .active
            .as_ref()
            .map_or(false, |a| &a.request_id == request_id);
        if !owned {
            debug!(
                "Worker {} finished inactive request {}",
                self.handle_id, request_id
            );
            return None;
        }
        let active = self.active.take()?;

        let (result, cancel) = match active.cancel {
            CancelPhase::None => (result, None),
            CancelPhase::Requested { reason, .. } => {
                (Err(reason.failure()), Some(CancelOutcome::Acked))
            }
        };

        let outcome = match &result {
            Ok(_) => "complete",
            Err(failure) => failure.kind(),
        };
        debug!(
            "Query {} on worker {} finished ({}) after {:?}",
            active.request_id,
            self.handle_id,
            outcome,
            active.started_at.elapsed()
        );
        pool_metrics::record_query(outcome);

        let disposition = match self.registry.upgrade() {
            Some(registry) => registry.query_finished(&self.workspace, self.handle_id),
            None => ReleaseDisposition::Retire,
        };
        let _ = active.events.send(LinkEvent::Finished { result, cancel });

        if disposition == ReleaseDisposition::Retire || self.draining {
            return Some(Exit::Drained);
        }
        None
    }

    async fn begin_cancel(&mut self, reason: CancelReason) -> Option<Exit> {
        let grace = self.settings.cancel_grace;
        let active = self.active.as_mut()?;
        if !matches!(active.cancel, CancelPhase::None) {
            return None;
        }
        active.cancel = CancelPhase::Requested {
            reason,
            kill_at: Instant::now() + grace,
        };
        let frame = Frame::cancel(active.request_id.clone());

        debug!(
            "Cancelling query {} on worker {} ({:?}, grace {:?})",
            active.request_id, self.handle_id, reason, grace
        );

        if let Err(e) = self.writer.send(frame).await {
            return Some(Exit::Lost(format!("failed to send cancel: {}", e)));
        }
        None
    }

    async fn on_timer(&mut self) -> Option<Exit> {
        let now = Instant::now();

        if let Some((seq, deadline)) = self.health.awaiting {
            if now >= deadline {
                return Some(Exit::Lost(format!(
                    "healthcheck {} unanswered after {}ms",
                    seq,
                    self.settings.healthcheck_timeout.as_millis()
                )));
            }
        }

        let overdue = self.active.as_ref().and_then(|a| match a.cancel {
            CancelPhase::None if now >= a.deadline => Some(Err(a.timeout)),
            CancelPhase::Requested { kill_at, .. } if now >= kill_at => Some(Ok(())),
            _ => None,
        });
        match overdue {
            Some(Err(timeout)) => {
                warn!(
                    "Query on worker {} exceeded its {:?} deadline",
                    self.handle_id, timeout
                );
                if let Some(exit) = self.begin_cancel(CancelReason::Timeout(timeout)).await {
                    return Some(exit);
                }
            }
            Some(Ok(())) => {
                warn!(
                    "Worker {} did not acknowledge cancel; killing it",
                    self.handle_id
                );
                return Some(Exit::ForceKilled);
            }
            None => {}
        }

        if let (Some(at), Some(interval)) =
            (self.health.next_probe_at, self.settings.healthcheck_interval)
        {
            if now >= at {
                self.health.next_probe_at = Some(now + interval);
                if self.health.awaiting.is_none() {
                    self.health.seq += 1;
                    let seq = self.health.seq;
                    self.health.awaiting = Some((seq, now + self.settings.healthcheck_timeout));
                    if let Err(e) = self.writer.send(Frame::healthcheck(seq)).await {
                        return Some(Exit::Lost(format!("failed to send healthcheck: {}", e)));
                    }
                }
            }
        }

        None
    }

    /// Frames the worker wrote right before exiting are still worth delivering
    async fn flush_pending_frames(&mut self) {
        while let Ok(Some(Ok(decoded))) =
            tokio::time::timeout(FLUSH_WAIT_AFTER_EXIT, self.reader.next()).await
        {
            if let Decoded::Frame(frame) = decoded {
                let _ = self.handle_frame(frame).await;
            }
        }
    }

    async fn graceful_stop(&mut self) -> Option<ExitStatus> {
        let _ = self.writer.send(Frame::Shutdown).await;
        match tokio::time::timeout(self.settings.shutdown_grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!("Failed to wait on worker {}: {}", self.handle_id, e);
                self.kill().await
            }
            Err(_) => {
                warn!(
                    "Worker {} did not exit within {:?} of shutdown; killing it",
                    self.handle_id, self.settings.shutdown_grace
                );
                self.kill().await
            }
        }
    }

    async fn kill(&mut self) -> Option<ExitStatus> {
        self.killed_by_pool = true;
        if let Err(e) = self.child.start_kill() {
            debug!("Kill of worker {} failed: {}", self.handle_id, e);
        }
        self.child.wait().await.ok()
    }

    async fn finish(&mut self, exit: Exit) {
        let mut shutdown_waiters = Vec::new();

        let (status, cause) = match exit {
            Exit::Shutdown(done) => {
                shutdown_waiters.push(done);
                (self.graceful_stop().await, "worker shut down".to_string())
            }
            Exit::Drained | Exit::Orphaned => {
                (self.graceful_stop().await, "worker shut down".to_string())
            }
            Exit::Exited(status) => (status.ok(), "worker exited".to_string()),
            Exit::Lost(reason) => {
                match tokio::time::timeout(EXIT_WAIT_AFTER_DISCONNECT, self.child.wait()).await {
                    Ok(Ok(status)) => (Some(status), reason),
                    _ => (self.kill().await, reason),
                }
            }
            Exit::ForceKilled => (self.kill().await, "cancel grace expired".to_string()),
        };

        let termination = status
            .map(|s| TerminationReason::from_status(s, self.killed_by_pool))
            .unwrap_or(TerminationReason::Unknown);

        let expected = self.active.is_none()
            && (self.killed_by_pool || termination.is_clean_exit());
        if expected {
            info!(
                "Worker {} for {} stopped ({})",
                self.handle_id, self.workspace, termination
            );
        } else {
            warn!(
                "Worker {} for {} lost: {} ({})",
                self.handle_id, self.workspace, cause, termination
            );
            pool_metrics::record_crash(termination.label());
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.handle_dead(&self.workspace, self.handle_id, &termination);
        }
        self.commands.close();
        remove_socket(&self.socket_path);

        if let Some(active) = self.active.take() {
            let (result, cancel) = match active.cancel {
                CancelPhase::Requested { reason, .. } => {
                    (Err(reason.failure()), Some(CancelOutcome::ForceKilled))
                }
                CancelPhase::None => (
                    Err(QueryFailure::WorkerCrashed {
                        reason: format!("{}: {}", cause, termination),
                    }),
                    None,
                ),
            };
            if let Err(failure) = &result {
                pool_metrics::record_query(failure.kind());
            }
            let _ = active.events.send(LinkEvent::Finished { result, cancel });
        }

        while let Ok(command) = self.commands.try_recv() {
            match command {
                LinkCommand::Dispatch { events, .. } => {
                    let _ = events.send(LinkEvent::Finished {
                        result: Err(QueryFailure::WorkerCrashed {
                            reason: format!("{}: {}", cause, termination),
                        }),
                        cancel: None,
                    });
                }
                LinkCommand::Shutdown { done } => shutdown_waiters.push(done),
                LinkCommand::Cancel { .. } | LinkCommand::Drain => {}
            }
        }

        for done in shutdown_waiters {
            let _ = done.send(());
        }
    }
}

/// Run `task`; if it panics, call `on_panic` instead of unwinding further
async fn report_panic<F>(task: F, on_panic: impl FnOnce())
where
    F: std::future::Future<Output = ()>,
{
    if AssertUnwindSafe(task).catch_unwind().await.is_err() {
        on_panic();
    }
}

/// Upper bound for any deadline, roughly thirty years out
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, clamped for timeouts too large to represent
fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
