// src/worker/mod.rs
//! Worker-side runtime
//!
//! This is what runs inside a spawned worker process:
//!
//! 1. Verify the process runs as the identity the pool asked for
//! 2. Connect to the pool's socket and send `ready`
//! 3. Serve frames: one query at a time, `cancel`, `healthcheck`, `shutdown`
//!
//! The work itself is delegated to a [`QueryHandler`].

pub mod handler;
pub mod scripted;

pub use handler::{EventSink, HandlerError, QueryHandler};
pub use scripted::{Script, ScriptedHandler};

use crate::protocol::{Decoded, Frame, FrameCodec, ReadyPayload, RequestId};
use crate::utils::errors::{PoolError, Result};
use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Command-line options of the worker entry point
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Pool socket to connect to
    pub socket: PathBuf,

    /// Handle id assigned by the pool, for logging
    pub handle_id: String,

    /// Identity the pool expects this process to run as
    pub uid: u32,
    pub gid: u32,

    pub max_frame_bytes: usize,

    /// Connect but never send `ready`
    pub stall_before_ready: bool,

    /// Wait this long before sending `ready`
    pub ready_delay: Option<Duration>,

    /// Never answer `healthcheck` probes
    pub ignore_healthchecks: bool,
}

/// Ids the process actually runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcessIds {
    real: (u32, u32),
    effective: (u32, u32),
    saved: (u32, u32),
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn process_ids() -> Result<ProcessIds> {
    let uids = nix::unistd::getresuid().map_err(std::io::Error::from)?;
    let gids = nix::unistd::getresgid().map_err(std::io::Error::from)?;
    Ok(ProcessIds {
        real: (uids.real.as_raw(), gids.real.as_raw()),
        effective: (uids.effective.as_raw(), gids.effective.as_raw()),
        saved: (uids.saved.as_raw(), gids.saved.as_raw()),
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn process_ids() -> Result<ProcessIds> {
    use nix::unistd::{getegid, geteuid, getgid, getuid};
    let effective = (geteuid().as_raw(), getegid().as_raw());
    Ok(ProcessIds {
        real: (getuid().as_raw(), getgid().as_raw()),
        effective,
        saved: effective,
    })
}

/// Real, effective and saved ids must all equal the target
fn verify_identity(ids: ProcessIds, uid: u32, gid: u32) -> Result<()> {
    let target = (uid, gid);
    for actual in [ids.real, ids.effective, ids.saved] {
        if actual != target {
            return Err(PoolError::IdentityMismatch {
                expected_uid: uid,
                expected_gid: gid,
                actual_uid: actual.0,
                actual_gid: actual.1,
            });
        }
    }
    Ok(())
}

fn ready_payload(ids: ProcessIds) -> ReadyPayload {
    ReadyPayload {
        pid: std::process::id(),
        uid: ids.effective.0,
        gid: ids.effective.1,
        cwd: std::env::current_dir()
            .ok()
            .map(|p| p.display().to_string()),
        version: Some(crate::VERSION.to_string()),
    }
}

struct RunningQuery {
    request_id: RequestId,
    cancel: CancellationToken,
}

/// Run the worker until the pool sends `shutdown` or closes the socket
pub async fn run_worker<H: QueryHandler>(options: WorkerOptions, handler: H) -> Result<()> {
    let identity = process_ids().and_then(|ids| {
        verify_identity(ids, options.uid, options.gid)?;
        Ok(ids)
    });

    let stream = UnixStream::connect(&options.socket).await?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        FrameCodec::with_max_frame_bytes(options.max_frame_bytes),
    );
    let mut writer = FramedWrite::new(
        write_half,
        FrameCodec::with_max_frame_bytes(options.max_frame_bytes),
    );

    let ids = match identity {
        Ok(ids) => ids,
        Err(e) => {
            warn!("Worker {} refusing to start: {}", options.handle_id, e);
            writer
                .send(Frame::error(None, e.kind(), e.to_string()))
                .await?;
            return Err(e);
        }
    };

    if options.stall_before_ready {
        debug!("Worker {} stalling before ready", options.handle_id);
        while reader.next().await.is_some() {}
        return Ok(());
    }
    if let Some(delay) = options.ready_delay {
        tokio::time::sleep(delay).await;
    }

    writer.send(Frame::ready(ready_payload(ids))).await?;
    info!(
        "Worker {} ready (pid {}, uid {}, gid {})",
        options.handle_id,
        std::process::id(),
        ids.effective.0,
        ids.effective.1
    );

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let write_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            writer.send(frame).await?;
        }
        Ok::<_, PoolError>(())
    });

    let handler = Arc::new(handler);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<RequestId>();
    let mut running: Option<RunningQuery> = None;

    loop {
        tokio::select! {
            inbound = reader.next() => match inbound {
                Some(Ok(Decoded::Frame(frame))) => match frame {
                    Frame::Query { request_id, payload } => {
                        if running.is_some() {
                            let _ = out_tx.send(Frame::error(
                                Some(request_id),
                                "busy",
                                "worker is already running a query",
                            ));
                            continue;
                        }
                        let cancel = CancellationToken::new();
                        running = Some(RunningQuery {
                            request_id: request_id.clone(),
                            cancel: cancel.clone(),
                        });
                        spawn_query(
                            handler.clone(),
                            request_id,
                            payload.input,
                            cancel,
                            out_tx.clone(),
                            done_tx.clone(),
                        );
                    }
                    Frame::Cancel { request_id } => match &running {
                        Some(query) if query.request_id == request_id => {
                            debug!("Cancel requested for {}", request_id);
                            query.cancel.cancel();
                        }
                        _ => debug!("Cancel for inactive request {}", request_id),
                    },
                    Frame::Healthcheck { payload } => {
                        if !options.ignore_healthchecks {
                            let _ = out_tx.send(Frame::healthcheck(payload.seq));
                        }
                    }
                    Frame::Shutdown => {
                        info!("Worker {} shutting down", options.handle_id);
                        break;
                    }
                    Frame::Unknown => {}
                    other => warn!("Unexpected {} frame from pool", other.kind()),
                },
                Some(Ok(Decoded::Malformed(e))) => warn!("Malformed frame from pool: {}", e),
                Some(Err(e)) => {
                    warn!("Transport error: {}", e);
                    break;
                }
                None => {
                    debug!("Pool closed the connection");
                    break;
                }
            },
            Some(request_id) = done_rx.recv() => {
                if running.as_ref().map_or(false, |q| q.request_id == request_id) {
                    running = None;
                }
            }
        }
    }

    if let Some(query) = running.take() {
        query.cancel.cancel();
    }
    drop(out_tx);
    drop(done_tx);
    match tokio::time::timeout(Duration::from_secs(1), write_task).await {
        Ok(Ok(result)) => result,
        _ => Ok(()),
    }
}

fn spawn_query<H: QueryHandler>(
    handler: Arc<H>,
    request_id: RequestId,
    input: serde_json::Value,
    cancel: CancellationToken,
    out: mpsc::UnboundedSender<Frame>,
    done: mpsc::UnboundedSender<RequestId>,
) {
    tokio::spawn(async move {
        let sink = EventSink::new(request_id.clone(), out.clone());
        let frame = match handler.handle(input, sink, cancel).await {
            Ok(result) => Frame::complete(request_id.clone(), result),
            Err(e) => Frame::error(Some(request_id.clone()), e.code, e.message),
        };
        let _ = out.send(frame);
        let _ = done.send(request_id);
    });
}
