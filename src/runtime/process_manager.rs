// src/runtime/process_manager.rs
//! Process manager for spawning worker processes
//!
//! Each worker gets its own Unix socket at `<runtime_dir>/<pool_id>/<handle_id>.sock`.
//! The parent binds it, spawns the worker with the tenant's uid/gid and
//! working directory, then waits for the worker to connect and send `ready`.
//!
//! Between fork and exec the child:
//! - Sets `PR_SET_NO_NEW_PRIVS` and `PR_SET_PDEATHSIG(SIGKILL)` (Linux)
//! - Applies the configured rlimits
//!
//! The environment is cleared except for an explicit passthrough list.

use crate::protocol::{Decoded, Frame, FrameCodec, ReadyPayload};
use crate::runtime::identity::Identity;
use crate::runtime::resource_limiter::ResourceLimits;
use crate::runtime::termination::TerminationReason;
use crate::runtime::worker_handle::{HandleId, WorkspaceKey};
use crate::utils::config::{PoolConfig, WorkerCommand};
use crate::utils::errors::{PoolError, Result};
use futures::StreamExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

pub(crate) type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;
pub(crate) type FrameWriter = FramedWrite<OwnedWriteHalf, FrameCodec>;

const WORKER_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// `sun_path` is 108 bytes on Linux, including the NUL
const MAX_SOCKET_PATH: usize = 107;

/// Everything needed to start one worker
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub handle_id: HandleId,
    pub workspace: WorkspaceKey,
    pub identity: Identity,
}

/// A worker that connected and sent `ready`
pub struct SpawnedWorker {
    pub(crate) child: Child,
    pub(crate) pid: u32,
    pub(crate) reader: FrameReader,
    pub(crate) writer: FrameWriter,
    pub(crate) socket_path: PathBuf,
    pub(crate) ready: ReadyPayload,
}

impl std::fmt::Debug for SpawnedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedWorker")
            .field("pid", &self.pid)
            .field("socket_path", &self.socket_path)
            .field("ready", &self.ready)
            .finish()
    }
}

/// Spawns workers for one pool
#[derive(Debug)]
pub struct ProcessManager {
    /// `<runtime_dir>/<pool_id>`
    socket_dir: PathBuf,

    worker: WorkerCommand,
    limits: ResourceLimits,
    spawn_timeout: Duration,
    max_frame_bytes: usize,
}

impl ProcessManager {
    /// Create a process manager and its socket directory
    pub fn new(pool_id: &str, config: &PoolConfig) -> Result<Self> {
        let socket_dir = config.runtime_dir.join(pool_id);
        std::fs::create_dir_all(&socket_dir)?;
        // Workers running as other users must be able to traverse to their socket
        std::fs::set_permissions(&socket_dir, std::fs::Permissions::from_mode(0o711))?;

        debug!("Worker sockets in {:?}", socket_dir);

        Ok(Self {
            socket_dir,
            worker: config.worker.clone(),
            limits: config.limits,
            spawn_timeout: config.spawn_timeout(),
            max_frame_bytes: config.max_frame_bytes,
        })
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    pub fn socket_path(&self, handle_id: &HandleId) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", handle_id))
    }

    /// Spawn a worker and wait for its `ready` frame.
    ///
    /// On any failure the child is killed and the socket file removed.
    pub async fn spawn(&self, launch: &SpawnConfig) -> Result<SpawnedWorker> {
        let socket_path = self.socket_path(&launch.handle_id);
        let listener = self
            .bind(&socket_path, &launch.identity)
            .map_err(|e| spawn_failed(&launch.workspace, format!("socket setup: {}", e)))?;

        let mut command = match self.build_command(launch, &socket_path) {
            Ok(command) => command,
            Err(e) => {
                remove_socket(&socket_path);
                return Err(spawn_failed(&launch.workspace, e.to_string()));
            }
        };

        debug!(
            "Spawning worker {} for {} as uid={} gid={} in {:?}",
            launch.handle_id, launch.workspace, launch.identity.uid, launch.identity.gid, launch.identity.cwd
        );

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                remove_socket(&socket_path);
                return Err(spawn_failed(
                    &launch.workspace,
                    format!("failed to start worker process: {}", e),
                ));
            }
        };
        let pid = child.id().unwrap_or_default();

        let handshake = async {
            let (stream, _) = listener.accept().await?;
            let (read, write) = stream.into_split();
            let mut reader =
                FramedRead::new(read, FrameCodec::with_max_frame_bytes(self.max_frame_bytes));
            let ready = await_ready(&mut reader).await?;
            let writer =
                FramedWrite::new(write, FrameCodec::with_max_frame_bytes(self.max_frame_bytes));
            Ok::<_, PoolError>((reader, writer, ready))
        };

        let outcome = tokio::select! {
            result = tokio::time::timeout(self.spawn_timeout, handshake) => match result {
                Ok(Ok(parts)) => Ok(parts),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "worker did not become ready within {}ms",
                    self.spawn_timeout.as_millis()
                )),
            },
            status = child.wait() => Err(match status {
                Ok(status) => format!(
                    "worker {} during startup",
                    TerminationReason::from_status(status, false)
                ),
                Err(e) => format!("failed to wait on worker: {}", e),
            }),
        };
        drop(listener);

        let verified = outcome.and_then(|(reader, writer, ready)| {
            verify_ready(&launch.identity, pid, &ready)
                .map(|_| (reader, writer, ready))
                .map_err(|e| e.to_string())
        });

        match verified {
            Ok((reader, writer, ready)) => {
                info!(
                    "Worker {} ready for {} (pid {}, uid {}, gid {})",
                    launch.handle_id, launch.workspace, pid, ready.uid, ready.gid
                );
                Ok(SpawnedWorker {
                    child,
                    pid,
                    reader,
                    writer,
                    socket_path,
                    ready,
                })
            }
            Err(reason) => {
                warn!(
                    "Spawn of worker {} for {} failed: {}",
                    launch.handle_id, launch.workspace, reason
                );
                let _ = child.start_kill();
                let _ = child.wait().await;
                remove_socket(&socket_path);
                Err(spawn_failed(&launch.workspace, reason))
            }
        }
    }

    fn bind(&self, socket_path: &Path, identity: &Identity) -> std::io::Result<UnixListener> {
        let len = socket_path.as_os_str().len();
        if len > MAX_SOCKET_PATH {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("socket path is {} bytes, limit is {}", len, MAX_SOCKET_PATH),
            ));
        }

        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;

        if identity.requires_switch() {
            nix::unistd::chown(
                socket_path,
                Some(nix::unistd::Uid::from_raw(identity.uid)),
                Some(nix::unistd::Gid::from_raw(identity.gid)),
            )
            .map_err(std::io::Error::from)?;
        }

        Ok(listener)
    }

    fn build_command(&self, launch: &SpawnConfig, socket_path: &Path) -> Result<Command> {
        let program = self.worker.resolve_program()?;
        let identity = &launch.identity;

        let mut command = Command::new(&program);
        command
            .args(&self.worker.args)
            .arg("--socket")
            .arg(socket_path)
            .arg("--handle-id")
            .arg(launch.handle_id.to_string())
            .arg("--uid")
            .arg(identity.uid.to_string())
            .arg("--gid")
            .arg(identity.gid.to_string())
            .arg("--max-frame-bytes")
            .arg(self.max_frame_bytes.to_string())
            .current_dir(&identity.cwd)
            .env_clear()
            .env("PATH", WORKER_PATH)
            .env("HOME", &identity.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        for key in &self.worker.env_passthrough {
            if let Some(value) = std::env::var_os(key) {
                command.env(key, value);
            }
        }

        if identity.requires_switch() {
            // std drops supplementary groups when uid is set
            command.gid(identity.gid);
            command.uid(identity.uid);
        }

        let limits = self.limits;
        // SAFETY: runs in the forked child before exec and only issues
        // async-signal-safe syscalls (prctl, setrlimit).
        unsafe {
            command.pre_exec(move || {
                harden_child()?;
                limits.apply_to_current_process()
            });
        }

        Ok(command)
    }

    /// Remove the pool's socket directory
    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.socket_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove socket dir {:?}: {}", self.socket_dir, e);
            }
        }
    }
}

/// Read frames until `ready`; anything else first is a handshake failure
async fn await_ready(reader: &mut FrameReader) -> Result<ReadyPayload> {
    loop {
        match reader.next().await {
            Some(Ok(Decoded::Frame(Frame::Ready { payload }))) => return Ok(payload),
            Some(Ok(Decoded::Frame(Frame::Error { payload, .. }))) => {
                return Err(PoolError::Protocol(format!(
                    "worker reported [{}] during startup: {}",
                    payload.code, payload.message
                )))
            }
            Some(Ok(Decoded::Frame(Frame::Unknown))) => continue,
            Some(Ok(Decoded::Frame(other))) => {
                return Err(PoolError::Protocol(format!(
                    "expected ready, got {}",
                    other.kind()
                )))
            }
            Some(Ok(Decoded::Malformed(e))) => {
                warn!("Malformed frame during worker startup: {}", e);
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(PoolError::Protocol(
                    "worker closed the connection before ready".to_string(),
                ))
            }
        }
    }
}

/// Check the identity a worker declared against the one it was spawned with
fn verify_ready(identity: &Identity, pid: u32, ready: &ReadyPayload) -> Result<()> {
    if ready.uid != identity.uid || ready.gid != identity.gid {
        return Err(PoolError::IdentityMismatch {
            expected_uid: identity.uid,
            expected_gid: identity.gid,
            actual_uid: ready.uid,
            actual_gid: ready.gid,
        });
    }
    if ready.pid != pid {
        // Wrapper scripts exec into the worker, but some fork instead
        debug!("Worker declared pid {} but spawned pid is {}", ready.pid, pid);
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn harden_child() -> std::io::Result<()> {
    // SAFETY: plain prctl calls with integer arguments.
    unsafe {
        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) == -1 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn harden_child() -> std::io::Result<()> {
    Ok(())
}

/// Best-effort removal of a worker socket file
pub(crate) fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove socket {:?}: {}", path, e);
        }
    }
}

fn spawn_failed(workspace: &WorkspaceKey, reason: impl Into<String>) -> PoolError {
    PoolError::SpawnFailed {
        workspace: workspace.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> PoolConfig {
        let mut config = PoolConfig::new(1, 0, 500, 0, 0);
        config.runtime_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn test_socket_layout() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProcessManager::new("pool1", &config(dir.path())).unwrap();
        let id = HandleId::new();

        let path = manager.socket_path(&id);
        assert_eq!(path.parent().unwrap(), dir.path().join("pool1"));
        assert_eq!(path.file_name().unwrap().to_string_lossy(), format!("{}.sock", id));

        let mode = std::fs::metadata(manager.socket_dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o711);

        manager.cleanup();
        assert!(!manager.socket_dir().exists());
    }

    #[test]
    fn test_verify_ready_rejects_other_identity() {
        let identity = Identity::new(1000, 1000, "/tmp");
        let ready = ReadyPayload {
            pid: 42,
            uid: 0,
            gid: 1000,
            ..Default::default()
        };
        assert!(matches!(
            verify_ready(&identity, 42, &ready),
            Err(PoolError::IdentityMismatch { actual_uid: 0, .. })
        ));

        let ready = ReadyPayload {
            pid: 43,
            uid: 1000,
            gid: 1000,
            ..Default::default()
        };
        assert!(verify_ready(&identity, 42, &ready).is_ok());
    }

    #[tokio::test]
    async fn test_spawn_missing_program_leaves_no_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.worker.program = Some(PathBuf::from("/nonexistent/worker-binary"));
        let manager = ProcessManager::new("pool2", &config).unwrap();

        let launch = SpawnConfig {
            handle_id: HandleId::new(),
            workspace: WorkspaceKey::from("a"),
            identity: Identity::current(dir.path()),
        };
        let err = manager.spawn(&launch).await.unwrap_err();
        assert!(matches!(err, PoolError::SpawnFailed { .. }));
        assert!(!manager.socket_path(&launch.handle_id).exists());
    }

    #[tokio::test]
    async fn test_spawn_unresolvable_program_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.worker.program = Some(PathBuf::new());
        let manager = ProcessManager::new("pool5", &config).unwrap();

        let launch = SpawnConfig {
            handle_id: HandleId::new(),
            workspace: WorkspaceKey::from("a"),
            identity: Identity::current(dir.path()),
        };
        let err = manager.spawn(&launch).await.unwrap_err();
        assert!(matches!(err, PoolError::SpawnFailed { .. }), "{:?}", err);
        assert!(!manager.socket_path(&launch.handle_id).exists());
    }

    #[tokio::test]
    async fn test_spawn_times_out_without_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.spawn_timeout_ms = 200;
        config.worker.program = Some(PathBuf::from("/bin/sh"));
        config.worker.args = vec!["-c".into(), "sleep 30".into(), "worker".into()];
        let manager = ProcessManager::new("pool3", &config).unwrap();

        let launch = SpawnConfig {
            handle_id: HandleId::new(),
            workspace: WorkspaceKey::from("a"),
            identity: Identity::current(dir.path()),
        };
        let started = std::time::Instant::now();
        let err = manager.spawn(&launch).await.unwrap_err();
        assert!(err.to_string().contains("did not become ready"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!manager.socket_path(&launch.handle_id).exists());
    }

    #[tokio::test]
    async fn test_spawn_reports_early_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.spawn_timeout_ms = 5_000;
        config.worker.program = Some(PathBuf::from("/bin/sh"));
        config.worker.args = vec!["-c".into(), "exit 7".into(), "worker".into()];
        let manager = ProcessManager::new("pool4", &config).unwrap();

        let launch = SpawnConfig {
            handle_id: HandleId::new(),
            workspace: WorkspaceKey::from("a"),
            identity: Identity::current(dir.path()),
        };
        let err = manager.spawn(&launch).await.unwrap_err();
        assert!(err.to_string().contains("exited with code 7"), "{}", err);
    }
}
