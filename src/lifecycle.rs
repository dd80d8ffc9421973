//! Worker lifecycle: creating workers and retiring them.
//!
//! The dispatcher only ever talks to a [`Spawner`]. Two are provided:
//!
//! * [`ProcessSpawner`] re-executes a program (normally this binary) in
//!   worker mode. The child inherits the listening socket and its end of
//!   the signal channel across `exec`.
//! * [`TaskSpawner`] runs the same worker loop as a task inside the
//!   dispatcher's runtime. Commands still run in their own process per
//!   request.

use crate::config::CgiConfig;
use crate::error::SpawnError;
use crate::registry::{WorkerId, WorkerRecord};
use crate::worker::{self, RequestHandler};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Subcommand that puts the binary into worker mode
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Handle used to stop a worker
pub enum WorkerHandle {
    /// Worker running as a separate OS process
    Process(Child),
    /// Worker running as a task in this process
    Task(JoinHandle<()>),
}

/// Everything the dispatcher needs from a freshly started worker
pub struct SpawnedWorker {
    pub pid: Option<u32>,
    /// Parent end of the signal channel
    pub channel: UnixStream,
    pub handle: WorkerHandle,
}

/// Capability to start a worker that shares the dispatcher's listener
pub trait Spawner: Send + Sync {
    fn spawn(&self, id: WorkerId) -> Result<SpawnedWorker, SpawnError>;
}

/// Start a worker and wrap it in a fresh registry record
pub fn spawn_worker(
    spawner: &dyn Spawner,
    id: WorkerId,
    ceiling: u64,
) -> Result<WorkerRecord, SpawnError> {
    let spawned = spawner.spawn(id)?;
    info!(worker = %id, pid = ?spawned.pid, ceiling, "Starting worker");
    Ok(WorkerRecord::new(
        id,
        spawned.pid,
        spawned.channel,
        spawned.handle,
        ceiling,
    ))
}

/// Stop a worker: SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Task workers are aborted.
pub async fn stop_worker(id: WorkerId, handle: WorkerHandle, grace: Duration) {
    match handle {
        WorkerHandle::Process(mut child) => {
            if let Some(pid) = child.id() {
                debug!(worker = %id, pid, "Sending SIGTERM to worker");
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }

            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(worker = %id, ?status, "Worker process exited");
                }
                Ok(Err(e)) => {
                    warn!(worker = %id, error = %e, "Error waiting for worker to exit");
                }
                Err(_) => {
                    warn!(
                        worker = %id,
                        grace_period_secs = grace.as_secs(),
                        "Grace period exceeded, sending SIGKILL"
                    );
                    let _ = child.kill().await;
                }
            }
        }
        WorkerHandle::Task(task) => {
            task.abort();
            let _ = task.await;
        }
    }
}

/// Stop a worker in the background so the caller is not held up by the grace period
pub fn retire(id: WorkerId, handle: WorkerHandle, grace: Duration) {
    tokio::spawn(stop_worker(id, handle, grace));
}

/// Starts workers as separate processes running `<program> worker ...`.
///
/// The worker reads the `[cgi]` table, encoded as TOML, from its stdin.
pub struct ProcessSpawner {
    program: PathBuf,
    listener: std::net::TcpListener,
    encoded_cgi: String,
}

impl ProcessSpawner {
    /// `listener` is duplicated; the caller keeps its own copy.
    pub fn new(
        program: PathBuf,
        listener: &std::net::TcpListener,
        cgi: &CgiConfig,
    ) -> Result<Self, SpawnError> {
        let listener = listener.try_clone().map_err(SpawnError::Listener)?;
        let encoded_cgi = toml::to_string(cgi)?;
        Ok(Self {
            program,
            listener,
            encoded_cgi,
        })
    }

    /// Spawn workers from the currently running executable
    pub fn current_exe(
        listener: &std::net::TcpListener,
        cgi: &CgiConfig,
    ) -> Result<Self, SpawnError> {
        let program = std::env::current_exe().map_err(|source| SpawnError::Process {
            program: PathBuf::from("<current executable>"),
            source,
        })?;
        Self::new(program, listener, cgi)
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, id: WorkerId) -> Result<SpawnedWorker, SpawnError> {
        let (parent, child_end) =
            std::os::unix::net::UnixStream::pair().map_err(SpawnError::Channel)?;
        let listen_fd = self.listener.as_raw_fd();
        let channel_fd = child_end.as_raw_fd();

        let mut cmd = Command::new(&self.program);
        cmd.arg(WORKER_SUBCOMMAND)
            .arg("--listen-fd")
            .arg(listen_fd.to_string())
            .arg("--channel-fd")
            .arg(channel_fd.to_string());
        // `[cgi]` is written to stdin once the child is up
        cmd.stdin(Stdio::piped());
        cmd.kill_on_drop(true);

        // SAFETY: only async-signal-safe fcntl calls run between fork and exec
        unsafe {
            cmd.pre_exec(move || {
                inherit_descriptor(listen_fd)?;
                inherit_descriptor(channel_fd)
            });
        }

        let mut child = cmd.spawn().map_err(|source| SpawnError::Process {
            program: self.program.clone(),
            source,
        })?;
        // The worker owns its end now
        drop(child_end);

        if let Some(mut stdin) = child.stdin.take() {
            let encoded = self.encoded_cgi.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(encoded.as_bytes()).await {
                    warn!(worker = %id, error = %e, "Failed to send configuration to worker");
                }
            });
        }

        parent.set_nonblocking(true).map_err(SpawnError::Channel)?;
        let channel = UnixStream::from_std(parent).map_err(SpawnError::Channel)?;

        debug!(worker = %id, pid = ?child.id(), program = %self.program.display(), "Worker process spawned");
        Ok(SpawnedWorker {
            pid: child.id(),
            channel,
            handle: WorkerHandle::Process(child),
        })
    }
}

/// Clear `FD_CLOEXEC` so `fd` survives exec
fn inherit_descriptor(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Starts workers as tasks on the current runtime
pub struct TaskSpawner {
    listener: Arc<TcpListener>,
    handler: Arc<RequestHandler>,
}

impl TaskSpawner {
    /// `listener` is duplicated; must be called inside a runtime.
    pub fn new(
        listener: &std::net::TcpListener,
        handler: RequestHandler,
    ) -> Result<Self, SpawnError> {
        let listener = listener.try_clone().map_err(SpawnError::Listener)?;
        listener.set_nonblocking(true).map_err(SpawnError::Listener)?;
        let listener = TcpListener::from_std(listener).map_err(SpawnError::Listener)?;
        Ok(Self {
            listener: Arc::new(listener),
            handler: Arc::new(handler),
        })
    }
}

impl Spawner for TaskSpawner {
    fn spawn(&self, id: WorkerId) -> Result<SpawnedWorker, SpawnError> {
        let (parent, child_end) = UnixStream::pair().map_err(SpawnError::Channel)?;
        let listener = Arc::clone(&self.listener);
        let handler = Arc::clone(&self.handler);

        let task = tokio::spawn(async move {
            if let Err(e) = worker::serve(&listener, child_end, &handler).await {
                warn!(worker = %id, error = %e, "Worker task stopped");
            }
        });

        Ok(SpawnedWorker {
            pid: None,
            channel: parent,
            handle: WorkerHandle::Task(task),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, Signal};
    use crate::registry::WorkerState;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn bound_listener() -> std::net::TcpListener {
        std::net::TcpListener::bind("127.0.0.1:0").unwrap()
    }

    #[tokio::test]
    async fn test_spawn_worker_starts_fresh_record() {
        let listener = bound_listener();
        let handler = RequestHandler::from_config(&CgiConfig::shell("echo hi")).unwrap();
        let spawner = TaskSpawner::new(&listener, handler).unwrap();

        let record = spawn_worker(&spawner, WorkerId(9), 3).unwrap();
        assert_eq!(record.id(), WorkerId(9));
        assert_eq!(record.state(), WorkerState::Free);
        assert_eq!(record.served(), 0);
        assert_eq!(record.ceiling(), 3);
        assert!(record.pid().is_none());

        stop_worker(record.id(), record.into_handle(), Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_task_worker_serves_shared_listener() {
        let listener = bound_listener();
        let addr = listener.local_addr().unwrap();
        let handler = RequestHandler::from_config(&CgiConfig::shell("echo task")).unwrap();
        let spawner = TaskSpawner::new(&listener, handler).unwrap();
        let mut spawned = spawner.spawn(WorkerId(1)).unwrap();

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            response
        });

        protocol::send(&mut spawned.channel, Signal::Dispatch).await.unwrap();
        protocol::expect(&mut spawned.channel, Signal::Accepted).await.unwrap();
        protocol::expect(&mut spawned.channel, Signal::Finished).await.unwrap();
        assert!(client.await.unwrap().ends_with("\r\n\r\ntask\n"));

        stop_worker(WorkerId(1), spawned.handle, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stop_process_worker() {
        let child = Command::new("sleep")
            .arg("60")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let started = std::time::Instant::now();

        stop_worker(WorkerId(1), WorkerHandle::Process(child), Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(5), "SIGTERM should end sleep");
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 60")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        // let the shell install its trap
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        stop_worker(WorkerId(1), WorkerHandle::Process(child), Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_process_spawner_reports_missing_program() {
        let listener = bound_listener();
        let spawner = ProcessSpawner::new(
            PathBuf::from("/nonexistent/cgi-prefork"),
            &listener,
            &CgiConfig::shell("echo hi"),
        )
        .unwrap();

        let err = spawner.spawn(WorkerId(1)).err().unwrap();
        assert!(matches!(err, SpawnError::Process { .. }));
        assert!(err.to_string().contains("/nonexistent/cgi-prefork"));
    }

    #[tokio::test]
    async fn test_command_settings_stay_off_the_command_line() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("fake-worker");
        let script = format!(
            "#!/bin/sh\necho \"$@\" > {0}/args\ncat > {0}/stdin\n",
            dir.path().display()
        );
        std::fs::write(&program, script).unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut cgi = CgiConfig::shell("echo hi");
        cgi.env.insert("API_TOKEN".to_string(), "s3cret-value".to_string());
        let listener = bound_listener();
        let spawner = ProcessSpawner::new(program, &listener, &cgi).unwrap();

        // A freshly written script can briefly be busy while another test forks
        let mut spawned = None;
        for _ in 0..10 {
            match spawner.spawn(WorkerId(1)) {
                Ok(worker) => {
                    spawned = Some(worker);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
        let WorkerHandle::Process(mut child) = spawned.unwrap().handle else {
            panic!("expected a process worker");
        };
        tokio::time::timeout(Duration::from_secs(10), child.wait())
            .await
            .unwrap()
            .unwrap();

        let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
        assert!(args.starts_with("worker --listen-fd"));
        assert!(!args.contains("s3cret-value"));

        let stdin = std::fs::read_to_string(dir.path().join("stdin")).unwrap();
        let received: CgiConfig = toml::from_str(&stdin).unwrap();
        assert_eq!(received, cgi);
    }

    #[test]
    fn test_inherit_descriptor_rejects_closed_fd() {
        assert!(inherit_descriptor(-1).is_err());
    }
}
