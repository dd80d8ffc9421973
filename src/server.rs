use crate::config::{Config, WorkerMode};
use crate::dispatch::Dispatcher;
use crate::lifecycle::{ProcessSpawner, TaskSpawner};
use crate::worker::RequestHandler;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

/// Pending connections the kernel holds while every worker is busy
pub const LISTEN_BACKLOG: u32 = 2;

/// Bind `listen` (`host:port`) with `SO_REUSEADDR` and a small backlog.
///
/// The returned listener is non-blocking and not registered with any
/// runtime, so it can be duplicated into workers.
pub async fn bind_listener(listen: &str) -> io::Result<std::net::TcpListener> {
    // IPv4 first: `localhost` often resolves to `::1` before `127.0.0.1`
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(listen).await?.collect();
    let addr = addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} did not resolve to any address", listen),
            )
        })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)?.into_std()
}

/// The dispatcher process: one listener and its worker pool
pub struct Server {
    config: Config,
    listener: std::net::TcpListener,
    worker_program: Option<PathBuf>,
}

impl Server {
    /// Bind the configured address. Must be called inside a runtime.
    pub async fn bind(config: Config) -> anyhow::Result<Self> {
        let listener = bind_listener(&config.server.listen).await.map_err(|e| {
            anyhow::anyhow!("Failed to listen on {}: {}", config.server.listen, e)
        })?;
        Ok(Self {
            config,
            listener,
            worker_program: None,
        })
    }

    /// Re-execute `program` for process workers instead of the current executable
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the pool using the configured worker mode
    pub fn dispatcher(&self) -> anyhow::Result<Dispatcher> {
        let pool = self.config.pool.clone();
        let dispatcher = match pool.mode {
            WorkerMode::Process => {
                let spawner = match &self.worker_program {
                    Some(program) => {
                        ProcessSpawner::new(program.clone(), &self.listener, &self.config.cgi)?
                    }
                    None => ProcessSpawner::current_exe(&self.listener, &self.config.cgi)?,
                };
                Dispatcher::start(&self.listener, spawner, pool)?
            }
            WorkerMode::Task => {
                let handler = RequestHandler::from_config(&self.config.cgi)?;
                let spawner = TaskSpawner::new(&self.listener, handler)?;
                Dispatcher::start(&self.listener, spawner, pool)?
            }
        };
        Ok(dispatcher)
    }

    /// Serve until `shutdown` flips to true, then stop the pool
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut dispatcher = self.dispatcher()?;
        info!(
            addr = %self.local_addr()?,
            workers = self.config.pool.workers,
            max_requests = self.config.pool.max_requests,
            mode = ?self.config.pool.mode,
            "Listening"
        );
        dispatcher.run(shutdown).await?;
        info!("Shutdown complete");
        Ok(())
    }
}

/// Flip the returned receiver to true on SIGINT or SIGTERM.
///
/// Handlers are installed before this returns. Must be called inside a runtime.
pub fn shutdown_on_signal() -> io::Result<watch::Receiver<bool>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
        let _ = shutdown_tx.send(true);
    });

    Ok(shutdown_rx)
}
