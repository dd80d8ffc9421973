//! The dispatch loop
//!
//! A single task owns the listening socket, the [`Registry`] and the
//! [`Spawner`]. Each [`Dispatcher::turn`] waits once on the readiness of
//! every worker channel and, while at least one worker is free, the
//! listener:
//!
//! * a ready worker channel is reclaimed first: a `Finished` frees the
//!   worker, and a worker at its request ceiling is retired and replaced;
//! * a ready listener is routed to the first free worker, which must
//!   acknowledge within the ack timeout or be replaced.
//!
//! When every worker is busy the listener is not watched at all, so new
//! connections wait in the kernel backlog until a worker frees up.

use crate::config::PoolConfig;
use crate::error::{DispatchError, ProtocolError};
use crate::lifecycle::{self, Spawner};
use crate::protocol::{self, Signal};
use crate::registry::{Registry, WorkerId, WorkerStatus};
use futures::stream::{FuturesUnordered, StreamExt};
use std::io;
use std::os::unix::io::AsRawFd;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Why a worker left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// Served its configured number of requests
    Ceiling,
    /// Did not acknowledge a dispatch in time
    AckTimeout,
    /// Closed its channel or the channel failed
    Exited,
    /// Sent a signal out of sequence or an unknown tag
    Protocol,
}

/// What one turn of the loop did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    /// A pending connection was taken by `worker`
    Dispatched { worker: WorkerId, served: u64 },
    /// `worker` completed a request and is free again
    Finished { worker: WorkerId },
    /// `worker` was removed and `replacement` added in its place
    Retired {
        worker: WorkerId,
        replacement: WorkerId,
        reason: RetireReason,
    },
    /// Readiness turned out to be spurious
    Idle,
}

enum Wakeup {
    Connection,
    Signal(WorkerId),
    Spurious,
}

/// Parent side of the pool
pub struct Dispatcher {
    listener: AsyncFd<std::net::TcpListener>,
    registry: Registry,
    spawner: Box<dyn Spawner>,
    pool: PoolConfig,
    next_id: u64,
}

impl Dispatcher {
    /// Watch `listener` (duplicated) and spawn `pool.workers` workers.
    ///
    /// Must be called inside a runtime.
    pub fn start(
        listener: &std::net::TcpListener,
        spawner: impl Spawner + 'static,
        pool: PoolConfig,
    ) -> Result<Self, DispatchError> {
        if pool.workers == 0 {
            return Err(DispatchError::EmptyPool);
        }

        let watched = listener.try_clone().map_err(DispatchError::Listener)?;
        watched
            .set_nonblocking(true)
            .map_err(DispatchError::Listener)?;
        let listener = AsyncFd::with_interest(watched, Interest::READABLE)
            .map_err(DispatchError::Listener)?;

        let mut dispatcher = Self {
            listener,
            registry: Registry::new(),
            spawner: Box::new(spawner),
            pool,
            next_id: 0,
        };
        for _ in 0..dispatcher.pool.workers {
            dispatcher.add_worker()?;
        }

        info!(
            workers = dispatcher.pool.workers,
            max_requests = dispatcher.pool.max_requests,
            "Worker pool started"
        );
        Ok(dispatcher)
    }

    /// Current view of every worker, in registry order
    pub fn workers(&self) -> Vec<WorkerStatus> {
        self.registry.snapshot()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run turns until `shutdown` becomes true, then stop every worker
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            // Shutdown is seen before a ready turn
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                activity = self.turn() => {
                    let activity = activity?;
                    debug!(?activity, busy = self.registry.busy_count(), "Turn complete");
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop every worker and wait for them to go away
    pub async fn shutdown(&mut self) {
        let grace = self.pool.shutdown_grace_period();
        let stops: Vec<_> = self
            .registry
            .drain()
            .map(|record| lifecycle::stop_worker(record.id(), record.into_handle(), grace))
            .collect();
        info!(workers = stops.len(), "Stopping workers");
        futures::future::join_all(stops).await;
    }

    /// Wait once, then reclaim or route
    pub async fn turn(&mut self) -> Result<Activity, DispatchError> {
        match self.wait().await? {
            Wakeup::Signal(id) => self.reclaim(id),
            Wakeup::Connection => self.route().await,
            Wakeup::Spurious => Ok(Activity::Idle),
        }
    }

    async fn wait(&self) -> Result<Wakeup, DispatchError> {
        // Rebuilt from the registry every time, so it never lags behind it
        let mut signals: FuturesUnordered<_> = self
            .registry
            .iter()
            .map(|record| {
                let id = record.id();
                let channel = record.channel();
                async move {
                    // Errors surface when the channel is read
                    let _ = channel.readable().await;
                    id
                }
            })
            .collect();
        let accepting = self.registry.has_free();

        tokio::select! {
            biased;

            Some(id) = signals.next() => Ok(Wakeup::Signal(id)),

            ready = self.listener.readable(), if accepting => {
                let mut guard = ready.map_err(DispatchError::Listener)?;
                match guard.try_io(|inner| connection_pending(inner.get_ref())) {
                    Ok(Ok(())) => Ok(Wakeup::Connection),
                    Ok(Err(e)) => Err(DispatchError::Listener(e)),
                    Err(_would_block) => Ok(Wakeup::Spurious),
                }
            }

            else => Err(DispatchError::EmptyPool),
        }
    }

    async fn route(&mut self) -> Result<Activity, DispatchError> {
        let Some(id) = self.registry.first_free() else {
            return Ok(Activity::Idle);
        };
        let ack_timeout = self.pool.ack_timeout();

        let failure = {
            let Some(record) = self.registry.get_mut(id) else {
                return Ok(Activity::Idle);
            };
            info!(worker = %id, pid = ?record.pid(), "Passing connection to worker");

            let channel = record.channel_mut();
            let handoff = async {
                protocol::send(channel, Signal::Dispatch).await?;
                protocol::expect(channel, Signal::Accepted).await
            };
            let acknowledged = tokio::time::timeout(ack_timeout, handoff).await;

            match acknowledged {
                Ok(Ok(())) => {
                    record.mark_dispatched();
                    info!(
                        worker = %id,
                        served = record.served(),
                        ceiling = record.ceiling(),
                        "Worker counter"
                    );
                    return Ok(Activity::Dispatched {
                        worker: id,
                        served: record.served(),
                    });
                }
                Ok(Err(ProtocolError::Closed)) | Ok(Err(ProtocolError::Io(_))) => {
                    warn!(worker = %id, "Worker went away during hand-off");
                    RetireReason::Exited
                }
                Ok(Err(e)) => {
                    warn!(worker = %id, error = %e, "Worker broke the hand-off protocol");
                    RetireReason::Protocol
                }
                Err(_) => {
                    warn!(
                        worker = %id,
                        timeout_ms = ack_timeout.as_millis() as u64,
                        "Worker did not acknowledge dispatch"
                    );
                    RetireReason::AckTimeout
                }
            }
        };

        self.replace(id, failure)
    }

    fn reclaim(&mut self, id: WorkerId) -> Result<Activity, DispatchError> {
        let Some(record) = self.registry.get_mut(id) else {
            return Ok(Activity::Idle);
        };

        let mut tag = [0u8; 1];
        let received = match record.channel().try_read(&mut tag) {
            Ok(0) => Err(RetireReason::Exited),
            Ok(_) => Signal::from_byte(tag[0]).map_err(|_| RetireReason::Protocol),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Activity::Idle),
            Err(_) => Err(RetireReason::Exited),
        };

        match received {
            Ok(Signal::Finished) if !record.is_free() => {
                if record.mark_finished() {
                    info!(
                        worker = %id,
                        pid = ?record.pid(),
                        served = record.served(),
                        "Worker reached its request ceiling, replacing it"
                    );
                    return self.replace(id, RetireReason::Ceiling);
                }
                debug!(worker = %id, "Worker is free");
                Ok(Activity::Finished { worker: id })
            }
            Ok(signal) => {
                warn!(worker = %id, ?signal, "Unexpected signal from worker");
                self.replace(id, RetireReason::Protocol)
            }
            Err(reason) => {
                if reason == RetireReason::Exited {
                    warn!(worker = %id, "Worker exited unexpectedly");
                } else {
                    warn!(worker = %id, tag = tag[0], "Unknown signal from worker");
                }
                self.replace(id, reason)
            }
        }
    }

    /// Retire `id` and put a fresh worker at the back of the registry
    fn replace(&mut self, id: WorkerId, reason: RetireReason) -> Result<Activity, DispatchError> {
        if let Some(record) = self.registry.remove(id) {
            debug!(worker = %id, served = record.served(), ?reason, "Retiring worker");
            lifecycle::retire(id, record.into_handle(), self.pool.shutdown_grace_period());
        }
        let replacement = self.add_worker()?;
        Ok(Activity::Retired {
            worker: id,
            replacement,
            reason,
        })
    }

    fn add_worker(&mut self) -> Result<WorkerId, DispatchError> {
        self.next_id += 1;
        let id = WorkerId(self.next_id);
        let record = lifecycle::spawn_worker(self.spawner.as_ref(), id, self.pool.max_requests)?;
        self.registry
            .insert(record)
            .map_err(DispatchError::DuplicateWorker)?;
        Ok(id)
    }
}

/// Is a connection waiting in the accept queue? Never blocks.
fn connection_pending(listener: &std::net::TcpListener) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd: listener.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: `pfd` is a single valid pollfd and the timeout is zero
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        return Err(err);
    }
    if rc > 0 && pfd.revents & libc::POLLIN != 0 {
        Ok(())
    } else {
        Err(io::ErrorKind::WouldBlock.into())
    }
}
