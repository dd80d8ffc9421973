use crate::protocol::Signal;
use crate::registry::WorkerId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors on a worker's signal channel
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The channel failed at the I/O level
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
    /// The peer closed its end of the channel
    #[error("channel closed by peer")]
    Closed,
    /// A byte that is not a known signal tag
    #[error("unknown signal tag 0x{0:02x}")]
    UnknownTag(u8),
    /// A valid signal arrived out of sequence
    #[error("expected {expected:?}, got {got:?}")]
    Unexpected { expected: Signal, got: Signal },
}

/// Errors creating a worker
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Could not create the duplex channel
    #[error("failed to create worker channel: {0}")]
    Channel(#[source] io::Error),
    /// Could not share the listening socket with the worker
    #[error("failed to share listening socket: {0}")]
    Listener(#[source] io::Error),
    /// The command configuration could not be encoded for the worker
    #[error("failed to encode worker configuration: {0}")]
    Encode(#[from] toml::ser::Error),
    /// The worker program could not be started
    #[error("failed to start worker program {}: {source}", program.display())]
    Process {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors that end a worker's loop
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The signal channel misbehaved
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Accepting from the shared listener failed
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    /// An inherited descriptor was missing or malformed
    #[error("invalid inherited descriptor in {var}: {reason}")]
    Descriptor { var: &'static str, reason: String },
    /// Turning an inherited descriptor into a socket failed
    #[error("failed to adopt inherited socket: {0}")]
    Adopt(#[source] io::Error),
}

/// Errors while serving one connection; the connection is dropped, the worker survives
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Reading the request or writing the response failed
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),
    /// The client closed the connection before sending `\r\n\r\n`
    #[error("connection closed before end of request headers ({received} bytes received)")]
    Incomplete { received: usize },
    /// The configured request read timeout elapsed
    #[error("timed out waiting for end of request")]
    Timeout,
    /// The external command could not be started
    #[error("failed to run command: {0}")]
    Command(#[source] io::Error),
}

/// Errors that stop the dispatch loop
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A worker or its replacement could not be spawned
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// Waiting on the listening socket failed
    #[error("listener error: {0}")]
    Listener(#[source] io::Error),
    /// There are no workers to wait on
    #[error("worker pool is empty")]
    EmptyPool,
    /// A new worker was given an id that is already live
    #[error("worker {0} is already registered")]
    DuplicateWorker(WorkerId),
}

/// Configuration validation failures, reported together
#[derive(Debug, Error)]
#[error("Configuration errors:\n  - {}", .0.join("\n  - "))]
pub struct ConfigError(pub Vec<String>);
