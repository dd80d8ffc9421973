use crate::cgi::CgiCommand;
use crate::config::CgiConfig;
use crate::error::{ConfigError, HandlerError, ProtocolError, WorkerError};
use crate::http;
use crate::protocol::{self, Signal};
use std::os::unix::io::{FromRawFd, RawFd};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixStream};
use tracing::{debug, info, warn};

/// Serves a single accepted connection
#[derive(Debug, Clone)]
pub struct RequestHandler {
    command: CgiCommand,
    request_timeout: Option<Duration>,
}

impl RequestHandler {
    pub fn new(command: CgiCommand, request_timeout: Option<Duration>) -> Self {
        Self {
            command,
            request_timeout,
        }
    }

    pub fn from_config(config: &CgiConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            CgiCommand::from_config(config)?,
            config.request_timeout(),
        ))
    }

    /// Read the request, run the command, write the response.
    ///
    /// Returns the number of body bytes sent.
    pub async fn handle<S>(&self, stream: &mut S) -> Result<usize, HandlerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, http::read_request(stream))
                .await
                .map_err(|_| HandlerError::Timeout)??,
            None => http::read_request(stream).await?,
        };
        debug!(bytes = request.len(), "Request received");

        let body = self.command.run().await?;

        info!(pid = std::process::id(), bytes = body.len(), "Sending response");
        http::write_response(stream, &body).await?;
        Ok(body.len())
    }
}

/// Run the worker loop until the parent closes the channel.
///
/// Each [`Signal::Dispatch`] yields one accept, one [`Signal::Accepted`],
/// one request cycle and one [`Signal::Finished`]. A failure while serving
/// the connection drops that connection only. Accept failures and protocol
/// violations end the loop with an error.
pub async fn serve<C>(
    listener: &TcpListener,
    mut channel: C,
    handler: &RequestHandler,
) -> Result<(), WorkerError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let pid = std::process::id();

    loop {
        match protocol::recv(&mut channel).await {
            Ok(Signal::Dispatch) => {}
            Err(ProtocolError::Closed) => {
                debug!(pid, "Channel closed, worker exiting");
                return Ok(());
            }
            Ok(got) => {
                return Err(ProtocolError::Unexpected {
                    expected: Signal::Dispatch,
                    got,
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        }

        let (mut stream, peer) = listener.accept().await.map_err(WorkerError::Accept)?;
        info!(pid, %peer, "Accepted connection");
        protocol::send(&mut channel, Signal::Accepted).await?;

        if let Err(e) = handler.handle(&mut stream).await {
            warn!(pid, %peer, error = %e, "Dropping connection");
        }
        let _ = stream.shutdown().await;
        drop(stream);

        info!(pid, "Request finished");
        protocol::send(&mut channel, Signal::Finished).await?;
    }
}

/// Entry point of a worker process started by
/// [`ProcessSpawner`](crate::lifecycle::ProcessSpawner).
///
/// `listen_fd` and `channel_fd` are descriptors inherited across exec.
pub async fn run_inherited(
    listen_fd: RawFd,
    channel_fd: RawFd,
    handler: RequestHandler,
) -> Result<(), WorkerError> {
    let listener = adopt_listener(listen_fd)?;
    let channel = adopt_channel(channel_fd)?;
    info!(pid = std::process::id(), "Worker started");
    serve(&listener, channel, &handler).await
}

fn adopt_listener(fd: RawFd) -> Result<TcpListener, WorkerError> {
    claim_descriptor(fd, "--listen-fd")?;
    // SAFETY: the descriptor is open and was handed to this process for exclusive use
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    listener.set_nonblocking(true).map_err(WorkerError::Adopt)?;
    TcpListener::from_std(listener).map_err(WorkerError::Adopt)
}

fn adopt_channel(fd: RawFd) -> Result<UnixStream, WorkerError> {
    claim_descriptor(fd, "--channel-fd")?;
    // SAFETY: as above
    let channel = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    channel.set_nonblocking(true).map_err(WorkerError::Adopt)?;
    UnixStream::from_std(channel).map_err(WorkerError::Adopt)
}

/// Check that `fd` is open and mark it close-on-exec again so the commands
/// run per request do not inherit it.
fn claim_descriptor(fd: RawFd, var: &'static str) -> Result<(), WorkerError> {
    if fd < 0 {
        return Err(WorkerError::Descriptor {
            var,
            reason: format!("{} is not a valid descriptor", fd),
        });
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(WorkerError::Descriptor {
            var,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } == -1 {
        return Err(WorkerError::Descriptor {
            var,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}
