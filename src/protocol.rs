//! Signal protocol spoken on a worker's duplex channel
//!
//! Every message is a single tag byte. The parent sends [`Signal::Dispatch`];
//! the worker answers with [`Signal::Accepted`] once it has taken the pending
//! connection off the listener and [`Signal::Finished`] once the response has
//! been written and the connection closed. Messages on one channel arrive in
//! send order.

use crate::error::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A message exchanged between the dispatcher and a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Parent to worker: a connection is pending, accept it
    Dispatch,
    /// Worker to parent: the connection has been accepted
    Accepted,
    /// Worker to parent: the request cycle is complete
    Finished,
}

impl Signal {
    pub fn as_byte(self) -> u8 {
        match self {
            Signal::Dispatch => b'D',
            Signal::Accepted => b'A',
            Signal::Finished => b'F',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            b'D' => Ok(Signal::Dispatch),
            b'A' => Ok(Signal::Accepted),
            b'F' => Ok(Signal::Finished),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// Write one signal to the channel
pub async fn send<W>(channel: &mut W, signal: Signal) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    channel.write_all(&[signal.as_byte()]).await?;
    channel.flush().await?;
    Ok(())
}

/// Read the next signal, waiting until one arrives
pub async fn recv<R>(channel: &mut R) -> Result<Signal, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut tag = [0u8; 1];
    match channel.read(&mut tag).await? {
        0 => Err(ProtocolError::Closed),
        _ => Signal::from_byte(tag[0]),
    }
}

/// Read the next signal and require it to be `expected`
pub async fn expect<R>(channel: &mut R, expected: Signal) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let got = recv(channel).await?;
    if got != expected {
        return Err(ProtocolError::Unexpected { expected, got });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixStream;

    #[test]
    fn test_tags_are_distinct() {
        let tags = [
            Signal::Dispatch.as_byte(),
            Signal::Accepted.as_byte(),
            Signal::Finished.as_byte(),
        ];
        assert_ne!(tags[0], tags[1]);
        assert_ne!(tags[1], tags[2]);
        assert_ne!(tags[0], tags[2]);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let err = Signal::from_byte(b'x').unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag(b'x')));
    }

    #[tokio::test]
    async fn test_signals_arrive_in_send_order() {
        let (mut parent, mut worker) = UnixStream::pair().unwrap();

        send(&mut worker, Signal::Accepted).await.unwrap();
        send(&mut worker, Signal::Finished).await.unwrap();

        assert_eq!(recv(&mut parent).await.unwrap(), Signal::Accepted);
        assert_eq!(recv(&mut parent).await.unwrap(), Signal::Finished);
    }

    #[tokio::test]
    async fn test_recv_reports_closed_channel() {
        let (mut parent, worker) = UnixStream::pair().unwrap();
        drop(worker);

        assert!(matches!(recv(&mut parent).await, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn test_expect_rejects_wrong_signal() {
        let (mut parent, mut worker) = UnixStream::pair().unwrap();
        send(&mut worker, Signal::Finished).await.unwrap();

        let err = expect(&mut parent, Signal::Accepted).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Unexpected {
                expected: Signal::Accepted,
                got: Signal::Finished
            }
        ));
    }
}
