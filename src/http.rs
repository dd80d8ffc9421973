use crate::error::HandlerError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Terminator that ends a request
pub const REQUEST_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Size of each socket read while collecting a request
pub const READ_CHUNK_SIZE: usize = 1024;

/// Value of the `Server` response header
pub const SERVER_NAME: &str = "localhost";

/// Read from `stream` until the accumulated bytes end with `\r\n\r\n`.
///
/// Only the tail of the buffer is checked after each read, so a terminator
/// followed by further bytes in the same read does not end the request.
/// There is no timeout here; callers wrap this in one if they want it.
pub async fn read_request<S>(stream: &mut S) -> Result<Vec<u8>, HandlerError>
where
    S: AsyncRead + Unpin,
{
    let mut request = Vec::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    while !request.ends_with(REQUEST_TERMINATOR) {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandlerError::Incomplete {
                received: request.len(),
            });
        }
        request.extend_from_slice(&chunk[..n]);
    }

    Ok(request)
}

/// Build the complete response bytes for `body`
pub fn build_response(body: &[u8]) -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Server: {}\r\n\
         Connection: close\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         \r\n",
        SERVER_NAME,
        body.len()
    );

    let mut response = Vec::with_capacity(head.len() + body.len());
    response.extend_from_slice(head.as_bytes());
    response.extend_from_slice(body);
    response
}

/// Write the response for `body` and flush it
pub async fn write_response<S>(stream: &mut S, body: &[u8]) -> Result<(), HandlerError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&build_response(body)).await?;
    stream.flush().await?;
    Ok(())
}
