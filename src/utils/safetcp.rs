//! Safe TCP bind/connect/read helper functions.

use std::marker::Unpin;
use std::net::SocketAddr;

use crate::utils::ProxyError;

use bytes::BytesMut;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};

/// Receives one newline-terminated line from TCP readable connection
/// `conn_read`, using `read_buf` as buffer storage for partial reads. The
/// returned line has its trailing `\n` (or `\r\n`) stripped. Returns an
/// `Err` on unexpected EOF.
///
/// CANCELLATION SAFETY: we cannot use `read_line()` here because this
/// function is intended to be used as a `tokio::select!` branch and that
/// method is not cancellation-safe. Instead, in the case of being cancelled
/// midway before receiving a full line (note that such cancellation can only
/// happen at `.await` points), bytes already read are kept in the read
/// buffer and will continue to be appended by future invocations until a
/// newline shows up.
pub(crate) async fn safe_line_read<Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<String, ProxyError>
where
    Conn: AsyncReadExt + Unpin,
{
    loop {
        if let Some(pos) = read_buf.iter().position(|&b| b == b'\n') {
            // if reached this point, no further cancellation to this call is
            // possible; split the line off the front of the buffer
            let line = read_buf.split_to(pos + 1);
            let mut end = pos;
            if end > 0 && line[end - 1] == b'\r' {
                end -= 1;
            }
            return Ok(String::from_utf8_lossy(&line[..end]).into_owned());
        }

        let nread = conn_read.read_buf(read_buf).await?;
        if nread == 0 {
            return Err(ProxyError::msg("connection closed by peer"));
        }
    }
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, ProxyError> {
    loop {
        match TcpListener::bind(bind_addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that fails after the given
/// timeout instead of waiting for the OS-level connect timeout. Takes a
/// `host:port` string so backend hostnames resolve through the system.
pub(crate) async fn tcp_connect_with_timeout(
    conn_addr: &str,
    timeout: Duration,
) -> Result<TcpStream, ProxyError> {
    let stream = time::timeout(timeout, TcpStream::connect(conn_addr)).await??;
    stream.set_nodelay(true)?;
    Ok(stream)
}
