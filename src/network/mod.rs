use anyhow::{Context, Result};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

pub const DEFAULT_PORT: u16 = 9000;

/// Bind the receiving side's listener
pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{}:{}", host, port);
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))
}

/// Connect to a remote host
pub async fn connect(host: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);

    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    stream.set_nodelay(true)?;

    Ok(stream)
}

fn timed_out(op: &str, limit: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{} timed out after {}", op, humantime::format_duration(limit)),
    )
}

/// Single read bounded by `limit`; `Ok(0)` means the peer closed.
pub async fn read_timed<R>(reader: &mut R, buf: &mut [u8], limit: Duration) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match timeout(limit, reader.read(buf)).await {
        Ok(result) => result,
        Err(_) => Err(timed_out("read", limit)),
    }
}

/// Write all of `buf` within `limit`.
pub async fn write_all_timed<W>(writer: &mut W, buf: &[u8], limit: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match timeout(limit, writer.write_all(buf)).await {
        Ok(result) => result,
        Err(_) => Err(timed_out("write", limit)),
    }
}

pub async fn flush_timed<W>(writer: &mut W, limit: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match timeout(limit, writer.flush()).await {
        Ok(result) => result,
        Err(_) => Err(timed_out("flush", limit)),
    }
}

/// Whether a write failed because the remote end went away.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}
