//! Sending side: walk the file queue over one connection at a time.

use anyhow::{bail, Result};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::network::{self, flush_timed, write_all_timed};
use crate::progress;
use crate::protocol::ProtocolError;
use crate::transfer::{wire_header, FileChunker, FileQueue};

/// Why a single file did not make it across.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("cannot send {path}: {source}")]
    Name { path: PathBuf, source: ProtocolError },

    #[error("failed to send header: {0}")]
    Header(io::Error),

    #[error("lost connection with server: {0}")]
    Disconnected(io::Error),

    #[error("failed to send file data: {0}")]
    Payload(io::Error),

    #[error("failed to read source file: {0}")]
    Source(io::Error),
}

impl SendError {
    /// The peer may have seen part of this file, so the stream is no longer
    /// at a header boundary.
    fn breaks_stream(&self) -> bool {
        matches!(
            self,
            SendError::Header(_) | SendError::Payload(_) | SendError::Source(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct SenderSettings {
    pub host: String,
    pub port: u16,
    pub chunk_size: usize,
    pub io_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl From<&Config> for SenderSettings {
    fn from(config: &Config) -> Self {
        Self {
            host: config.send.host.clone(),
            port: config.port,
            chunk_size: config.chunk_size,
            io_timeout: config.io_timeout,
            reconnect_attempts: config.send.reconnect_attempts,
            reconnect_delay: config.send.reconnect_delay,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SendSummary {
    pub sent: usize,
    pub skipped: usize,
    pub bytes: u64,
    pub reconnects: u32,
}

/// Frame and stream one file: header first, then exactly `size` bytes.
///
/// Returns the number of payload bytes written.
pub async fn send_file<W>(
    conn: &mut W,
    path: &Path,
    chunk_size: usize,
    io_timeout: Duration,
    show_progress: bool,
) -> Result<u64, SendError>
where
    W: AsyncWrite + Unpin,
{
    let mut chunker = FileChunker::open(path, chunk_size)
        .await
        .map_err(|source| SendError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    let header = wire_header(path, chunker.total_size()).map_err(|source| SendError::Name {
        path: path.to_path_buf(),
        source,
    })?;

    info!(file = %header.name, size = header.size, "sending");
    write_all_timed(conn, &header.encode(), io_timeout)
        .await
        .map_err(SendError::Header)?;

    let bar = progress::file_bar(show_progress, &header.name, header.size);
    let payload_error = |e: io::Error| {
        if network::is_disconnect(&e) {
            SendError::Disconnected(e)
        } else {
            SendError::Payload(e)
        }
    };

    while let Some(chunk) = chunker.next_chunk().await.map_err(SendError::Source)? {
        if let Err(e) = write_all_timed(conn, chunk, io_timeout).await {
            bar.abandon();
            return Err(payload_error(e));
        }
        bar.set_position(chunker.bytes_read());
    }
    flush_timed(conn, io_timeout).await.map_err(payload_error)?;
    bar.finish_and_clear();

    Ok(chunker.bytes_read())
}

/// Pushes every queued file to the receiver.
pub struct Sender {
    settings: SenderSettings,
    queue: FileQueue,
    show_progress: bool,
}

impl Sender {
    pub fn new(settings: SenderSettings, queue: FileQueue) -> Self {
        Self {
            settings,
            queue,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Send the queue in order until it is exhausted.
    ///
    /// A drop mid-payload reconnects and restarts the current file from its
    /// header; there is no resume offset. The initial connect failing, or
    /// running out of reconnect attempts, ends the run with an error.
    pub async fn run(self) -> Result<SendSummary> {
        let host = self.settings.host.clone();
        let port = self.settings.port;

        self.run_with(move || {
            let host = host.clone();
            async move {
                let conn = network::connect(&host, port).await?;
                info!(peer = %conn.peer_addr()?, "connected to server");
                Ok::<_, anyhow::Error>(conn)
            }
        })
        .await
    }

    /// Queue walk over connections produced by `connect`.
    async fn run_with<W, F, Fut>(mut self, mut connect: F) -> Result<SendSummary>
    where
        W: AsyncWrite + Unpin,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<W>>,
    {
        let mut conn = connect().await?;
        let mut summary = SendSummary::default();
        let mut budget = self.settings.reconnect_attempts;

        while let Some(path) = self.queue.current().map(Path::to_path_buf) {
            debug!(file = %path.display(), queued = self.queue.remaining(), "next file");
            let result = send_file(
                &mut conn,
                &path,
                self.settings.chunk_size,
                self.settings.io_timeout,
                self.show_progress,
            )
            .await;

            match result {
                Ok(bytes) => {
                    info!(file = %path.display(), bytes, "file sent");
                    summary.sent += 1;
                    summary.bytes += bytes;
                    budget = self.settings.reconnect_attempts;
                    self.queue.advance();
                }
                Err(SendError::Disconnected(e)) => {
                    warn!(file = %path.display(), error = %e, "lost connection with server, restarting file");
                    conn = self.reconnect(&mut connect, &mut budget).await?;
                    summary.reconnects += 1;
                }
                Err(e) => {
                    error!(file = %path.display(), error = %e, "skipping file");
                    summary.skipped += 1;
                    self.queue.advance();

                    if e.breaks_stream() && self.queue.current().is_some() {
                        conn = self.reconnect(&mut connect, &mut budget).await?;
                        summary.reconnects += 1;
                    }
                }
            }
        }

        info!(
            sent = summary.sent,
            skipped = summary.skipped,
            bytes = summary.bytes,
            "all files sent"
        );
        if let Err(e) = conn.shutdown().await {
            debug!(error = %e, "shutdown after last file failed");
        }

        Ok(summary)
    }

    async fn reconnect<W, F, Fut>(&self, connect: &mut F, budget: &mut u32) -> Result<W>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<W>>,
    {
        loop {
            if *budget == 0 {
                let unsent = self.queue.remaining();
                error!(unsent, "out of reconnect attempts");
                bail!(
                    "giving up after {} reconnect attempts, {} file(s) not sent",
                    self.settings.reconnect_attempts,
                    unsent
                );
            }
            *budget -= 1;

            tokio::time::sleep(self.settings.reconnect_delay).await;
            match connect().await {
                Ok(conn) => return Ok(conn),
                Err(e) => warn!(error = %e, attempts_left = *budget, "reconnect failed"),
            }
        }
    }
}
