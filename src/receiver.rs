//! Receiving side: accept loop and the per-connection header/payload loop.

use anyhow::{Context, Result};
use bytes::BytesMut;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::network::read_timed;
use crate::protocol::{Header, HeaderDecoder, ProtocolError};
use crate::transfer::{destination_path, FileWriter, ReceivedFile};

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("failed to create {path}: {source}")]
    Create { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Per-connection receive settings.
#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    pub directory: PathBuf,
    pub chunk_size: usize,
    pub io_timeout: Duration,
}

impl From<&Config> for ReceiverSettings {
    fn from(config: &Config) -> Self {
        Self {
            directory: config.receive.directory.clone(),
            chunk_size: config.chunk_size,
            io_timeout: config.io_timeout,
        }
    }
}

/// What one connection delivered before it ended.
#[derive(Debug, Default)]
pub struct SessionSummary {
    pub files: Vec<ReceivedFile>,
    /// File cut short by the peer closing mid-payload, kept as received.
    pub truncated: Option<ReceivedFile>,
}

/// Accept connections forever, one independent session task each.
///
/// Only an accept failure ends the loop.
pub async fn accept_loop(listener: TcpListener, settings: ReceiverSettings) -> Result<()> {
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .context("Failed to accept connection")?;
        info!(%peer, "client connected");

        let settings = settings.clone();
        tokio::spawn(async move {
            match Session::new(stream, settings).run().await {
                Ok(summary) => info!(
                    %peer,
                    files = summary.files.len(),
                    truncated = summary.truncated.is_some(),
                    "client disconnected"
                ),
                Err(e) => error!(%peer, error = %e, "connection closed"),
            }
        });
    }
}

/// Receive state for one connection.
///
/// Owns the read half, the receive buffer and (while a payload is in flight)
/// the output file. Exactly one read is outstanding at a time.
pub struct Session<R> {
    reader: R,
    buffer: BytesMut,
    decoder: HeaderDecoder,
    chunk: Vec<u8>,
    settings: ReceiverSettings,
}

impl<R: AsyncRead + Unpin> Session<R> {
    pub fn new(reader: R, settings: ReceiverSettings) -> Self {
        let chunk_size = settings.chunk_size.max(1);
        Self {
            reader,
            buffer: BytesMut::with_capacity(chunk_size),
            decoder: HeaderDecoder::new(),
            chunk: vec![0u8; chunk_size],
            settings,
        }
    }

    /// Alternate header and payload phases until the peer closes.
    pub async fn run(mut self) -> Result<SessionSummary, ReceiveError> {
        let mut summary = SessionSummary::default();

        while let Some(header) = self.read_header().await? {
            let path = destination_path(&self.settings.directory, &header.name)?;
            info!(file = %header.name, size = header.size, "receiving");

            let mut writer = FileWriter::create(&path, header.size)
                .await
                .map_err(|source| ReceiveError::Create {
                    path: path.clone(),
                    source,
                })?;

            match self.read_payload(&mut writer).await {
                Ok(()) if writer.is_complete() => {
                    let received = writer.finalize().await?;
                    info!(path = %received.path.display(), bytes = received.written, "file received");
                    summary.files.push(received);
                }
                Ok(()) => {
                    let partial = writer.abandon().await?;
                    warn!(
                        file = %header.name,
                        bytes = partial.written,
                        expected = partial.expected,
                        "client disconnected mid-file, keeping truncated file"
                    );
                    summary.truncated = Some(partial);
                    return Ok(summary);
                }
                Err(e) => {
                    if let Err(close_err) = writer.abandon().await {
                        debug!(error = %close_err, "failed to close partial file");
                    }
                    return Err(e);
                }
            }
        }

        Ok(summary)
    }

    /// Header phase: buffer reads until a full header line is available.
    ///
    /// `None` means the peer closed, either cleanly between files or partway
    /// through a header.
    async fn read_header(&mut self) -> Result<Option<Header>, ReceiveError> {
        loop {
            if let Some(header) = self.decoder.decode(&mut self.buffer)? {
                return Ok(Some(header));
            }

            let n = read_timed(&mut self.reader, &mut self.chunk, self.settings.io_timeout).await?;
            if n == 0 {
                if !self.buffer.is_empty() {
                    warn!(bytes = self.buffer.len(), "client disconnected mid-header");
                }
                return Ok(None);
            }
            self.buffer.extend_from_slice(&self.chunk[..n]);
        }
    }

    /// Payload phase: write carry-over first, then read straight into the
    /// file. Returns early, leaving `writer` incomplete, if the peer closes.
    async fn read_payload(&mut self, writer: &mut FileWriter) -> Result<(), ReceiveError> {
        if !self.buffer.is_empty() && !writer.is_complete() {
            let take = (self.buffer.len() as u64).min(writer.remaining()) as usize;
            let carry = self.buffer.split_to(take);
            debug!(bytes = carry.len(), "writing carry-over bytes");
            writer.write_chunk(&carry).await?;
        }

        while !writer.is_complete() {
            // Never read past this file's payload into the next header.
            let want = (self.chunk.len() as u64).min(writer.remaining()) as usize;
            let n = read_timed(
                &mut self.reader,
                &mut self.chunk[..want],
                self.settings.io_timeout,
            )
            .await?;
            if n == 0 {
                return Ok(());
            }
            writer.write_chunk(&self.chunk[..n]).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio_test::io::Builder;

    fn settings(dir: &Path, chunk_size: usize) -> ReceiverSettings {
        ReceiverSettings {
            directory: dir.to_path_buf(),
            chunk_size,
            io_timeout: Duration::from_secs(5),
        }
    }

    fn frame(name: &str, content: &[u8]) -> Vec<u8> {
        let mut wire = Header::new(name, content.len() as u64).unwrap().encode();
        wire.extend_from_slice(content);
        wire
    }

    /// Feed `reads` to a session as exactly those physical reads.
    async fn receive_reads(
        dir: &Path,
        chunk_size: usize,
        reads: &[&[u8]],
    ) -> Result<SessionSummary, ReceiveError> {
        let mut builder = Builder::new();
        for read in reads.iter().filter(|r| !r.is_empty()) {
            builder.read(read);
        }
        Session::new(builder.build(), settings(dir, chunk_size)).run().await
    }

    #[tokio::test]
    async fn test_single_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let wire = frame("hello.txt", b"hello world");

        let summary = receive_reads(dir.path(), 4096, &[&wire[..]]).await.unwrap();

        assert_eq!(summary.files.len(), 1);
        assert!(summary.truncated.is_none());
        assert_eq!(
            std::fs::read(dir.path().join("hello.txt")).unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn test_every_split_offset() {
        let content: Vec<u8> = (0u8..=255).cycle().take(300).collect();
        let wire = frame("data.bin", &content);

        for split in 0..=wire.len() {
            let dir = TempDir::new().unwrap();
            let (head, tail) = wire.split_at(split);

            let summary = receive_reads(dir.path(), 64, &[head, tail]).await.unwrap();

            assert_eq!(summary.files.len(), 1, "split at {}", split);
            assert_eq!(
                std::fs::read(dir.path().join("data.bin")).unwrap(),
                content,
                "split at {}",
                split
            );
        }
    }

    #[tokio::test]
    async fn test_byte_at_a_time() {
        let dir = TempDir::new().unwrap();
        let wire = frame("slow.txt", b"one byte per read");
        let reads: Vec<&[u8]> = wire.chunks(1).collect();

        let summary = receive_reads(dir.path(), 4096, &reads).await.unwrap();

        assert_eq!(summary.files.len(), 1);
        assert_eq!(
            std::fs::read(dir.path().join("slow.txt")).unwrap(),
            b"one byte per read"
        );
    }

    #[tokio::test]
    async fn test_two_files_one_connection_every_split() {
        let mut wire = frame("first.txt", b"alpha");
        wire.extend(frame("second.txt", b"bravo charlie"));

        for split in 0..=wire.len() {
            let dir = TempDir::new().unwrap();
            let (head, tail) = wire.split_at(split);

            let summary = receive_reads(dir.path(), 8, &[head, tail]).await.unwrap();

            assert_eq!(summary.files.len(), 2, "split at {}", split);
            assert_eq!(std::fs::read(dir.path().join("first.txt")).unwrap(), b"alpha");
            assert_eq!(
                std::fs::read(dir.path().join("second.txt")).unwrap(),
                b"bravo charlie"
            );
        }
    }

    #[tokio::test]
    async fn test_payload_and_next_header_in_one_read() {
        let dir = TempDir::new().unwrap();
        let mut wire = frame("a.txt", b"AAA");
        wire.extend(frame("b.txt", b"BBBB"));

        // Large chunk: the first read swallows both files whole.
        let summary = receive_reads(dir.path(), 4096, &[&wire[..]]).await.unwrap();

        assert_eq!(summary.files.len(), 2);
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"AAA");
        assert_eq!(std::fs::read(dir.path().join("b.txt")).unwrap(), b"BBBB");
    }

    #[tokio::test]
    async fn test_zero_byte_file() {
        let dir = TempDir::new().unwrap();
        let mut wire = b"empty.txt 0\n".to_vec();
        wire.extend(frame("after.txt", b"x"));

        let summary = receive_reads(dir.path(), 4096, &[&wire[..]]).await.unwrap();

        assert_eq!(summary.files.len(), 2);
        assert_eq!(std::fs::read(dir.path().join("empty.txt")).unwrap(), b"");
        assert_eq!(std::fs::read(dir.path().join("after.txt")).unwrap(), b"x");

        // Zero-byte file followed directly by the close.
        let dir = TempDir::new().unwrap();
        let summary = receive_reads(dir.path(), 4096, &[&b"empty.txt 0\n"[..]]).await.unwrap();
        assert_eq!(summary.files.len(), 1);
        assert!(summary.truncated.is_none());
        assert_eq!(std::fs::read(dir.path().join("empty.txt")).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_filename_with_space() {
        let dir = TempDir::new().unwrap();

        receive_reads(dir.path(), 4096, &[&b"my file.txt 5\nhello"[..]])
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("my file.txt")).unwrap(),
            b"hello"
        );
        assert!(!dir.path().join("my").exists());
    }

    #[tokio::test]
    async fn test_mid_payload_disconnect_keeps_truncated_file() {
        let dir = TempDir::new().unwrap();

        let summary = receive_reads(dir.path(), 4096, &[&b"cut.bin 10\n"[..], &b"1234"[..]])
            .await
            .unwrap();

        assert!(summary.files.is_empty());
        let partial = summary.truncated.unwrap();
        assert_eq!(partial.written, 4);
        assert_eq!(partial.expected, 10);
        assert_eq!(std::fs::read(dir.path().join("cut.bin")).unwrap(), b"1234");
    }

    #[tokio::test]
    async fn test_clean_close_and_partial_header() {
        let dir = TempDir::new().unwrap();
        let summary = receive_reads(dir.path(), 4096, &[]).await.unwrap();
        assert!(summary.files.is_empty());

        let summary = receive_reads(dir.path(), 4096, &[&b"half.txt 1"[..]]).await.unwrap();
        assert!(summary.files.is_empty());
        assert!(summary.truncated.is_none());
        assert!(!dir.path().join("half.txt").exists());
    }

    #[tokio::test]
    async fn test_malformed_header_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = receive_reads(dir.path(), 4096, &[&b"file.txt +5\nhello"[..]])
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiveError::Protocol(ProtocolError::InvalidSize(_))));

        let err = receive_reads(dir.path(), 4096, &[&b"no-separator\n"[..]])
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiveError::Protocol(ProtocolError::MissingSeparator)));
    }

    #[tokio::test]
    async fn test_unsafe_name_rejected() {
        let root = TempDir::new().unwrap();
        let inbox = root.path().join("inbox");
        std::fs::create_dir(&inbox).unwrap();

        let err = receive_reads(&inbox, 4096, &[&b"../escape.txt 2\nhi"[..]])
            .await
            .unwrap_err();

        assert!(matches!(err, ReceiveError::Protocol(ProtocolError::UnsafeName(_))));
        assert!(!root.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_accept_loop_survives_disconnect() {
        let dir = TempDir::new().unwrap();
        let listener = crate::network::bind("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(accept_loop(listener, settings(dir.path(), 4096)));

        let mut conn = crate::network::connect("127.0.0.1", port).await.unwrap();
        conn.write_all(b"cut.bin 10\n1234").await.unwrap();
        conn.shutdown().await.unwrap();
        drop(conn);
        wait_for_len(&dir.path().join("cut.bin"), 4).await;

        let mut conn = crate::network::connect("127.0.0.1", port).await.unwrap();
        conn.write_all(&frame("next.txt", b"abc")).await.unwrap();
        conn.shutdown().await.unwrap();
        drop(conn);
        wait_for_len(&dir.path().join("next.txt"), 3).await;

        assert_eq!(std::fs::read(dir.path().join("cut.bin")).unwrap(), b"1234");
        assert_eq!(std::fs::read(dir.path().join("next.txt")).unwrap(), b"abc");
        server.abort();
    }

    #[tokio::test]
    async fn test_accept_loop_survives_immediate_close() {
        let dir = TempDir::new().unwrap();
        let listener = crate::network::bind("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(accept_loop(listener, settings(dir.path(), 4096)));

        for _ in 0..5 {
            drop(crate::network::connect("127.0.0.1", port).await.unwrap());
        }

        let mut conn = crate::network::connect("127.0.0.1", port).await.unwrap();
        conn.write_all(&frame("after.txt", b"ok")).await.unwrap();
        conn.shutdown().await.unwrap();
        drop(conn);
        wait_for_len(&dir.path().join("after.txt"), 2).await;

        assert_eq!(std::fs::read(dir.path().join("after.txt")).unwrap(), b"ok");
        assert!(!server.is_finished());
        server.abort();
    }

    async fn wait_for_len(path: &Path, len: u64) {
        for _ in 0..200 {
            if std::fs::metadata(path).map(|m| m.len() == len).unwrap_or(false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {} bytes", path.display(), len);
    }
}
