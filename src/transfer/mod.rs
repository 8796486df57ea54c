use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self as async_fs, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::protocol::{sanitize_name, Header, ProtocolError};

/// Ordered snapshot of the files in a source directory.
///
/// Taken once at startup; files added or removed later are not picked up.
#[derive(Debug, Clone, Default)]
pub struct FileQueue {
    files: Vec<PathBuf>,
    cursor: usize,
}

impl FileQueue {
    /// Snapshot the regular files directly inside `dir`, sorted by path.
    ///
    /// Subdirectories are ignored since only flat names go on the wire.
    pub async fn snapshot(dir: &Path) -> Result<Self> {
        let mut entries = async_fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to read directory {}", dir.display()))?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            // Follows symlinks, so a link to a regular file is sent as one.
            if async_fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
                files.push(path);
            }
        }
        files.sort();

        Ok(Self::from_paths(files))
    }

    pub fn from_paths(files: Vec<PathBuf>) -> Self {
        Self { files, cursor: 0 }
    }

    /// File under the cursor, or `None` once the queue is exhausted.
    pub fn current(&self) -> Option<&Path> {
        self.files.get(self.cursor).map(PathBuf::as_path)
    }

    pub fn advance(&mut self) {
        if self.cursor < self.files.len() {
            self.cursor += 1;
        }
    }

    /// Number of files not yet sent, the current one included.
    pub fn remaining(&self) -> usize {
        self.files.len() - self.cursor
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Build the wire header for a source file of `size` bytes.
pub fn wire_header(path: &Path, size: u64) -> Result<Header, ProtocolError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(ProtocolError::InvalidName)?;

    Header::new(sanitize_name(name)?, size)
}

/// Join a received name onto the destination directory.
pub fn destination_path(dir: &Path, name: &str) -> Result<PathBuf, ProtocolError> {
    Ok(dir.join(sanitize_name(name)?))
}

/// File chunker for streaming transfer
///
/// The size is captured when the file is opened. At most that many bytes are
/// ever yielded, so a file that grows mid-send cannot overrun its header.
pub struct FileChunker {
    file: File,
    buffer: Vec<u8>,
    total_size: u64,
    bytes_read: u64,
}

impl FileChunker {
    /// Open `path` for reading in `chunk_size` pieces
    pub async fn open(path: &Path, chunk_size: usize) -> io::Result<Self> {
        let file = File::open(path).await?;
        let total_size = file.metadata().await?.len();

        Ok(Self {
            file,
            buffer: vec![0u8; chunk_size.max(1)],
            total_size,
            bytes_read: 0,
        })
    }

    /// Read the next chunk
    ///
    /// A file that shrank below its announced size is an `UnexpectedEof`.
    pub async fn next_chunk(&mut self) -> io::Result<Option<&[u8]>> {
        let left = self.total_size - self.bytes_read;
        if left == 0 {
            return Ok(None);
        }

        let want = left.min(self.buffer.len() as u64) as usize;
        let n = self.file.read(&mut self.buffer[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "file shrank to {} bytes, {} announced",
                    self.bytes_read, self.total_size
                ),
            ));
        }

        self.bytes_read += n as u64;
        Ok(Some(&self.buffer[..n]))
    }

    /// Get total size
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Get bytes read
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// Outcome of writing one received file to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub path: PathBuf,
    pub expected: u64,
    pub written: u64,
}

/// File writer for receiving payload bytes
///
/// Owns the output handle for exactly one file. Existing files are truncated
/// from offset 0, so the last writer of a name wins.
pub struct FileWriter {
    file: File,
    path: PathBuf,
    expected_size: u64,
    bytes_written: u64,
}

impl FileWriter {
    /// Create a new file writer
    pub async fn create(path: &Path, expected_size: u64) -> io::Result<Self> {
        let file = File::create(path).await?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            expected_size,
            bytes_written: 0,
        })
    }

    /// Write as much of `data` as still belongs to this file.
    ///
    /// Returns the number of bytes consumed from `data`.
    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<usize> {
        let take = (data.len() as u64).min(self.remaining()) as usize;
        self.file.write_all(&data[..take]).await?;
        self.bytes_written += take as u64;
        Ok(take)
    }

    /// Payload bytes still expected.
    pub fn remaining(&self) -> u64 {
        self.expected_size - self.bytes_written
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Flush, sync and close a fully received file.
    pub async fn finalize(mut self) -> io::Result<ReceivedFile> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(self.into_received())
    }

    /// Close a file whose payload stopped early, keeping what arrived.
    pub async fn abandon(mut self) -> io::Result<ReceivedFile> {
        self.file.flush().await?;
        Ok(self.into_received())
    }

    fn into_received(self) -> ReceivedFile {
        ReceivedFile {
            path: self.path,
            expected: self.expected_size,
            written: self.bytes_written,
        }
    }
}
