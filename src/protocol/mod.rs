//! Wire framing for pushed files.
//!
//! Every file on the wire is a text header followed by its raw bytes:
//!
//! ```text
//! <name><SP><decimal-size>\n<exactly decimal-size raw bytes>
//! ```
//!
//! Headers repeat back to back with no transfer-level terminator. Names may
//! contain spaces, so the size is always taken from the *last* space.

use bytes::BytesMut;
use thiserror::Error;

/// Longest accepted header line, newline included.
pub const MAX_HEADER_LEN: usize = 4096;

/// Errors raised while building or parsing a header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("header has no space between name and size")]
    MissingSeparator,

    #[error("invalid file size {0:?}")]
    InvalidSize(String),

    #[error("file name is empty or not valid UTF-8")]
    InvalidName,

    #[error("file name {0:?} contains a newline")]
    NewlineInName(String),

    #[error("unsafe file name {0:?}")]
    UnsafeName(String),

    #[error("header exceeds {limit} bytes without a newline")]
    HeaderTooLong { limit: usize },
}

/// Name and size announcing one file on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub size: u64,
}

impl Header {
    /// Build a header, rejecting names that cannot be framed.
    pub fn new(name: impl Into<String>, size: u64) -> Result<Self, ProtocolError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ProtocolError::InvalidName);
        }
        if name.contains('\n') {
            return Err(ProtocolError::NewlineInName(name));
        }
        Ok(Self { name, size })
    }

    /// Serialize as `"<name> <size>\n"`.
    pub fn encode(&self) -> Vec<u8> {
        format!("{} {}\n", self.name, self.size).into_bytes()
    }

    /// Parse a header line with its trailing newline already stripped.
    pub fn parse(line: &[u8]) -> Result<Self, ProtocolError> {
        let split = line
            .iter()
            .rposition(|&b| b == b' ')
            .ok_or(ProtocolError::MissingSeparator)?;

        let size = parse_size(&line[split + 1..])?;
        let name = std::str::from_utf8(&line[..split]).map_err(|_| ProtocolError::InvalidName)?;

        Self::new(name, size)
    }
}

// `u64::from_str` accepts a leading '+', the wire format does not.
fn parse_size(raw: &[u8]) -> Result<u64, ProtocolError> {
    let invalid = || ProtocolError::InvalidSize(String::from_utf8_lossy(raw).into_owned());

    if raw.is_empty() || !raw.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }

    std::str::from_utf8(raw)
        .map_err(|_| invalid())?
        .parse::<u64>()
        .map_err(|_| invalid())
}

/// Incremental header recognizer over a connection's receive buffer.
///
/// Remembers how far the buffer has already been searched so repeated
/// partial reads never rescan the same bytes.
#[derive(Debug, Default)]
pub struct HeaderDecoder {
    scanned: usize,
}

impl HeaderDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split a complete header off the front of `buf`.
    ///
    /// Returns `Ok(None)` while no newline has arrived. On success the header
    /// line is removed from `buf`; anything after the newline stays in place
    /// as carry-over for the payload (or the next header).
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Header>, ProtocolError> {
        let start = self.scanned.min(buf.len());

        match buf[start..].iter().position(|&b| b == b'\n') {
            Some(offset) => {
                let newline = start + offset;
                if newline + 1 > MAX_HEADER_LEN {
                    return Err(ProtocolError::HeaderTooLong {
                        limit: MAX_HEADER_LEN,
                    });
                }

                let line = buf.split_to(newline + 1);
                self.scanned = 0;
                Header::parse(&line[..newline]).map(Some)
            }
            None if buf.len() >= MAX_HEADER_LEN => Err(ProtocolError::HeaderTooLong {
                limit: MAX_HEADER_LEN,
            }),
            None => {
                self.scanned = buf.len();
                Ok(None)
            }
        }
    }
}

/// Reject names that could escape the destination directory.
///
/// Only flat base names are transferred, so any separator or parent
/// reference is refused outright.
pub fn sanitize_name(name: &str) -> Result<&str, ProtocolError> {
    let unsafe_name = || ProtocolError::UnsafeName(name.to_string());

    if name.is_empty() {
        return Err(ProtocolError::InvalidName);
    }
    if name == "." || name == ".." {
        return Err(unsafe_name());
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(unsafe_name());
    }

    Ok(name)
}
