//! Leading header block inspection.
//!
//! Reads a client stream line by line until the blank line that ends the
//! header block (or end-of-stream) and extracts the `X-Tenant-ID` value.
//!
//! - Lines end with CRLF; a bare LF is accepted and a trailing CR stripped.
//! - A whitespace-only line ends the block.
//! - The prefix match is case-sensitive; the last matching line wins.
//! - A final unterminated line before EOF is still inspected.
//!
//! Reads happen in chunks, so bytes past the terminator may already have been
//! pulled off the socket. They are returned as [`HeaderBlock::leftover`] and
//! the relay forwards them before anything else.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Routing header prefix, including the separator space.
pub const TENANT_HEADER_PREFIX: &str = "X-Tenant-ID: ";

/// Default limit on the size of the header block.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

/// Bytes requested from the socket per read.
const READ_CHUNK_SIZE: usize = 4096;

/// Parsed header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBlock {
    /// Value of the last `X-Tenant-ID` line, if any.
    pub tenant_id: Option<String>,
    /// Number of bytes consumed by the header block, terminator included.
    pub header_len: usize,
    /// Body bytes read past the terminator.
    pub leftover: Vec<u8>,
    /// False when the block ended at EOF rather than at a blank line.
    pub terminated: bool,
}

/// Result of header inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderResult {
    /// Header block read to its end.
    Complete(HeaderBlock),
    /// Block exceeded the configured size limit.
    TooLarge,
    /// Block did not complete within the configured timeout.
    Timeout,
    /// The tenant header value is not valid UTF-8.
    InvalidEncoding,
    /// I/O error while reading.
    IoError(String),
}

/// Configuration for header inspection.
#[derive(Debug, Clone)]
pub struct HeaderConfig {
    /// Optional limit on the time to read the whole block. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Maximum header block size.
    pub max_bytes: usize,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            max_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

/// Reads and scans the leading header block of a client stream.
#[derive(Debug, Clone, Default)]
pub struct HeaderInspector {
    config: HeaderConfig,
}

impl HeaderInspector {
    /// Create an inspector with default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an inspector with the given limits.
    pub fn with_config(config: HeaderConfig) -> Self {
        Self { config }
    }

    /// Read the header block from `stream`.
    pub async fn inspect<R: AsyncRead + Unpin>(&self, stream: &mut R) -> HeaderResult {
        match self.config.timeout {
            Some(limit) => match timeout(limit, self.read_header_block(stream)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout_ms = limit.as_millis() as u64, "Header read timeout");
                    HeaderResult::Timeout
                }
            },
            None => self.read_header_block(stream).await,
        }
    }

    async fn read_header_block<R: AsyncRead + Unpin>(&self, stream: &mut R) -> HeaderResult {
        let mut scan = HeaderScan::default();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let n = match stream.read(&mut chunk).await {
                Ok(n) => n,
                Err(e) => return HeaderResult::IoError(e.to_string()),
            };

            if n == 0 {
                debug!(bytes = scan.buf.len(), "EOF before end of header block");
                return scan.finish_at_eof();
            }

            scan.buf.extend_from_slice(&chunk[..n]);

            if let Some(end) = scan.advance() {
                if end > self.config.max_bytes {
                    return HeaderResult::TooLarge;
                }
                return scan.finish(end);
            }

            if scan.buf.len() > self.config.max_bytes {
                debug!(bytes = scan.buf.len(), "Header block too large");
                return HeaderResult::TooLarge;
            }
        }
    }
}

/// Incremental line scanner over the bytes read so far.
#[derive(Debug, Default)]
struct HeaderScan {
    buf: Vec<u8>,
    /// Start of the next line not yet inspected.
    cursor: usize,
    /// Raw value of the last tenant header seen.
    tenant_id: Option<Vec<u8>>,
}

impl HeaderScan {
    /// Inspect every complete line. Returns the offset just past the blank
    /// line once it has been seen.
    fn advance(&mut self) -> Option<usize> {
        while let Some(pos) = self.buf[self.cursor..].iter().position(|&b| b == b'\n') {
            let start = self.cursor;
            let end = start + pos;
            self.cursor = end + 1;

            if self.inspect_line(start, end) {
                return Some(self.cursor);
            }
        }
        None
    }

    /// Inspect `buf[start..end]`; returns true for a blank line.
    fn inspect_line(&mut self, start: usize, end: usize) -> bool {
        let line = strip_cr(&self.buf[start..end]);
        if line.iter().all(u8::is_ascii_whitespace) {
            return true;
        }
        if let Some(value) = line.strip_prefix(TENANT_HEADER_PREFIX.as_bytes()) {
            self.tenant_id = Some(value.to_vec());
        }
        false
    }

    fn finish(self, end: usize) -> HeaderResult {
        let leftover = self.buf[end..].to_vec();
        self.into_block(end, leftover, true)
    }

    fn finish_at_eof(mut self) -> HeaderResult {
        let len = self.buf.len();
        if self.cursor < len {
            let start = self.cursor;
            self.cursor = len;
            self.inspect_line(start, len);
        }
        self.into_block(len, Vec::new(), false)
    }

    fn into_block(self, header_len: usize, leftover: Vec<u8>, terminated: bool) -> HeaderResult {
        let tenant_id = match self.tenant_id.map(String::from_utf8).transpose() {
            Ok(id) => id,
            Err(_) => return HeaderResult::InvalidEncoding,
        };

        HeaderResult::Complete(HeaderBlock {
            tenant_id,
            header_len,
            leftover,
            terminated,
        })
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}
