//! Upstream dialing and bidirectional byte relay.
//!
//! Each direction runs its own copy loop with a bounded buffer. When one
//! direction reaches EOF or fails, it half-closes its destination and stops;
//! the other direction keeps running. The relay completes once both loops
//! have ended.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::RelayError;

/// Copy buffer size per direction.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream connect timeout. `None` leaves the connect attempt unbounded.
    pub connect_timeout: Option<Duration>,
    /// Copy buffer size per direction.
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// How one copy direction ended.
#[derive(Debug, Default)]
pub struct DirectionOutcome {
    /// Bytes written to the destination.
    pub bytes: u64,
    /// Error that ended the direction, if it did not end at EOF.
    pub error: Option<io::Error>,
}

/// Result of a completed relay.
#[derive(Debug)]
pub struct RelayOutcome {
    pub to_upstream: DirectionOutcome,
    pub to_client: DirectionOutcome,
}

impl RelayOutcome {
    /// True if both directions ended at EOF.
    pub fn is_clean(&self) -> bool {
        self.to_upstream.error.is_none() && self.to_client.error.is_none()
    }
}

/// Dials upstreams and relays sessions to them.
#[derive(Debug, Clone, Default)]
pub struct StreamRelay {
    config: RelayConfig,
}

impl StreamRelay {
    /// Create a relay with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a relay with the given settings.
    pub fn with_config(config: RelayConfig) -> Self {
        Self { config }
    }

    /// Open a connection to `host:port`. No retry is attempted.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, RelayError> {
        let connect = TcpStream::connect((host, port));

        let result = match self.config.connect_timeout {
            Some(limit) => match timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
            },
            None => connect.await,
        };

        result.map_err(|source| RelayError::UpstreamUnreachable {
            upstream: format!("{host}:{port}"),
            source,
        })
    }

    /// Connect to the upstream and relay `client` to it until both
    /// directions end.
    ///
    /// `leftover` holds client bytes already read past the header block;
    /// they are sent upstream first. If the upstream cannot be reached the
    /// client is dropped without any bytes written to it.
    pub async fn relay(
        &self,
        client: TcpStream,
        leftover: Vec<u8>,
        host: &str,
        port: u16,
    ) -> Result<RelayOutcome, RelayError> {
        let upstream = self.connect(host, port).await?;
        debug!(upstream = %format!("{host}:{port}"), "Connected to upstream");

        let pair = RelayPair::new(client, upstream);
        Ok(pair.run(leftover, self.config.buffer_size).await)
    }
}

/// A client connection and its upstream connection.
///
/// The pair owns both streams. Each copy direction only half-closes the
/// write side it owns; the sockets themselves are released when the pair is
/// dropped, which happens exactly once on every exit path, including task
/// abort during forced shutdown.
pub struct RelayPair {
    client: TcpStream,
    upstream: TcpStream,
}

impl RelayPair {
    /// Pair a client with its connected upstream.
    pub fn new(client: TcpStream, upstream: TcpStream) -> Self {
        Self { client, upstream }
    }

    /// Run both copy loops concurrently and close the pair.
    pub async fn run(mut self, leftover: Vec<u8>, buffer_size: usize) -> RelayOutcome {
        let (to_upstream, to_client) = {
            let (mut client_read, mut client_write) = self.client.split();
            let (mut upstream_read, mut upstream_write) = self.upstream.split();

            tokio::join!(
                copy_direction(&mut client_read, &mut upstream_write, &leftover, buffer_size),
                copy_direction(&mut upstream_read, &mut client_write, &[], buffer_size),
            )
        };

        if let Some(e) = &to_upstream.error {
            warn!(error = %e, bytes = to_upstream.bytes, "Client to upstream copy failed");
        }
        if let Some(e) = &to_client.error {
            warn!(error = %e, bytes = to_client.bytes, "Upstream to client copy failed");
        }

        RelayOutcome {
            to_upstream,
            to_client,
        }
    }
}

/// Copy `prefix` and then everything from `reader` into `writer`, then
/// half-close `writer`.
async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    prefix: &[u8],
    buffer_size: usize,
) -> DirectionOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0u64;

    let result = async {
        if !prefix.is_empty() {
            writer.write_all(prefix).await?;
            bytes += prefix.len() as u64;
        }

        let mut buf = vec![0u8; buffer_size.max(1)];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            bytes += n as u64;
        }
        Ok::<(), io::Error>(())
    }
    .await;

    let mut error: Option<io::Error> = result.err();

    // Flushes and signals EOF to the peer even after a failed read.
    if let Err(e) = writer.shutdown().await {
        if error.is_none() && e.kind() != io::ErrorKind::NotConnected {
            error = Some(e);
        }
    }

    DirectionOutcome { bytes, error }
}
