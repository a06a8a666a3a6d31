//! Error types for the tenant proxy.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type for proxy lifecycle operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Server-level errors.
///
/// Per-session failures (unknown tenant, unreachable upstream, relay I/O)
/// never surface here; they are contained in the worker that hit them.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind the listening socket.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// `start()` was called on a server that is not stopped.
    #[error("server already started (state: {0})")]
    AlreadyStarted(&'static str),

    /// The accept loop ended abnormally while shutting down.
    #[error("shutdown error: {0}")]
    Shutdown(String),
}

/// Errors raised while building a [`TenantDirectory`](crate::TenantDirectory).
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("duplicate tenant id: {0}")]
    DuplicateTenant(String),

    #[error("tenant id must not be empty")]
    EmptyTenantId,

    #[error("tenant {tenant_id}: target host must not be empty")]
    EmptyHost { tenant_id: String },

    #[error("tenant {tenant_id}: target port must be in 1..=65535")]
    InvalidPort { tenant_id: String },

    /// An inline `id=host:port` entry could not be parsed.
    #[error("invalid tenant entry {entry:?}: {reason}")]
    InvalidEntry { entry: String, reason: &'static str },

    #[error("failed to read directory file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse directory file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that end a relay before any bytes are copied.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The upstream could not be reached (refused, DNS failure, timeout).
    #[error("upstream {upstream} unreachable: {source}")]
    UpstreamUnreachable {
        upstream: String,
        #[source]
        source: std::io::Error,
    },
}
