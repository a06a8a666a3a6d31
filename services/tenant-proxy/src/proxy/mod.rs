//! Tenant-routed TCP forwarding.
//!
//! This module provides:
//! - Listening socket management
//! - Header block inspection for the `X-Tenant-ID` routing header
//! - Tenant resolution with a fixed 404 for unknown tenants
//! - Full-duplex relay to the tenant's upstream
//! - Server lifecycle with bounded workers and graceful shutdown
//!
//! ## Architecture
//!
//! ```text
//! Client -> ConnectionAcceptor -> RequestRouter -> StreamRelay -> Upstream
//!                                      |
//!                               404 Not Found (unknown tenant)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use tenant_proxy::{ProxyServer, ServerConfig, TenantDirectory, TenantRecord};
//!
//! let directory = TenantDirectory::new(vec![TenantRecord::new("t1", "10.0.0.5", 9000)])?;
//! let server = ProxyServer::new(ServerConfig::new("0.0.0.0:8080".parse()?), Arc::new(directory));
//! server.run_until(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! ```

mod acceptor;
mod header;
mod relay;
mod router;
mod server;
mod session;

pub use acceptor::{Accepted, AcceptorStopper, ConnectionAcceptor};
pub use header::{
    HeaderBlock, HeaderConfig, HeaderInspector, HeaderResult, DEFAULT_MAX_HEADER_BYTES,
    TENANT_HEADER_PREFIX,
};
pub use relay::{
    DirectionOutcome, RelayConfig, RelayOutcome, RelayPair, StreamRelay, DEFAULT_BUFFER_SIZE,
};
pub use router::{NotFoundReason, RequestRouter, RouteOutcome, NOT_FOUND_RESPONSE};
pub use server::{
    ProxyServer, ServerConfig, ServerState, ServerStats, ShutdownReport, DEFAULT_GRACE_PERIOD,
    DEFAULT_MAX_WORKERS,
};
pub use session::{ClientSession, SessionContext};
