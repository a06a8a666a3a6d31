//! Per-connection session handling.
//!
//! A [`ClientSession`] is created for every accepted connection. It runs the
//! router and, if a tenant resolves, the relay. Every failure stays inside
//! the session; nothing is propagated to the accept loop.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::relay::StreamRelay;
use super::router::{RequestRouter, RouteOutcome};
use super::server::ServerStats;

/// Shared collaborators for session workers.
pub struct SessionContext {
    pub router: RequestRouter,
    pub relay: StreamRelay,
    pub stats: Arc<ServerStats>,
}

/// One accepted client connection.
pub struct ClientSession {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl ClientSession {
    /// Create a session for an accepted connection.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr }
    }

    /// Route the session and relay it to its tenant's upstream.
    ///
    /// The client socket is closed when this returns, on every path.
    pub async fn run(mut self, ctx: &SessionContext) {
        let stats = &ctx.stats;

        let (tenant, leftover) = match ctx.router.resolve(&mut self.stream).await {
            RouteOutcome::Resolved { tenant, leftover } => {
                stats.tenants_resolved.fetch_add(1, Ordering::Relaxed);
                (tenant, leftover)
            }
            RouteOutcome::NotFound { .. } => {
                stats.tenants_not_found.fetch_add(1, Ordering::Relaxed);
                return;
            }
            RouteOutcome::Malformed { .. } => {
                stats.headers_malformed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let ClientSession { stream, peer_addr } = self;

        let result = ctx
            .relay
            .relay(stream, leftover, &tenant.target_host, tenant.target_port)
            .await;

        match result {
            Ok(outcome) => {
                stats.upstream_connected.fetch_add(1, Ordering::Relaxed);
                stats
                    .bytes_to_upstream
                    .fetch_add(outcome.to_upstream.bytes, Ordering::Relaxed);
                stats
                    .bytes_to_client
                    .fetch_add(outcome.to_client.bytes, Ordering::Relaxed);

                let failed_directions = [&outcome.to_upstream, &outcome.to_client]
                    .iter()
                    .filter(|d| d.error.is_some())
                    .count() as u64;
                stats
                    .relay_errors
                    .fetch_add(failed_directions, Ordering::Relaxed);

                debug!(
                    peer_addr = %peer_addr,
                    tenant_id = %tenant.tenant_id,
                    bytes_to_upstream = outcome.to_upstream.bytes,
                    bytes_to_client = outcome.to_client.bytes,
                    clean = outcome.is_clean(),
                    "Session closed"
                );
            }
            Err(e) => {
                stats.upstream_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    peer_addr = %peer_addr,
                    tenant_id = %tenant.tenant_id,
                    error = %e,
                    "Upstream unreachable"
                );
            }
        }
    }
}
