//! Proxy server lifecycle.
//!
//! ```text
//! Stopped --start()--> Starting --bound--> Running --stop()--> Stopping --> Stopped
//!                         |
//!                         +--bind error--> Stopped
//! ```
//!
//! While running, an accept loop hands every connection to a worker task.
//! Workers wait on a semaphore, so at most `max_workers` sessions are served
//! at once and the rest queue. `stop()` closes the listener, waits for the
//! workers up to the grace period and aborts whatever is left.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use super::acceptor::{Accepted, AcceptorStopper, ConnectionAcceptor};
use super::header::HeaderConfig;
use super::relay::{RelayConfig, StreamRelay};
use super::router::RequestRouter;
use super::session::{ClientSession, SessionContext};
use crate::directory::TenantDirectory;
use crate::error::{ProxyError, Result};

/// Default worker pool size.
pub const DEFAULT_MAX_WORKERS: usize = 10;

/// Default time in-flight sessions get to finish during shutdown.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Pause after a failed accept to avoid a tight loop on persistent errors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrently served sessions.
    pub max_workers: usize,
    /// Shutdown grace period before workers are aborted.
    pub grace_period: Duration,
    /// Header inspection settings.
    pub header: HeaderConfig,
    /// Upstream relay settings.
    pub relay: RelayConfig,
}

impl ServerConfig {
    /// Create a config with default limits for `bind_addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_workers: DEFAULT_MAX_WORKERS,
            grace_period: DEFAULT_GRACE_PERIOD,
            header: HeaderConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Sessions currently holding a worker slot.
    pub connections_active: AtomicU64,
    /// Accepted connections whose worker ended, served or not. Includes
    /// workers aborted while still queued for a slot.
    pub connections_closed: AtomicU64,
    /// Failed accept calls.
    pub accept_errors: AtomicU64,
    /// Sessions routed to a tenant.
    pub tenants_resolved: AtomicU64,
    /// Sessions answered with 404 (missing or unknown tenant).
    pub tenants_not_found: AtomicU64,
    /// Sessions answered with 404 (unreadable header block).
    pub headers_malformed: AtomicU64,
    /// Upstream connection successes.
    pub upstream_connected: AtomicU64,
    /// Upstream connection failures.
    pub upstream_failed: AtomicU64,
    /// Copy directions that ended with an I/O error.
    pub relay_errors: AtomicU64,
    /// Bytes relayed client to upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed upstream to client.
    pub bytes_to_client: AtomicU64,
    /// Workers aborted after the grace period.
    pub workers_forced: AtomicU64,
}

/// How in-flight workers ended during `stop()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that finished on their own.
    pub completed: usize,
    /// Workers aborted after the grace period.
    pub forced: usize,
}

/// Handles for a running accept loop.
struct RunningServer {
    stopper: AcceptorStopper,
    accept_loop: JoinHandle<JoinSet<()>>,
}

/// Multi-tenant TCP forwarder.
pub struct ProxyServer {
    config: ServerConfig,
    directory: Arc<TenantDirectory>,
    stats: Arc<ServerStats>,
    state: watch::Sender<ServerState>,
    running: tokio::sync::Mutex<Option<RunningServer>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ProxyServer {
    /// Create a stopped server for `directory`.
    pub fn new(config: ServerConfig, directory: Arc<TenantDirectory>) -> Self {
        let (state, _) = watch::channel(ServerState::Stopped);
        Self {
            config,
            directory,
            stats: Arc::new(ServerStats::default()),
            state,
            running: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind the listening socket and start accepting.
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - the address is unavailable; the server stays stopped.
    /// * `ProxyError::AlreadyStarted` - the server is not stopped.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;

        let current = self.state();
        if current != ServerState::Stopped {
            return Err(ProxyError::AlreadyStarted(current.as_str()));
        }

        self.transition(ServerState::Starting);

        let acceptor = match ConnectionAcceptor::start(self.config.bind_addr).await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                error!(bind_addr = %self.config.bind_addr, error = %e, "Failed to start");
                self.transition(ServerState::Stopped);
                return Err(e);
            }
        };

        let local_addr = acceptor.local_addr();
        let stopper = acceptor.stopper();

        let ctx = Arc::new(SessionContext {
            router: RequestRouter::with_config(
                Arc::clone(&self.directory),
                self.config.header.clone(),
            ),
            relay: StreamRelay::with_config(self.config.relay.clone()),
            stats: Arc::clone(&self.stats),
        });
        let permits = Arc::new(Semaphore::new(self.config.max_workers.max(1)));

        let accept_loop = tokio::spawn(run_accept_loop(acceptor, ctx, permits));

        *running = Some(RunningServer {
            stopper,
            accept_loop,
        });
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(local_addr);
        self.transition(ServerState::Running);

        info!(
            bind_addr = %local_addr,
            max_workers = self.config.max_workers,
            tenant_count = self.directory.len(),
            "Proxy server started"
        );

        Ok(local_addr)
    }

    /// Stop accepting, wait for in-flight sessions up to the grace period and
    /// abort the rest.
    ///
    /// The listening socket is closed before this starts waiting on workers.
    /// Calling `stop()` while stopping or stopped is a no-op that returns an
    /// empty report.
    ///
    /// # Errors
    /// * `ProxyError::Shutdown` - the accept loop task panicked.
    pub async fn stop(&self) -> Result<ShutdownReport> {
        if matches!(self.state(), ServerState::Stopping | ServerState::Stopped) {
            debug!(state = %self.state(), "Stop ignored");
            return Ok(ShutdownReport::default());
        }

        let mut running = self.running.lock().await;
        let Some(server) = running.take() else {
            return Ok(ShutdownReport::default());
        };

        self.transition(ServerState::Stopping);
        info!("Stopping proxy server");

        server.stopper.stop();
        let mut workers = match server.accept_loop.await {
            Ok(workers) => workers,
            Err(e) => {
                self.finish_stop();
                return Err(ProxyError::Shutdown(e.to_string()));
            }
        };

        info!(
            in_flight = workers.len(),
            grace_period_secs = self.config.grace_period.as_secs(),
            "Listener closed, waiting for sessions"
        );

        let mut report = ShutdownReport::default();
        let drained = timeout(
            self.config.grace_period,
            drain_workers(&mut workers, &mut report),
        )
        .await;

        if drained.is_err() {
            warn!(remaining = workers.len(), "Grace period elapsed, aborting sessions");
            workers.abort_all();
            drain_workers(&mut workers, &mut report).await;
        }

        self.stats
            .workers_forced
            .fetch_add(report.forced as u64, Ordering::Relaxed);
        self.finish_stop();

        info!(
            completed = report.completed,
            forced = report.forced,
            "Proxy server stopped"
        );

        Ok(report)
    }

    /// Start, run until `signal` resolves, then stop.
    pub async fn run_until<F>(&self, signal: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        info!("Shutdown requested");
        self.stop().await
    }

    fn finish_stop(&self) {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.transition(ServerState::Stopped);
    }

    fn transition(&self, next: ServerState) {
        let previous = self.state.send_replace(next);
        debug!(from = %previous, to = %next, "Server state changed");
    }
}

/// Accept connections until the acceptor stops, then hand back the
/// still-tracked workers.
async fn run_accept_loop(
    mut acceptor: ConnectionAcceptor,
    ctx: Arc<SessionContext>,
    permits: Arc<Semaphore>,
) -> JoinSet<()> {
    let mut workers = JoinSet::new();

    loop {
        while let Some(result) = workers.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "Session worker panicked");
                }
            }
        }

        match acceptor.accept().await {
            Ok(Accepted::Connection { stream, peer_addr }) => {
                ctx.stats
                    .connections_accepted
                    .fetch_add(1, Ordering::Relaxed);

                let ctx = Arc::clone(&ctx);
                let permits = Arc::clone(&permits);

                workers.spawn(
                    async move {
                        let mut guard = WorkerGuard::new(&ctx.stats);

                        // Queued here while the pool is saturated.
                        let Ok(_permit) = permits.acquire_owned().await else {
                            return;
                        };
                        guard.activate();

                        debug!("Handling connection");
                        ClientSession::new(stream, peer_addr).run(&ctx).await;
                    }
                    .instrument(tracing::info_span!("session", peer = %peer_addr)),
                );
            }
            Ok(Accepted::Stopped) => break,
            Err(e) => {
                ctx.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Accept error");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    debug!(in_flight = workers.len(), "Accept loop stopped");
    workers
}

async fn drain_workers(workers: &mut JoinSet<()>, report: &mut ShutdownReport) {
    while let Some(result) = workers.join_next().await {
        match result {
            Ok(()) => report.completed += 1,
            Err(e) if e.is_cancelled() => report.forced += 1,
            Err(e) => {
                error!(error = %e, "Session worker panicked");
                report.completed += 1;
            }
        }
    }
}

/// Keeps `connections_active` and `connections_closed` accurate even when a
/// worker is aborted, queued or not.
struct WorkerGuard<'a> {
    stats: &'a ServerStats,
    active: bool,
}

impl<'a> WorkerGuard<'a> {
    fn new(stats: &'a ServerStats) -> Self {
        Self {
            stats,
            active: false,
        }
    }

    /// The worker holds a pool slot.
    fn activate(&mut self) {
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        self.active = true;
    }
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        }
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}
