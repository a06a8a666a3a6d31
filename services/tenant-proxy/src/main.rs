//! Tenant proxy
//!
//! Multi-tenant TCP forwarder. Each client connection names its tenant in an
//! `X-Tenant-ID` header line; the proxy looks the tenant up in its directory
//! and relays the connection to that tenant's upstream.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tenant_proxy::{config::Config, ProxyServer};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to TENANT_PROXY_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tenant proxy");

    let directory = Arc::new(config.load_directory()?);
    info!(
        listen_addr = %config.listen_addr,
        tenant_count = directory.len(),
        max_workers = config.max_workers,
        grace_period_secs = config.grace_period.as_secs(),
        "Configuration loaded"
    );
    debug!(tenant_ids = ?directory.tenant_ids(), "Tenant directory ready");

    let server = ProxyServer::new(config.server_config(), directory);
    let report = server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        })
        .await?;

    info!(
        completed = report.completed,
        forced = report.forced,
        "Tenant proxy shutdown complete"
    );
    Ok(())
}
