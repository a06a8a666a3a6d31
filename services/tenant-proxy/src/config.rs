//! Tenant proxy configuration (env-driven).

use std::net::SocketAddr;
use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};

use crate::directory::{TenantDirectory, TenantRecord};
use crate::proxy::{
    HeaderConfig, RelayConfig, ServerConfig, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_HEADER_BYTES,
    DEFAULT_MAX_WORKERS,
};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_GRACE_PERIOD_SECS: u64 = 60;

/// Smallest header block limit that still fits a routing line.
const MIN_HEADER_BYTES: usize = 64;

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the proxy listens on.
    pub listen_addr: SocketAddr,

    /// JSON tenant directory file.
    pub directory_file: Option<PathBuf>,

    /// Inline tenant entries (`id=host:port,...`).
    pub inline_tenants: Option<String>,

    /// Worker pool size.
    pub max_workers: usize,

    /// Time in-flight sessions get to finish on shutdown.
    pub grace_period: Duration,

    /// Optional upstream connect timeout.
    pub connect_timeout: Option<Duration>,

    /// Optional header block read timeout.
    pub header_timeout: Option<Duration>,

    /// Header block size limit.
    pub max_header_bytes: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr: SocketAddr = lookup("TENANT_PROXY_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .context("TENANT_PROXY_LISTEN_ADDR must be a socket address (example: 0.0.0.0:8080).")?;

        let directory_file = lookup("TENANT_PROXY_DIRECTORY_FILE").map(PathBuf::from);
        let inline_tenants = lookup("TENANT_PROXY_TENANTS").filter(|v| !v.trim().is_empty());

        if directory_file.is_none() && inline_tenants.is_none() {
            bail!("Missing tenant directory. Set TENANT_PROXY_DIRECTORY_FILE or TENANT_PROXY_TENANTS.");
        }

        let max_workers: usize = lookup("TENANT_PROXY_MAX_WORKERS")
            .map(|v| v.parse())
            .transpose()
            .context("TENANT_PROXY_MAX_WORKERS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_WORKERS)
            .max(1);

        let grace_period_secs: u64 = lookup("TENANT_PROXY_GRACE_PERIOD_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("TENANT_PROXY_GRACE_PERIOD_SECS must be an integer (seconds).")?
            .unwrap_or(DEFAULT_GRACE_PERIOD_SECS);

        let connect_timeout = lookup("TENANT_PROXY_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("TENANT_PROXY_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .map(Duration::from_millis);

        let header_timeout = lookup("TENANT_PROXY_HEADER_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("TENANT_PROXY_HEADER_TIMEOUT_MS must be an integer (milliseconds).")?
            .map(Duration::from_millis);

        let max_header_bytes: usize = lookup("TENANT_PROXY_MAX_HEADER_BYTES")
            .map(|v| v.parse())
            .transpose()
            .context("TENANT_PROXY_MAX_HEADER_BYTES must be an integer.")?
            .unwrap_or(DEFAULT_MAX_HEADER_BYTES);
        if max_header_bytes < MIN_HEADER_BYTES {
            bail!("TENANT_PROXY_MAX_HEADER_BYTES must be at least {MIN_HEADER_BYTES}.");
        }

        let log_level = lookup("TENANT_PROXY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            directory_file,
            inline_tenants,
            max_workers,
            grace_period: Duration::from_secs(grace_period_secs),
            connect_timeout,
            header_timeout,
            max_header_bytes,
            log_level,
        })
    }

    /// Build the tenant directory from the configured sources.
    ///
    /// File and inline entries are merged; a tenant id defined in both is an
    /// error.
    pub fn load_directory(&self) -> Result<TenantDirectory> {
        let mut records: Vec<TenantRecord> = Vec::new();

        if let Some(path) = &self.directory_file {
            records.extend(
                TenantDirectory::load_records(path)
                    .with_context(|| format!("Failed to load tenants from {}", path.display()))?,
            );
        }

        if let Some(inline) = &self.inline_tenants {
            records.extend(
                TenantDirectory::parse_inline(inline).context("Invalid TENANT_PROXY_TENANTS")?,
            );
        }

        TenantDirectory::new(records).context("Invalid tenant directory")
    }

    /// Runtime settings for [`ProxyServer`](crate::ProxyServer).
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.listen_addr,
            max_workers: self.max_workers,
            grace_period: self.grace_period,
            header: HeaderConfig {
                timeout: self.header_timeout,
                max_bytes: self.max_header_bytes,
            },
            relay: RelayConfig {
                connect_timeout: self.connect_timeout,
                buffer_size: DEFAULT_BUFFER_SIZE,
            },
        }
    }
}
