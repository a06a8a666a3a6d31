//! Tenant routing decisions.
//!
//! The router reads the client's header block, resolves the `X-Tenant-ID`
//! value against the [`TenantDirectory`] and, when no tenant can be
//! resolved, answers the client with a fixed 404 status line. No upstream is
//! contacted for an unresolved session.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::header::{HeaderBlock, HeaderConfig, HeaderInspector, HeaderResult};
use crate::directory::{TenantDirectory, TenantRecord};

/// Response written to clients whose tenant cannot be resolved.
pub const NOT_FOUND_RESPONSE: &[u8] = b"HTTP/1.1 404 Not Found\r\n\r\n";

/// Why a session could not be routed to a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFoundReason {
    /// No `X-Tenant-ID` line before the end of the header block.
    MissingHeader,
    /// The tenant id is not in the directory.
    UnknownTenant(String),
}

impl std::fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingHeader => write!(f, "missing tenant header"),
            Self::UnknownTenant(id) => write!(f, "unknown tenant {id:?}"),
        }
    }
}

/// Result of routing a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Tenant resolved. `leftover` holds body bytes already read past the
    /// header block; they go upstream before anything else.
    Resolved {
        tenant: TenantRecord,
        leftover: Vec<u8>,
    },
    /// Header absent or tenant unknown.
    NotFound { reason: NotFoundReason },
    /// Header block could not be read or decoded.
    Malformed { reason: String },
}

impl RouteOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }
}

/// Resolves client sessions to tenants.
pub struct RequestRouter {
    directory: Arc<TenantDirectory>,
    inspector: HeaderInspector,
}

impl RequestRouter {
    /// Create a router with default header settings.
    pub fn new(directory: Arc<TenantDirectory>) -> Self {
        Self::with_config(directory, HeaderConfig::default())
    }

    /// Create a router with the given header limits.
    pub fn with_config(directory: Arc<TenantDirectory>, header_config: HeaderConfig) -> Self {
        Self {
            directory,
            inspector: HeaderInspector::with_config(header_config),
        }
    }

    /// Read the header block from `stream` and resolve its tenant.
    ///
    /// On `NotFound` or `Malformed` the 404 response has already been written
    /// to `stream` when this returns.
    pub async fn resolve<S>(&self, stream: &mut S) -> RouteOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let header = self.inspector.inspect(stream).await;
        if let HeaderResult::Complete(block) = &header {
            debug!(
                header_bytes = block.header_len,
                terminated = block.terminated,
                "Header block read"
            );
        }
        let outcome = self.decide(header);

        match &outcome {
            RouteOutcome::Resolved { tenant, leftover } => {
                debug!(
                    tenant_id = %tenant.tenant_id,
                    upstream = %tenant.upstream(),
                    leftover_bytes = leftover.len(),
                    "Tenant resolved"
                );
            }
            RouteOutcome::NotFound { reason } => {
                debug!(reason = %reason, "Tenant not found");
                reject(stream).await;
            }
            RouteOutcome::Malformed { reason } => {
                debug!(reason = %reason, "Malformed header block");
                reject(stream).await;
            }
        }

        outcome
    }

    /// Map an inspected header block to a routing outcome.
    pub fn decide(&self, header: HeaderResult) -> RouteOutcome {
        let block = match header {
            HeaderResult::Complete(block) => block,
            HeaderResult::TooLarge => {
                return RouteOutcome::Malformed {
                    reason: "header block too large".to_string(),
                }
            }
            HeaderResult::Timeout => {
                return RouteOutcome::Malformed {
                    reason: "header block timeout".to_string(),
                }
            }
            HeaderResult::InvalidEncoding => {
                return RouteOutcome::Malformed {
                    reason: "tenant header is not valid UTF-8".to_string(),
                }
            }
            HeaderResult::IoError(e) => {
                return RouteOutcome::Malformed {
                    reason: format!("read error: {e}"),
                }
            }
        };

        let HeaderBlock {
            tenant_id, leftover, ..
        } = block;

        let Some(tenant_id) = tenant_id else {
            return RouteOutcome::NotFound {
                reason: NotFoundReason::MissingHeader,
            };
        };

        match self.directory.lookup(&tenant_id) {
            Some(tenant) => RouteOutcome::Resolved {
                tenant: tenant.clone(),
                leftover,
            },
            None => RouteOutcome::NotFound {
                reason: NotFoundReason::UnknownTenant(tenant_id),
            },
        }
    }
}

/// Write the 404 status line. Write failures only mean the client is gone.
async fn reject<S: AsyncWrite + Unpin>(stream: &mut S) {
    let result = async {
        stream.write_all(NOT_FOUND_RESPONSE).await?;
        stream.flush().await?;
        stream.shutdown().await
    }
    .await;

    if let Err(e) = result {
        debug!(error = %e, "Failed to write 404 response");
    }
}
