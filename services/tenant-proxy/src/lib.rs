pub mod config;
pub mod directory;
pub mod error;
pub mod proxy;

pub use directory::{DirectoryFile, TenantDirectory, TenantRecord};
pub use error::{DirectoryError, ProxyError, RelayError, Result};
pub use proxy::{
    Accepted, ConnectionAcceptor, HeaderConfig, HeaderInspector, HeaderResult, NotFoundReason,
    ProxyServer, RelayConfig, RelayOutcome, RequestRouter, RouteOutcome, ServerConfig,
    ServerState, ServerStats, ShutdownReport, StreamRelay, NOT_FOUND_RESPONSE,
};
