//! Tenant directory: tenant id to upstream endpoint.
//!
//! The directory is built once at startup, either from a JSON file or from
//! inline `id=host:port` entries, and is read-only afterwards. Workers share
//! it through an `Arc` without any locking.
//!
//! File format:
//!
//! ```json
//! { "tenants": [ { "tenant_id": "t1", "target_host": "10.0.0.5", "target_port": 9000 } ] }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::DirectoryError;

/// Upstream endpoint for a single tenant.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub target_host: String,
    pub target_port: u16,
}

impl TenantRecord {
    /// Create a record for one tenant.
    pub fn new(tenant_id: impl Into<String>, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            target_host: target_host.into(),
            target_port,
        }
    }

    /// Printable `host:port` form, bracketing IPv6 literals.
    pub fn upstream(&self) -> String {
        if self.target_host.contains(':') {
            format!("[{}]:{}", self.target_host, self.target_port)
        } else {
            format!("{}:{}", self.target_host, self.target_port)
        }
    }

    fn validate(&self) -> Result<(), DirectoryError> {
        if self.tenant_id.is_empty() {
            return Err(DirectoryError::EmptyTenantId);
        }
        if self.target_host.is_empty() {
            return Err(DirectoryError::EmptyHost {
                tenant_id: self.tenant_id.clone(),
            });
        }
        if self.target_port == 0 {
            return Err(DirectoryError::InvalidPort {
                tenant_id: self.tenant_id.clone(),
            });
        }
        Ok(())
    }
}

/// On-disk directory format.
#[derive(Debug, Default, Deserialize)]
pub struct DirectoryFile {
    #[serde(default)]
    pub tenants: Vec<TenantRecord>,
}

/// Immutable mapping from tenant id to [`TenantRecord`].
#[derive(Debug, Default)]
pub struct TenantDirectory {
    by_id: HashMap<String, TenantRecord>,
}

impl TenantDirectory {
    /// Build a directory, rejecting invalid records and duplicate ids.
    pub fn new(records: Vec<TenantRecord>) -> Result<Self, DirectoryError> {
        let mut by_id = HashMap::with_capacity(records.len());

        for record in records {
            record.validate()?;
            if by_id.contains_key(&record.tenant_id) {
                return Err(DirectoryError::DuplicateTenant(record.tenant_id));
            }
            by_id.insert(record.tenant_id.clone(), record);
        }

        Ok(Self { by_id })
    }

    /// Load records from a JSON directory file.
    pub fn load_records(path: &Path) -> Result<Vec<TenantRecord>, DirectoryError> {
        let content = fs::read_to_string(path).map_err(|source| DirectoryError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let file: DirectoryFile =
            serde_json::from_str(&content).map_err(|source| DirectoryError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        info!(
            path = %path.display(),
            tenant_count = file.tenants.len(),
            "Loaded tenant directory file"
        );

        Ok(file.tenants)
    }

    /// Build a directory straight from a JSON file.
    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        Self::new(Self::load_records(path)?)
    }

    /// Parse inline entries of the form `t1=10.0.0.5:9000,t2=[::1]:80`.
    ///
    /// The last `:` separates the port, so bracketed IPv6 hosts work. Brackets
    /// are stripped from the stored host.
    pub fn parse_inline(entries: &str) -> Result<Vec<TenantRecord>, DirectoryError> {
        let mut records = Vec::new();

        for entry in entries.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let invalid = |reason| DirectoryError::InvalidEntry {
                entry: entry.to_string(),
                reason,
            };

            let (tenant_id, endpoint) = entry.split_once('=').ok_or_else(|| invalid("missing '='"))?;
            let (host, port) = endpoint
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing ':port'"))?;
            let port: u16 = port.trim().parse().map_err(|_| invalid("port is not a number"))?;
            let host = host.trim().trim_start_matches('[').trim_end_matches(']');

            debug!(tenant_id = %tenant_id.trim(), host = %host, port = port, "Parsed inline tenant");
            records.push(TenantRecord::new(tenant_id.trim(), host, port));
        }

        Ok(records)
    }

    /// Look up the record for a tenant id.
    pub fn lookup(&self, tenant_id: &str) -> Option<&TenantRecord> {
        self.by_id.get(tenant_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Tenant ids in sorted order.
    pub fn tenant_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.by_id.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_directory_lookup() {
        let dir = TenantDirectory::new(vec![
            TenantRecord::new("t1", "10.0.0.5", 9000),
            TenantRecord::new("t2", "backend.local", 80),
        ])
        .unwrap();

        assert_eq!(dir.len(), 2);
        assert_eq!(dir.lookup("t1").unwrap().target_port, 9000);
        assert_eq!(dir.lookup("t2").unwrap().target_host, "backend.local");
        assert!(dir.lookup("t3").is_none());
    }

    #[test]
    fn test_directory_lookup_is_case_sensitive() {
        let dir = TenantDirectory::new(vec![TenantRecord::new("Tenant", "h", 1)]).unwrap();
        assert!(dir.lookup("Tenant").is_some());
        assert!(dir.lookup("tenant").is_none());
    }

    #[test]
    fn test_directory_rejects_duplicates() {
        let err = TenantDirectory::new(vec![
            TenantRecord::new("t1", "a", 1),
            TenantRecord::new("t1", "b", 2),
        ])
        .unwrap_err();
        assert!(matches!(err, DirectoryError::DuplicateTenant(id) if id == "t1"));
    }

    #[test]
    fn test_directory_rejects_port_zero() {
        let err = TenantDirectory::new(vec![TenantRecord::new("t1", "a", 0)]).unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidPort { .. }));
    }

    #[test]
    fn test_directory_rejects_empty_fields() {
        assert!(matches!(
            TenantDirectory::new(vec![TenantRecord::new("", "a", 1)]).unwrap_err(),
            DirectoryError::EmptyTenantId
        ));
        assert!(matches!(
            TenantDirectory::new(vec![TenantRecord::new("t1", "", 1)]).unwrap_err(),
            DirectoryError::EmptyHost { .. }
        ));
    }

    #[test]
    fn test_tenant_ids_sorted() {
        let dir = TenantDirectory::new(vec![
            TenantRecord::new("b", "h", 1),
            TenantRecord::new("a", "h", 2),
        ])
        .unwrap();
        assert_eq!(dir.tenant_ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_upstream_formatting() {
        assert_eq!(TenantRecord::new("t", "10.0.0.5", 9000).upstream(), "10.0.0.5:9000");
        assert_eq!(TenantRecord::new("t", "::1", 80).upstream(), "[::1]:80");
    }

    #[test]
    fn test_parse_inline() {
        let records =
            TenantDirectory::parse_inline("t1=10.0.0.5:9000, t2=[::1]:8080,,t3=backend.local:80")
                .unwrap();
        assert_eq!(
            records,
            vec![
                TenantRecord::new("t1", "10.0.0.5", 9000),
                TenantRecord::new("t2", "::1", 8080),
                TenantRecord::new("t3", "backend.local", 80),
            ]
        );
    }

    #[test]
    fn test_parse_inline_errors() {
        assert!(matches!(
            TenantDirectory::parse_inline("t1").unwrap_err(),
            DirectoryError::InvalidEntry { reason: "missing '='", .. }
        ));
        assert!(matches!(
            TenantDirectory::parse_inline("t1=host").unwrap_err(),
            DirectoryError::InvalidEntry { reason: "missing ':port'", .. }
        ));
        assert!(matches!(
            TenantDirectory::parse_inline("t1=host:99999").unwrap_err(),
            DirectoryError::InvalidEntry { reason: "port is not a number", .. }
        ));
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("tenants.json");
        fs::write(
            &path,
            r#"{"tenants":[{"tenant_id":"t1","target_host":"10.0.0.5","target_port":9000}]}"#,
        )
        .unwrap();

        let dir = TenantDirectory::load(&path).unwrap();
        assert_eq!(dir.lookup("t1"), Some(&TenantRecord::new("t1", "10.0.0.5", 9000)));
    }

    #[test]
    fn test_load_missing_file() {
        let tmp = tempdir().unwrap();
        let err = TenantDirectory::load(&tmp.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, DirectoryError::Read { .. }));
    }

    #[test]
    fn test_load_invalid_json() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("tenants.json");
        fs::write(&path, "{ not json").unwrap();
        let err = TenantDirectory::load(&path).unwrap_err();
        assert!(matches!(err, DirectoryError::Parse { .. }));
    }
}
