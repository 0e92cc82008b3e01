//! Process-wide configuration
//!
//! One `EngramConfig` governs storage backend selection, the root data
//! and system directories (either of which may be a cloud URI), the
//! opt-in cross-process graph lock and the concurrency budget for cloud
//! transfers. The configuration is loaded from the environment once and
//! can be replaced programmatically, which tests rely on.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Where database trees canonically live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    S3,
    Gcs,
    Azure,
}

impl StorageBackend {
    pub fn is_cloud(&self) -> bool {
        !matches!(self, StorageBackend::Local)
    }
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            "gcs" => Ok(Self::Gcs),
            "azure" => Ok(Self::Azure),
            other => anyhow::bail!("unknown storage backend: {other}"),
        }
    }
}

/// Credentials for one object-store backend. All fields optional; the
/// provider SDKs fall back to their ambient credential chains.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudCredentials {
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub account_name: Option<String>,
    pub account_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngramConfig {
    /// Backend the canonical database trees live on.
    pub storage_backend: StorageBackend,
    /// Root for graph data; may be a cloud URI.
    pub data_root: String,
    /// Root for system files (locks, scratch); may be a cloud URI.
    pub system_root: String,
    /// Share one database across processes via the named external lock.
    pub shared_graph_lock: bool,
    /// Concurrent object transfers during cloud push/pull.
    pub cloud_io_concurrency: usize,
    /// Directory holding `engramdb-<version>` engine release binaries
    /// for cross-version migration.
    pub releases_dir: Option<PathBuf>,
    pub s3: CloudCredentials,
    pub gcs: CloudCredentials,
    pub azure: CloudCredentials,
}

impl Default for EngramConfig {
    fn default() -> Self {
        Self {
            storage_backend: StorageBackend::Local,
            data_root: ".engramdb/data".to_string(),
            system_root: ".engramdb/system".to_string(),
            shared_graph_lock: false,
            cloud_io_concurrency: 8,
            releases_dir: None,
            s3: CloudCredentials::default(),
            gcs: CloudCredentials::default(),
            azure: CloudCredentials::default(),
        }
    }
}

impl EngramConfig {
    /// Build a configuration from the process environment, falling back
    /// to defaults field by field.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        Self {
            storage_backend: env("ENGRAMDB_STORAGE_BACKEND")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.storage_backend),
            data_root: env("ENGRAMDB_DATA_ROOT").unwrap_or(defaults.data_root),
            system_root: env("ENGRAMDB_SYSTEM_ROOT").unwrap_or(defaults.system_root),
            shared_graph_lock: env("ENGRAMDB_SHARED_GRAPH_LOCK")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.shared_graph_lock),
            cloud_io_concurrency: env("ENGRAMDB_CLOUD_IO_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.cloud_io_concurrency),
            releases_dir: env("ENGRAMDB_RELEASES_DIR").map(PathBuf::from),
            s3: CloudCredentials {
                endpoint_url: env("ENGRAMDB_S3_ENDPOINT"),
                region: env("AWS_REGION"),
                access_key_id: env("AWS_ACCESS_KEY_ID"),
                secret_access_key: env("AWS_SECRET_ACCESS_KEY"),
                ..CloudCredentials::default()
            },
            gcs: CloudCredentials::default(),
            azure: CloudCredentials {
                account_name: env("AZURE_STORAGE_ACCOUNT"),
                account_key: env("AZURE_STORAGE_KEY"),
                ..CloudCredentials::default()
            },
        }
    }
}

static CONFIG: Lazy<RwLock<Arc<EngramConfig>>> =
    Lazy::new(|| RwLock::new(Arc::new(EngramConfig::from_env())));

/// The active process-wide configuration.
pub fn get_config() -> Arc<EngramConfig> {
    CONFIG.read().clone()
}

/// Replace the process-wide configuration. Adapters constructed after
/// this call observe the new settings; existing adapters do not.
pub fn set_config(config: EngramConfig) {
    *CONFIG.write() = Arc::new(config);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("local".parse::<StorageBackend>().unwrap(), StorageBackend::Local);
        assert_eq!("S3".parse::<StorageBackend>().unwrap(), StorageBackend::S3);
        assert_eq!("gcs".parse::<StorageBackend>().unwrap(), StorageBackend::Gcs);
        assert_eq!("azure".parse::<StorageBackend>().unwrap(), StorageBackend::Azure);
        assert!("ftp".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn test_cloud_flag() {
        assert!(!StorageBackend::Local.is_cloud());
        assert!(StorageBackend::S3.is_cloud());
    }

    #[test]
    fn test_set_and_get_config() {
        let mut config = EngramConfig::default();
        config.cloud_io_concurrency = 3;
        set_config(config);
        assert_eq!(get_config().cloud_io_concurrency, 3);
        set_config(EngramConfig::default());
    }
}
