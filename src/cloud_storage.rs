//! Cloud storage providers and the scheme registry
//!
//! A [`CloudStorageProvider`] moves whole database trees between a cloud
//! URI and a local path, and can expose object-level `FileStorage` for a
//! cloud root. The global [`StorageProviderRegistry`] maps URI schemes
//! (`s3://`, `gs://`, `az://`) to providers; registering a scheme twice
//! is a configuration error.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::path::Path;
use std::sync::Arc;

use crate::file_storage::FileStorage;

#[cfg(feature = "aws")]
pub mod s3;

#[cfg(feature = "gcp")]
pub mod gcs;

#[cfg(feature = "azure")]
pub mod azure;

/// Schemes treated as cloud URIs even before a provider is registered,
/// so path classification does not depend on which provider features
/// were compiled in.
const BUILTIN_CLOUD_SCHEMES: &[&str] = &["s3", "gs", "az"];

/// Recursive tree transfer between a cloud URI and the local filesystem.
#[async_trait]
pub trait CloudStorageProvider: Send + Sync {
    /// Copy the remote tree under `remote_uri` into `local`. Returns the
    /// number of objects copied; `0` means the remote does not exist,
    /// which callers treat as an empty database rather than an error.
    async fn get_tree(&self, remote_uri: &str, local: &Path) -> Result<u64>;

    /// Copy the local tree (or single file) to `remote_uri`,
    /// overwriting remote objects. Returns the number of objects
    /// written. Partial failures are propagated.
    async fn put_tree(&self, local: &Path, remote_uri: &str) -> Result<u64>;

    /// Object-level storage rooted at a cloud URI, for providers that
    /// support it.
    fn file_storage(&self, _root: &str) -> Result<Box<dyn FileStorage>> {
        anyhow::bail!("this provider does not expose object-level file storage")
    }
}

impl std::fmt::Debug for dyn CloudStorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudStorageProvider").finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("provider with scheme '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("no storage provider registered for scheme '{scheme}'; available: {available:?}")]
    NotRegistered {
        scheme: String,
        available: Vec<String>,
    },
}

static PROVIDERS: Lazy<DashMap<String, Arc<dyn CloudStorageProvider>>> = Lazy::new(DashMap::new);

/// Global scheme → provider registry.
pub struct StorageProviderRegistry;

impl StorageProviderRegistry {
    /// Register a provider under a scheme. Registering a scheme that is
    /// already taken is an error; configuration must be unambiguous.
    pub fn register(scheme: &str, provider: Arc<dyn CloudStorageProvider>) -> Result<()> {
        let key = scheme.trim_end_matches("://").to_string();
        match PROVIDERS.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::AlreadyRegistered(key).into())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(provider);
                Ok(())
            }
        }
    }

    /// Look up the provider for a scheme.
    pub fn get(scheme: &str) -> Result<Arc<dyn CloudStorageProvider>> {
        let key = scheme.trim_end_matches("://");
        PROVIDERS
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                RegistryError::NotRegistered {
                    scheme: key.to_string(),
                    available: Self::cloud_schemes(),
                }
                .into()
            })
    }

    /// The set of recognized cloud schemes: the built-ins plus every
    /// registered scheme.
    pub fn cloud_schemes() -> Vec<String> {
        let mut schemes: Vec<String> = BUILTIN_CLOUD_SCHEMES
            .iter()
            .map(|s| s.to_string())
            .collect();
        for entry in PROVIDERS.iter() {
            if !schemes.contains(entry.key()) {
                schemes.push(entry.key().clone());
            }
        }
        schemes.sort();
        schemes
    }

    /// The cloud scheme of a URI, when it has one.
    pub fn cloud_scheme_of(uri: &str) -> Option<String> {
        let (scheme, _) = uri.split_once("://")?;
        let scheme = scheme.to_lowercase();
        if Self::cloud_schemes().contains(&scheme) {
            Some(scheme)
        } else {
            None
        }
    }

    /// Whether a path refers to cloud storage.
    pub fn is_cloud_uri(uri: &str) -> bool {
        Self::cloud_scheme_of(uri).is_some()
    }
}

/// Split a cloud URI into `(bucket, key_prefix)`.
///
/// Shared by the concrete providers; the scheme has already been matched
/// by the registry.
pub fn split_bucket_uri(uri: &str) -> Result<(String, String)> {
    let parsed = url::Url::parse(uri)
        .map_err(|e| anyhow::anyhow!("invalid cloud URI '{uri}': {e}"))?;
    let bucket = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("cloud URI '{uri}' has no bucket"))?
        .to_string();
    let key = parsed.path().trim_start_matches('/').to_string();
    Ok((bucket, key))
}

/// Flatten a local file or directory into `(absolute, relative)` pairs.
/// A single file maps to an empty relative path (the URI names it).
#[allow(dead_code)]
pub(crate) fn collect_files(root: &Path) -> Result<Vec<(std::path::PathBuf, String)>> {
    use anyhow::Context;

    let mut files = Vec::new();
    if root.is_file() {
        files.push((root.to_path_buf(), String::new()));
        return Ok(files);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let relative = path
                    .strip_prefix(root)
                    .expect("entry is under the walk root")
                    .to_string_lossy()
                    .replace(std::path::MAIN_SEPARATOR, "/");
                files.push((path, relative));
            }
        }
    }
    Ok(files)
}

/// Register the providers for every compiled-in cloud backend.
///
/// Safe to call once at process startup; a second call reports the
/// registration conflict.
pub fn register_default_providers() -> Result<()> {
    #[cfg(feature = "aws")]
    StorageProviderRegistry::register("s3", Arc::new(s3::S3StorageProvider::from_config()))?;

    #[cfg(feature = "gcp")]
    StorageProviderRegistry::register("gs", Arc::new(gcs::GcsStorageProvider::new()))?;

    #[cfg(feature = "azure")]
    StorageProviderRegistry::register("az", Arc::new(azure::AzureBlobStorageProvider::new()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullProvider;

    #[async_trait]
    impl CloudStorageProvider for NullProvider {
        async fn get_tree(&self, _remote_uri: &str, _local: &Path) -> Result<u64> {
            Ok(0)
        }

        async fn put_tree(&self, _local: &Path, _remote_uri: &str) -> Result<u64> {
            Ok(0)
        }
    }

    #[test]
    fn test_builtin_schemes_recognized_without_providers() {
        assert!(StorageProviderRegistry::is_cloud_uri("s3://bucket/db"));
        assert!(StorageProviderRegistry::is_cloud_uri("gs://bucket/db"));
        assert!(StorageProviderRegistry::is_cloud_uri("az://container/db"));
        assert!(!StorageProviderRegistry::is_cloud_uri("/var/data/db"));
        assert!(!StorageProviderRegistry::is_cloud_uri("file:///var/data/db"));
    }

    #[test]
    fn test_duplicate_registration_is_an_error() {
        StorageProviderRegistry::register("testdup", Arc::new(NullProvider))
            .expect("first registration succeeds");
        let err = StorageProviderRegistry::register("testdup", Arc::new(NullProvider))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RegistryError>(),
            Some(RegistryError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_unregistered_scheme_lookup_fails() {
        let err = StorageProviderRegistry::get("nosuch").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RegistryError>(),
            Some(RegistryError::NotRegistered { .. })
        ));
    }

    #[test]
    fn test_split_bucket_uri() -> Result<()> {
        let (bucket, key) = split_bucket_uri("s3://my-bucket/path/to/db")?;
        assert_eq!(bucket, "my-bucket");
        assert_eq!(key, "path/to/db");
        Ok(())
    }
}
