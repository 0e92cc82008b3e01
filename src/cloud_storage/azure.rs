//! Azure Blob Storage provider

use anyhow::{Context, Result};
use async_trait::async_trait;
use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::Path;
use tracing::debug;

use crate::cloud_storage::{collect_files, split_bucket_uri, CloudStorageProvider};
use crate::config::get_config;

pub struct AzureBlobStorageProvider {
    account: String,
    credentials: StorageCredentials,
}

impl AzureBlobStorageProvider {
    /// Build a provider from the configured account name and key; an
    /// absent key falls back to anonymous access.
    pub fn new() -> Self {
        let config = get_config();
        let account = config.azure.account_name.clone().unwrap_or_default();
        let credentials = match &config.azure.account_key {
            Some(key) => StorageCredentials::access_key(account.clone(), key.clone()),
            None => StorageCredentials::anonymous(),
        };
        Self {
            account,
            credentials,
        }
    }

    fn container_client(&self, container: &str) -> ContainerClient {
        ClientBuilder::new(self.account.clone(), self.credentials.clone())
            .container_client(container)
    }

    async fn list_blobs(&self, container: &str, prefix: &str) -> Result<Vec<String>> {
        let client = self.container_client(container);
        let mut names = Vec::new();
        let mut pages = client
            .list_blobs()
            .prefix(prefix.to_string())
            .into_stream();
        while let Some(page) = pages.next().await {
            let page = page.context("failed to list azure blobs")?;
            for blob in page.blobs.blobs() {
                names.push(blob.name.clone());
            }
        }
        Ok(names)
    }
}

impl Default for AzureBlobStorageProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudStorageProvider for AzureBlobStorageProvider {
    async fn get_tree(&self, remote_uri: &str, local: &Path) -> Result<u64> {
        let (container, prefix) = split_bucket_uri(remote_uri)?;
        let names = self.list_blobs(&container, &prefix).await?;
        if names.is_empty() {
            return Ok(0);
        }

        let concurrency = get_config().cloud_io_concurrency;
        let copied = stream::iter(names)
            .map(|name| {
                let client = self.container_client(&container);
                let prefix = prefix.clone();
                let local = local.to_path_buf();
                async move {
                    let relative = name
                        .strip_prefix(&prefix)
                        .map(|r| r.trim_start_matches('/'))
                        .unwrap_or(&name);
                    let target = if relative.is_empty() {
                        local.clone()
                    } else {
                        local.join(relative)
                    };
                    if let Some(parent) = target.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    let bytes = client
                        .blob_client(&name)
                        .get_content()
                        .await
                        .with_context(|| format!("failed to fetch blob {name}"))?;
                    tokio::fs::write(&target, &bytes).await?;
                    Ok::<u64, anyhow::Error>(1)
                }
            })
            .buffer_unordered(concurrency)
            .try_fold(0u64, |total, n| async move { Ok(total + n) })
            .await?;

        debug!("pulled {} blobs from {}", copied, remote_uri);
        Ok(copied)
    }

    async fn put_tree(&self, local: &Path, remote_uri: &str) -> Result<u64> {
        let (container, prefix) = split_bucket_uri(remote_uri)?;
        let files = collect_files(local)?;
        if files.is_empty() {
            return Ok(0);
        }

        let concurrency = get_config().cloud_io_concurrency;
        let copied = stream::iter(files)
            .map(|(path, relative)| {
                let name = if relative.is_empty() {
                    prefix.clone()
                } else {
                    format!("{}/{}", prefix.trim_end_matches('/'), relative)
                };
                let client = self.container_client(&container);
                async move {
                    let bytes = tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    client
                        .blob_client(&name)
                        .put_block_blob(bytes)
                        .await
                        .with_context(|| format!("failed to upload blob {name}"))?;
                    Ok::<u64, anyhow::Error>(1)
                }
            })
            .buffer_unordered(concurrency)
            .try_fold(0u64, |total, n| async move { Ok(total + n) })
            .await?;

        debug!("pushed {} blobs to {}", copied, remote_uri);
        Ok(copied)
    }
}
