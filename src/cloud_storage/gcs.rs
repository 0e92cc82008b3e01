//! Google Cloud Storage provider

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use std::path::Path;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::cloud_storage::{split_bucket_uri, CloudStorageProvider};
use crate::config::get_config;

pub struct GcsStorageProvider {
    client: OnceCell<Client>,
}

impl GcsStorageProvider {
    pub fn new() -> Self {
        Self {
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                let config = ClientConfig::default()
                    .with_auth()
                    .await
                    .context("failed to resolve GCS credentials")?;
                Ok(Client::new(config))
            })
            .await
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let client = self.client().await?;
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let response = client
                .list_objects(&ListObjectsRequest {
                    bucket: bucket.to_string(),
                    prefix: Some(prefix.to_string()),
                    page_token: page_token.clone(),
                    ..Default::default()
                })
                .await
                .context("failed to list gcs objects")?;
            if let Some(items) = response.items {
                names.extend(items.into_iter().map(|object| object.name));
            }
            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(names)
    }
}

impl Default for GcsStorageProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudStorageProvider for GcsStorageProvider {
    async fn get_tree(&self, remote_uri: &str, local: &Path) -> Result<u64> {
        let (bucket, prefix) = split_bucket_uri(remote_uri)?;
        let names = self.list_objects(&bucket, &prefix).await?;
        if names.is_empty() {
            return Ok(0);
        }

        let client = self.client().await?;
        let concurrency = get_config().cloud_io_concurrency;
        let copied = stream::iter(names)
            .map(|name| {
                let client = client.clone();
                let bucket = bucket.clone();
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
                        .download_object(
                            &GetObjectRequest {
                                bucket: bucket.clone(),
                                object: name.clone(),
                                ..Default::default()
                            },
                            &Range::default(),
                        )
                        .await
                        .with_context(|| format!("failed to fetch gs://{bucket}/{name}"))?;
                    tokio::fs::write(&target, &bytes).await?;
                    Ok::<u64, anyhow::Error>(1)
                }
            })
            .buffer_unordered(concurrency)
            .try_fold(0u64, |total, n| async move { Ok(total + n) })
            .await?;

        debug!("pulled {} objects from {}", copied, remote_uri);
        Ok(copied)
    }

    async fn put_tree(&self, local: &Path, remote_uri: &str) -> Result<u64> {
        let (bucket, prefix) = split_bucket_uri(remote_uri)?;
        let files = super::collect_files(local)?;
        if files.is_empty() {
            return Ok(0);
        }

        let client = self.client().await?;
        let concurrency = get_config().cloud_io_concurrency;
        let copied = stream::iter(files)
            .map(|(path, relative)| {
                let client = client.clone();
                let bucket = bucket.clone();
                let name = if relative.is_empty() {
                    prefix.clone()
                } else {
                    format!("{}/{}", prefix.trim_end_matches('/'), relative)
                };
                async move {
                    let bytes = tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    client
                        .upload_object(
                            &UploadObjectRequest {
                                bucket: bucket.clone(),
                                ..Default::default()
                            },
                            bytes,
                            &UploadType::Simple(Media::new(name.clone())),
                        )
                        .await
                        .with_context(|| format!("failed to upload gs://{bucket}/{name}"))?;
                    Ok::<u64, anyhow::Error>(1)
                }
            })
            .buffer_unordered(concurrency)
            .try_fold(0u64, |total, n| async move { Ok(total + n) })
            .await?;

        debug!("pushed {} objects to {}", copied, remote_uri);
        Ok(copied)
    }
}
