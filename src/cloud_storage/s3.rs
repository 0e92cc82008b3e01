//! S3-backed storage provider

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::Path;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::cloud_storage::{collect_files, split_bucket_uri, CloudStorageProvider};
use crate::config::get_config;

pub struct S3StorageProvider {
    client: OnceCell<Client>,
    endpoint_url: Option<String>,
}

impl S3StorageProvider {
    /// Build a provider from the process configuration; credentials come
    /// from the standard AWS credential chain unless overridden.
    pub fn from_config() -> Self {
        Self {
            client: OnceCell::new(),
            endpoint_url: get_config().s3.endpoint_url.clone(),
        }
    }

    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                let sdk_config =
                    aws_config::defaults(aws_config::BehaviorVersion::latest())
                        .load()
                        .await;
                let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
                if let Some(endpoint) = &self.endpoint_url {
                    builder = builder.endpoint_url(endpoint).force_path_style(true);
                }
                Ok(Client::from_conf(builder.build()))
            })
            .await
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let client = self.client().await?;
        let mut keys = Vec::new();
        let mut pages = client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.try_next().await.context("failed to list s3 objects")? {
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl CloudStorageProvider for S3StorageProvider {
    async fn get_tree(&self, remote_uri: &str, local: &Path) -> Result<u64> {
        let (bucket, prefix) = split_bucket_uri(remote_uri)?;
        let keys = self.list_keys(&bucket, &prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let client = self.client().await?;
        let concurrency = get_config().cloud_io_concurrency;
        let copied = stream::iter(keys)
            .map(|key| {
                let client = client.clone();
                let bucket = bucket.clone();
                let prefix = prefix.clone();
                let local = local.to_path_buf();
                async move {
                    let relative = key
                        .strip_prefix(&prefix)
                        .map(|r| r.trim_start_matches('/'))
                        .unwrap_or(&key);
                    let target = if relative.is_empty() {
                        local.clone()
                    } else {
                        local.join(relative)
                    };
                    if let Some(parent) = target.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    let response = client
                        .get_object()
                        .bucket(&bucket)
                        .key(&key)
                        .send()
                        .await
                        .with_context(|| format!("failed to fetch s3://{bucket}/{key}"))?;
                    let body = response.body.collect().await?.into_bytes();
                    tokio::fs::write(&target, &body).await?;
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
        let files = collect_files(local)?;
        if files.is_empty() {
            return Ok(0);
        }

        let client = self.client().await?;
        let concurrency = get_config().cloud_io_concurrency;
        let copied = stream::iter(files)
            .map(|(path, relative)| {
                let client = client.clone();
                let bucket = bucket.clone();
                let key = if relative.is_empty() {
                    prefix.clone()
                } else {
                    format!("{}/{}", prefix.trim_end_matches('/'), relative)
                };
                async move {
                    let body = ByteStream::from_path(&path)
                        .await
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    client
                        .put_object()
                        .bucket(&bucket)
                        .key(&key)
                        .body(body)
                        .send()
                        .await
                        .with_context(|| format!("failed to upload s3://{bucket}/{key}"))?;
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
