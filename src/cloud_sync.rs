//! Cloud synchronization for locally materialized databases
//!
//! A database whose canonical path is a cloud URI is operated on through
//! an ephemeral local shadow. `pull_from_cloud` establishes the shadow
//! from the canonical copy; `push_to_cloud` checkpoints under the
//! adapter's lock so in-flight writes hit disk, then copies the tree
//! back. Provider selection is by URI scheme through the registry.

use anyhow::Result;
use async_trait::async_trait;
use tokio::task;
use tracing::debug;

use crate::cloud_storage::StorageProviderRegistry;
use crate::config::get_config;
use crate::graph_adapter::GraphAdapter;
use crate::observability::{record_metric, MetricType};

/// Push/pull contract for databases that can live in object storage.
#[async_trait]
pub trait CloudSync {
    /// Copy the local database tree to its cloud URI after a
    /// checkpoint. A no-op unless the configured backend is cloud and a
    /// local shadow exists.
    async fn push_to_cloud(&self) -> Result<()>;

    /// Copy the database tree from the cloud URI into the local shadow.
    /// A missing remote is not an error; the database is created
    /// locally and pushed on the next checkpoint.
    async fn pull_from_cloud(&self) -> Result<()>;
}

#[async_trait]
impl CloudSync for GraphAdapter {
    async fn push_to_cloud(&self) -> Result<()> {
        if !get_config().storage_backend.is_cloud() || !self.has_shadow() {
            return Ok(());
        }
        let Some(scheme) = StorageProviderRegistry::cloud_scheme_of(self.db_path()) else {
            return Ok(());
        };
        let provider = StorageProviderRegistry::get(&scheme)?;

        // Flush in-flight writes while holding the adapter lock, so the
        // files we copy are a consistent checkpoint.
        if let Some(connection) = self.current_connection() {
            let _serial = self.serial_lock().lock().await;
            task::spawn_blocking(move || connection.execute("CHECKPOINT;")).await??;
        }

        let pushed = provider
            .put_tree(self.local_path(), self.db_path())
            .await?;
        debug!("pushed {} objects to {}", pushed, self.db_path());
        record_metric(MetricType::Counter {
            name: "cloud.syncs",
            value: 1,
        });
        Ok(())
    }

    async fn pull_from_cloud(&self) -> Result<()> {
        self.pull_shadow_from_cloud().await?;
        record_metric(MetricType::Counter {
            name: "cloud.syncs",
            value: 1,
        });
        Ok(())
    }
}
