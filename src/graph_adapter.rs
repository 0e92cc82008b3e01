//! Embedded graph adapter
//!
//! `GraphAdapter` owns the engine handle and connection for one database
//! and exposes the asynchronous graph contract (`GraphStore`) consumed
//! by upstream pipelines. Blocking engine calls run on the worker
//! executor. When the configured path is a cloud URI the database is
//! materialized into an ephemeral local shadow first (see `CloudSync`);
//! when the on-disk format predates the running engine, the adapter
//! migrates it in place and reopens.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task;
use tracing::{error, info, warn};

use crate::cloud_storage::StorageProviderRegistry;
use crate::config::get_config;
use crate::contracts::{validation, GraphData, GraphStore};
use crate::file_storage::{get_file_storage, parent_dir_of};
use crate::graph_engine::{
    Connection, Database, DatabaseOptions, EdgeDirection, EdgeRow, EdgeWrite, EngineError,
    NodeRow, NodeWrite, EDGE_TABLE_DDL, NODE_TABLE_DDL,
};
use crate::migration::migrate_in_place;
use crate::observability::{record_metric, MetricType};
use crate::process_lock::{graph_lock_name, NamedProcessLock};
use crate::pure;
use crate::storage_version::StorageVersion;
use crate::types::{
    AttributeFilter, EdgeKey, EdgeSpec, EventRecord, GraphEntity, GraphMetrics, NodeDict,
};

/// Relationship label whose property blobs carry feedback weights.
const FEEDBACK_EDGE_LABEL: &str = "used_graph_element_to_answer";

/// Node type tags with temporal semantics.
const TIMESTAMP_NODE_TYPE: &str = "Timestamp";
const EVENT_NODE_TYPE: &str = "Event";
const INTERACTION_NODE_TYPE: &str = "UserInteraction";

/// Adapter for the embedded property-graph engine with consistent async
/// access.
///
/// One adapter exclusively owns its engine handle. A per-adapter async
/// mutex serializes checkpoints and handle lifetime changes
/// (close/reopen, push-to-cloud); regular queries rely on the engine's
/// internal serialization. With the shared cross-process lock enabled,
/// every query additionally acquires a named external lock and the
/// handle is dropped between queries so other processes can take
/// exclusive access.
pub struct GraphAdapter {
    /// Configured path; may be a cloud URI.
    db_path: String,
    /// Materialized local path (the shadow, for cloud databases).
    local_path: PathBuf,
    /// Scratch directory backing the shadow; unlinked on drop.
    shadow: Option<TempDir>,
    connection: Arc<parking_lot::RwLock<Option<Connection>>>,
    /// Serializes checkpoint, close/reopen and push-to-cloud.
    serial_lock: tokio::sync::Mutex<()>,
    /// Serializes connection open/close cycles in shared-lock mode.
    connection_gate: tokio::sync::Mutex<()>,
    open_connections: AtomicUsize,
    shared_lock: Option<NamedProcessLock>,
    is_closed: AtomicBool,
}

impl std::fmt::Debug for GraphAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphAdapter")
            .field("db_path", &self.db_path)
            .field("local_path", &self.local_path)
            .finish_non_exhaustive()
    }
}

impl GraphAdapter {
    /// Open (or create) the database at `db_path`.
    ///
    /// Cloud URIs are pulled into a local shadow first. In shared-lock
    /// mode the engine is opened lazily per query; otherwise the handle
    /// is established eagerly here, running migration when the on-disk
    /// format requires it.
    pub async fn new(db_path: &str) -> Result<Self> {
        validation::validate_storage_path(db_path)?;
        let config = get_config();

        let is_cloud = StorageProviderRegistry::is_cloud_uri(db_path);
        let (local_path, shadow) = if is_cloud {
            let shadow = TempDir::new().context("failed to create local shadow directory")?;
            (shadow.path().join("graph_db"), Some(shadow))
        } else {
            (PathBuf::from(db_path), None)
        };

        let shared_lock = if config.shared_graph_lock {
            let locks_dir = Path::new(&config.system_root).join("locks");
            Some(NamedProcessLock::new(locks_dir, &graph_lock_name(db_path)))
        } else {
            None
        };

        let adapter = Self {
            db_path: db_path.to_string(),
            local_path,
            shadow,
            connection: Arc::new(parking_lot::RwLock::new(None)),
            serial_lock: tokio::sync::Mutex::new(()),
            connection_gate: tokio::sync::Mutex::new(()),
            open_connections: AtomicUsize::new(0),
            shared_lock,
            is_closed: AtomicBool::new(false),
        };

        if is_cloud {
            adapter.pull_shadow_from_cloud().await?;
        }

        if adapter.shared_lock.is_none() {
            let path = adapter.local_path.clone();
            let connection = task::spawn_blocking(move || Self::connect_engine(&path)).await??;
            *adapter.connection.write() = Some(connection);
        }

        Ok(adapter)
    }

    /// The configured path (cloud URI or local path).
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// The local path queries actually run against.
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub(crate) fn has_shadow(&self) -> bool {
        self.shadow.is_some()
    }

    pub(crate) fn serial_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.serial_lock
    }

    pub(crate) fn current_connection(&self) -> Option<Connection> {
        self.connection.read().clone()
    }

    /// Copy the canonical cloud tree into the local shadow. Missing
    /// remote is not an error; the database is created locally and
    /// pushed on the next checkpoint.
    pub(crate) async fn pull_shadow_from_cloud(&self) -> Result<()> {
        let Some(scheme) = StorageProviderRegistry::cloud_scheme_of(&self.db_path) else {
            return Ok(());
        };
        let provider = StorageProviderRegistry::get(&scheme)?;
        let copied = provider.get_tree(&self.db_path, &self.local_path).await?;
        if copied == 0 {
            warn!("cloud storage object not found: {}", self.db_path);
        }
        Ok(())
    }

    /// Full blocking connect sequence: throwaway JSON install, strict
    /// open with in-place migration on a version mismatch, extension
    /// load and idempotent schema bootstrap.
    fn connect_engine(path: &Path) -> Result<Connection> {
        Self::install_json_extension();

        let database = match Database::open(path, DatabaseOptions::default()) {
            Ok(database) => database,
            Err(e) => match e.downcast_ref::<EngineError>() {
                Some(EngineError::VersionMismatch { found, .. }) => {
                    let old_version = StorageVersion::from_code(*found)?;
                    warn!(
                        "database {} has storage version {}; migrating in place",
                        path.display(),
                        old_version
                    );
                    migrate_in_place(path, old_version)?;
                    Database::open(path, DatabaseOptions::default())?
                }
                _ => {
                    error!("failed to open graph database: {e}");
                    return Err(e);
                }
            },
        };

        let connection = database.connect();
        match connection.execute("LOAD EXTENSION JSON;") {
            Ok(_) => info!("Loaded JSON extension"),
            Err(e) => info!("JSON extension already loaded or unavailable: {e}"),
        }

        connection.execute(NODE_TABLE_DDL)?;
        connection.execute(EDGE_TABLE_DDL)?;
        Ok(connection)
    }

    /// Install the JSON extension against a throwaway database in a
    /// temporary directory. Doing this before the real catalog is
    /// touched avoids missing-extension errors there; any failure is
    /// informational only.
    fn install_json_extension() {
        let result = (|| -> Result<()> {
            let scratch = tempfile::tempdir()?;
            let database =
                Database::open(scratch.path().join("scratch.db"), DatabaseOptions::default())?;
            database.connect().execute("INSTALL JSON;")?;
            Ok(())
        })();
        if let Err(e) = result {
            info!("JSON extension already installed or not needed: {e}");
        }
    }

    /// Run a blocking engine closure on the worker executor.
    ///
    /// In shared-lock mode the named external lock is held for the
    /// duration and the engine handle is dropped afterwards, so another
    /// process can acquire exclusive access between queries.
    async fn run_query<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        record_metric(MetricType::Counter {
            name: "graph.queries",
            value: 1,
        });

        if let Some(lock) = self.shared_lock.clone() {
            let _gate = self.connection_gate.lock().await;
            self.open_connections.fetch_add(1, Ordering::SeqCst);

            let slot = self.connection.clone();
            let path = self.local_path.clone();
            let result = task::spawn_blocking(move || {
                let guard = lock.acquire_blocking()?;
                let outcome = (|| {
                    let connection = Self::ensure_connection(&slot, &path)?;
                    f(&connection)
                })();
                // Drop the handle so other processes can open the file.
                *slot.write() = None;
                guard.release();
                outcome
            })
            .await?;

            let remaining = self.open_connections.fetch_sub(1, Ordering::SeqCst) - 1;
            tracing::debug!("open connections after query: {remaining}");
            result
        } else {
            let slot = self.connection.clone();
            let path = self.local_path.clone();
            task::spawn_blocking(move || {
                let connection = Self::ensure_connection(&slot, &path)?;
                f(&connection)
            })
            .await?
        }
    }

    fn ensure_connection(
        slot: &Arc<parking_lot::RwLock<Option<Connection>>>,
        path: &Path,
    ) -> Result<Connection> {
        let mut guard = slot.write();
        if guard.is_none() {
            info!("Reconnecting to graph database...");
            *guard = Some(Self::connect_engine(path)?);
        }
        Ok(guard.as_ref().expect("connection was just established").clone())
    }

    /// Drop the engine handle and mark the adapter closed. Queries
    /// issued afterwards transparently reconnect; `reopen` restores the
    /// eager handle.
    pub async fn close(&self) {
        let _serial = self.serial_lock.lock().await;
        *self.connection.write() = None;
        self.is_closed.store(true, Ordering::SeqCst);
        info!("graph database closed");
    }

    /// Reestablish the handle after [`Self::close`].
    pub async fn reopen(&self) -> Result<()> {
        let _serial = self.serial_lock.lock().await;
        if self.is_closed.swap(false, Ordering::SeqCst) && self.shared_lock.is_none() {
            let slot = self.connection.clone();
            let path = self.local_path.clone();
            task::spawn_blocking(move || {
                let mut guard = slot.write();
                if guard.is_none() {
                    *guard = Some(Self::connect_engine(&path)?);
                }
                Ok::<_, anyhow::Error>(())
            })
            .await??;
            info!("graph database re-opened");
        }
        Ok(())
    }

    // Row conversion helpers

    fn node_dict(row: &NodeRow) -> NodeDict {
        let mut dict = Map::new();
        dict.insert("id".to_string(), json!(row.id));
        dict.insert("name".to_string(), json!(row.name));
        dict.insert("type".to_string(), json!(row.node_type));
        dict.insert("created_at".to_string(), json!(row.created_at.to_rfc3339()));
        dict.insert("updated_at".to_string(), json!(row.updated_at.to_rfc3339()));
        Self::merge_properties(&mut dict, &row.properties, &row.id);
        dict
    }

    /// Merge a JSON blob into an outer dictionary, dropping the blob
    /// key. A blob that fails to parse is logged and the outer
    /// dictionary is returned unchanged; the entity is never dropped.
    fn merge_properties(dict: &mut NodeDict, raw: &str, entity: &str) {
        if raw.is_empty() {
            return;
        }
        match serde_json::from_str::<Map<String, Value>>(raw) {
            Ok(properties) => {
                for (key, value) in properties {
                    dict.insert(key, value);
                }
                dict.remove("properties");
            }
            Err(_) => {
                warn!("Failed to parse properties JSON for {entity}");
            }
        }
    }

    fn edge_properties_dict(row: &EdgeRow) -> NodeDict {
        let mut dict = Map::new();
        if !row.properties.is_empty() {
            match serde_json::from_str::<Map<String, Value>>(&row.properties) {
                Ok(properties) => dict = properties,
                Err(_) => {
                    warn!(
                        "Failed to parse edge properties for {}->{}",
                        row.source, row.target
                    );
                }
            }
        }
        dict
    }

    fn node_writes(nodes: &[GraphEntity]) -> Result<Vec<NodeWrite>> {
        nodes
            .iter()
            .map(|node| {
                Ok(NodeWrite {
                    id: node.id.clone(),
                    name: node.name.clone(),
                    node_type: node.node_type.clone(),
                    properties: serde_json::to_string(&node.properties)
                        .context("failed to serialize node properties")?,
                })
            })
            .collect()
    }

    fn graph_data_from_rows(nodes: Vec<NodeRow>, edges: Vec<EdgeRow>) -> GraphData {
        let formatted_nodes = nodes
            .iter()
            .map(|row| (row.id.clone(), Self::node_dict(row)))
            .collect();
        let formatted_edges = edges
            .iter()
            .map(|row| {
                (
                    row.source.clone(),
                    row.target.clone(),
                    row.relationship_name.clone(),
                    Self::edge_properties_dict(row),
                )
            })
            .collect();
        (formatted_nodes, formatted_edges)
    }
}

#[async_trait]
impl GraphStore for GraphAdapter {
    async fn query(&self, statement: &str) -> Result<Vec<Vec<Value>>> {
        let statement = statement.to_string();
        self.run_query(move |conn| conn.execute(&statement)).await
    }

    async fn is_empty(&self) -> Result<bool> {
        self.run_query(|conn| Ok(conn.node_count()? == 0)).await
    }

    async fn has_node(&self, node_id: &str) -> Result<bool> {
        let node_id = node_id.to_string();
        self.run_query(move |conn| conn.has_node(&node_id)).await
    }

    async fn add_node(&self, node: &GraphEntity) -> Result<()> {
        self.add_nodes(std::slice::from_ref(node)).await
    }

    async fn add_nodes(&self, nodes: &[GraphEntity]) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        validation::validate_entities(nodes)?;
        let writes = Self::node_writes(nodes)?;
        let result = self
            .run_query(move |conn| conn.merge_nodes(&writes, Utc::now()))
            .await;
        if let Err(e) = &result {
            error!("Failed to add nodes in batch: {e}");
        }
        result
    }

    async fn delete_node(&self, node_id: &str) -> Result<()> {
        self.delete_nodes(&[node_id.to_string()]).await
    }

    async fn delete_nodes(&self, node_ids: &[String]) -> Result<()> {
        let ids = node_ids.to_vec();
        self.run_query(move |conn| conn.delete_nodes(&ids)).await
    }

    async fn extract_node(&self, node_id: &str) -> Result<Option<NodeDict>> {
        let id = node_id.to_string();
        match self.run_query(move |conn| conn.get_node(&id)).await {
            Ok(row) => Ok(row.map(|row| Self::node_dict(&row))),
            Err(e) => {
                error!("Failed to extract node {node_id}: {e}");
                Ok(None)
            }
        }
    }

    async fn extract_nodes(&self, node_ids: &[String]) -> Result<Vec<NodeDict>> {
        let ids = node_ids.to_vec();
        match self.run_query(move |conn| conn.get_nodes(&ids)).await {
            Ok(rows) => Ok(rows.iter().map(Self::node_dict).collect()),
            Err(e) => {
                error!("Failed to extract nodes: {e}");
                Ok(Vec::new())
            }
        }
    }

    async fn has_edge(&self, from_node: &str, to_node: &str, edge_label: &str) -> Result<bool> {
        let key = EdgeKey::new(from_node, to_node, edge_label);
        self.run_query(move |conn| conn.has_edge(&key)).await
    }

    async fn has_edges(&self, edges: &[EdgeKey]) -> Result<Vec<EdgeKey>> {
        if edges.is_empty() {
            return Ok(Vec::new());
        }
        let keys = edges.to_vec();
        match self.run_query(move |conn| conn.existing_edges(&keys)).await {
            Ok(existing) => Ok(existing),
            Err(e) => {
                error!("Failed to check edges in batch: {e}");
                Ok(Vec::new())
            }
        }
    }

    async fn add_edge(
        &self,
        from_node: &str,
        to_node: &str,
        relationship_name: &str,
        edge_properties: Map<String, Value>,
    ) -> Result<()> {
        let mut spec = EdgeSpec::new(from_node, to_node, relationship_name);
        spec.properties = edge_properties;
        self.add_edges(std::slice::from_ref(&spec)).await
    }

    async fn add_edges(&self, edges: &[EdgeSpec]) -> Result<()> {
        if edges.is_empty() {
            return Ok(());
        }
        let writes: Vec<EdgeWrite> = edges
            .iter()
            .map(|edge| {
                Ok(EdgeWrite {
                    key: edge.key(),
                    properties: serde_json::to_string(&edge.properties)
                        .context("failed to serialize edge properties")?,
                })
            })
            .collect::<Result<_>>()?;
        let result = self
            .run_query(move |conn| conn.merge_edges(&writes, Utc::now()))
            .await;
        if let Err(e) = &result {
            error!("Failed to add edges in batch: {e}");
        }
        result
    }

    async fn get_edges(&self, node_id: &str) -> Result<Vec<(NodeDict, String, NodeDict)>> {
        let id = node_id.to_string();
        let result = self
            .run_query(move |conn| {
                let Some(center) = conn.get_node(&id)? else {
                    return Ok(Vec::new());
                };
                let mut tuples = Vec::new();
                for edge in conn.edges_touching(&id)? {
                    let other_id = if edge.source == id {
                        &edge.target
                    } else {
                        &edge.source
                    };
                    if let Some(other) = conn.get_node(other_id)? {
                        tuples.push((center.clone(), edge.relationship_name.clone(), other));
                    }
                }
                Ok(tuples)
            })
            .await;

        match result {
            Ok(rows) => Ok(rows
                .into_iter()
                .map(|(center, label, other)| {
                    (Self::node_dict(&center), label, Self::node_dict(&other))
                })
                .collect()),
            Err(e) => {
                error!("Failed to get edges for node {node_id}: {e}");
                Ok(Vec::new())
            }
        }
    }

    async fn get_neighbors(&self, node_id: &str) -> Result<Vec<NodeDict>> {
        let id = node_id.to_string();
        match self.run_query(move |conn| conn.neighbors(&id)).await {
            Ok(rows) => Ok(rows.iter().map(Self::node_dict).collect()),
            Err(e) => {
                error!("Failed to get neighbours for node {node_id}: {e}");
                Ok(Vec::new())
            }
        }
    }

    async fn get_predecessors(
        &self,
        node_id: &str,
        edge_label: Option<&str>,
    ) -> Result<Vec<NodeDict>> {
        let id = node_id.to_string();
        let label = edge_label.map(|l| l.to_string());
        let result = self
            .run_query(move |conn| {
                let mut rows = Vec::new();
                for edge in conn.edges_in(&id, label.as_deref())? {
                    if let Some(row) = conn.get_node(&edge.source)? {
                        rows.push(row);
                    }
                }
                Ok(rows)
            })
            .await;
        match result {
            Ok(rows) => Ok(rows.iter().map(Self::node_dict).collect()),
            Err(e) => {
                error!("Failed to get predecessors for node {node_id}: {e}");
                Ok(Vec::new())
            }
        }
    }

    async fn get_successors(
        &self,
        node_id: &str,
        edge_label: Option<&str>,
    ) -> Result<Vec<NodeDict>> {
        let id = node_id.to_string();
        let label = edge_label.map(|l| l.to_string());
        let result = self
            .run_query(move |conn| {
                let mut rows = Vec::new();
                for edge in conn.edges_out(&id, label.as_deref())? {
                    if let Some(row) = conn.get_node(&edge.target)? {
                        rows.push(row);
                    }
                }
                Ok(rows)
            })
            .await;
        match result {
            Ok(rows) => Ok(rows.iter().map(Self::node_dict).collect()),
            Err(e) => {
                error!("Failed to get successors for node {node_id}: {e}");
                Ok(Vec::new())
            }
        }
    }

    async fn get_connections(
        &self,
        node_id: &str,
    ) -> Result<Vec<(NodeDict, NodeDict, NodeDict)>> {
        let id = node_id.to_string();
        let result = self
            .run_query(move |conn| {
                let Some(center) = conn.get_node(&id)? else {
                    return Ok(Vec::new());
                };
                let mut tuples = Vec::new();
                for edge in conn.edges_touching(&id)? {
                    let other_id = if edge.source == id {
                        &edge.target
                    } else {
                        &edge.source
                    };
                    if let Some(other) = conn.get_node(other_id)? {
                        tuples.push((center.clone(), edge, other));
                    }
                }
                Ok(tuples)
            })
            .await;

        match result {
            Ok(rows) => Ok(rows
                .into_iter()
                .map(|(center, edge, other)| {
                    let mut edge_dict = Map::new();
                    edge_dict.insert(
                        "relationship_name".to_string(),
                        json!(edge.relationship_name),
                    );
                    for (key, value) in Self::edge_properties_dict(&edge) {
                        edge_dict.insert(key, value);
                    }
                    (Self::node_dict(&center), edge_dict, Self::node_dict(&other))
                })
                .collect()),
            Err(e) => {
                error!("Failed to get connections for node {node_id}: {e}");
                Ok(Vec::new())
            }
        }
    }

    async fn remove_connection_to_predecessors_of(
        &self,
        node_ids: &[String],
        edge_label: &str,
    ) -> Result<()> {
        let ids = node_ids.to_vec();
        let label = edge_label.to_string();
        self.run_query(move |conn| {
            conn.delete_labeled_edges(&ids, &label, EdgeDirection::Incoming)
        })
        .await
    }

    async fn remove_connection_to_successors_of(
        &self,
        node_ids: &[String],
        edge_label: &str,
    ) -> Result<()> {
        let ids = node_ids.to_vec();
        let label = edge_label.to_string();
        self.run_query(move |conn| {
            conn.delete_labeled_edges(&ids, &label, EdgeDirection::Outgoing)
        })
        .await
    }

    async fn get_graph_data(&self) -> Result<GraphData> {
        let (nodes, edges) = self
            .run_query(|conn| Ok((conn.all_nodes()?, conn.all_edges()?)))
            .await?;
        if nodes.is_empty() {
            warn!("No nodes found in the database");
            return Ok((Vec::new(), Vec::new()));
        }
        Ok(Self::graph_data_from_rows(nodes, edges))
    }

    async fn get_nodeset_subgraph(
        &self,
        node_type: &str,
        node_names: &[String],
    ) -> Result<GraphData> {
        let node_type = node_type.to_string();
        let names = node_names.to_vec();
        let (nodes, edges) = self
            .run_query(move |conn| {
                let primaries = conn.nodes_by_type_and_names(&node_type, &names)?;
                if primaries.is_empty() {
                    return Ok((Vec::new(), Vec::new()));
                }

                let mut union: BTreeSet<String> =
                    primaries.iter().map(|row| row.id.clone()).collect();
                for row in &primaries {
                    for neighbor in conn.neighbors(&row.id)? {
                        union.insert(neighbor.id);
                    }
                }

                let ids: Vec<String> = union.iter().cloned().collect();
                let nodes = conn.get_nodes(&ids)?;
                let edges = conn
                    .all_edges()?
                    .into_iter()
                    .filter(|edge| union.contains(&edge.source) && union.contains(&edge.target))
                    .collect::<Vec<_>>();
                Ok((nodes, edges))
            })
            .await?;
        Ok(Self::graph_data_from_rows(nodes, edges))
    }

    async fn get_filtered_graph_data(&self, filters: &[AttributeFilter]) -> Result<GraphData> {
        let engine_filters: Vec<(String, Vec<String>)> = filters
            .iter()
            .map(|filter| {
                let values = filter
                    .values
                    .iter()
                    .map(|value| match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                (filter.attribute.clone(), values)
            })
            .collect();

        let (nodes, edges) = self
            .run_query(move |conn| {
                let nodes = conn.filter_nodes(&engine_filters)?;
                let matched: BTreeSet<String> = nodes.iter().map(|row| row.id.clone()).collect();
                let edges = conn
                    .all_edges()?
                    .into_iter()
                    .filter(|edge| {
                        matched.contains(&edge.source) && matched.contains(&edge.target)
                    })
                    .collect::<Vec<_>>();
                Ok((nodes, edges))
            })
            .await?;
        if nodes.is_empty() {
            warn!("No nodes found in the database");
            return Ok((Vec::new(), Vec::new()));
        }
        Ok(Self::graph_data_from_rows(nodes, edges))
    }

    async fn get_graph_metrics(&self, include_optional: bool) -> Result<GraphMetrics> {
        let gathered = self
            .run_query(|conn| {
                let node_ids: Vec<String> =
                    conn.all_nodes()?.into_iter().map(|row| row.id).collect();
                let edge_pairs: Vec<(String, String)> = conn
                    .all_edges()?
                    .into_iter()
                    .map(|edge| (edge.source, edge.target))
                    .collect();
                Ok((node_ids, edge_pairs))
            })
            .await;

        let (node_ids, edge_pairs) = match gathered {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to get graph metrics: {e}");
                return Ok(GraphMetrics::empty());
            }
        };

        let num_nodes = node_ids.len();
        let num_edges = edge_pairs.len();
        let component_sizes = pure::bounded_components(&node_ids, &edge_pairs);

        let mut metrics = GraphMetrics {
            num_nodes,
            num_edges,
            mean_degree: pure::mean_degree(num_nodes, num_edges),
            edge_density: pure::edge_density(num_nodes, num_edges),
            num_connected_components: component_sizes.len(),
            sizes_of_connected_components: component_sizes,
            num_selfloops: -1,
            diameter: -1.0,
            avg_shortest_path_length: -1.0,
            avg_clustering: -1.0,
        };

        if include_optional {
            metrics.num_selfloops = pure::self_loop_count(&edge_pairs) as i64;
            let lengths = pure::shortest_path_lengths(&node_ids, &edge_pairs);
            if !lengths.is_empty() {
                metrics.diameter = lengths.iter().copied().max().unwrap_or(0) as f64;
                metrics.avg_shortest_path_length =
                    lengths.iter().sum::<usize>() as f64 / lengths.len() as f64;
            }
            if num_nodes > 0 {
                metrics.avg_clustering = pure::average_clustering(&node_ids, &edge_pairs);
            }
        }

        Ok(metrics)
    }

    async fn get_disconnected_nodes(&self) -> Result<Vec<String>> {
        self.run_query(|conn| conn.disconnected_node_ids()).await
    }

    async fn get_model_independent_graph_data(&self) -> Result<(Vec<String>, Vec<String>)> {
        self.run_query(|conn| {
            Ok((conn.node_labels()?, conn.distinct_relationship_names()?))
        })
        .await
    }

    async fn get_degree_one_nodes(&self, node_type: &str) -> Result<Vec<NodeDict>> {
        if !matches!(node_type, "Entity" | "EntityType") {
            anyhow::bail!("node_type must be either 'Entity' or 'EntityType'");
        }
        let node_type = node_type.to_string();
        let rows = self
            .run_query(move |conn| {
                let mut rows = Vec::new();
                for row in conn.nodes_by_type(&node_type)? {
                    if conn.edges_touching(&row.id)?.len() == 1 {
                        rows.push(row);
                    }
                }
                Ok(rows)
            })
            .await?;
        Ok(rows.iter().map(Self::node_dict).collect())
    }

    async fn get_last_interaction_ids(&self, limit: usize) -> Result<Vec<String>> {
        self.run_query(move |conn| {
            let mut rows = conn.nodes_by_type(INTERACTION_NODE_TYPE)?;
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(rows.into_iter().take(limit).map(|row| row.id).collect())
        })
        .await
    }

    async fn apply_feedback_weight(&self, node_ids: &[String], weight: f64) -> Result<()> {
        // The whole read-modify-write runs inside one lock window; the
        // engine has no JSON mutation primitive, so the blob round-trips
        // through the adapter and the last writer wins.
        let _serial = self.serial_lock.lock().await;
        let ids = node_ids.to_vec();
        self.run_query(move |conn| {
            for id in &ids {
                for edge in conn.edges_out(id, Some(FEEDBACK_EDGE_LABEL))? {
                    let mut properties: Map<String, Value> =
                        serde_json::from_str(&edge.properties).unwrap_or_default();
                    let current = properties
                        .get("feedback_weight")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    properties.insert("feedback_weight".to_string(), json!(current + weight));
                    conn.set_edge_properties(&edge.key(), serde_json::to_string(&properties)?)?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn collect_time_ids(
        &self,
        time_from: Option<i64>,
        time_to: Option<i64>,
    ) -> Result<String> {
        if time_from.is_none() && time_to.is_none() {
            return Ok(String::new());
        }
        let ids = self
            .run_query(move |conn| {
                let scanned = conn.scan_json_i64(TIMESTAMP_NODE_TYPE, "time_at")?;
                Ok(scanned
                    .into_iter()
                    .filter_map(|(id, value)| value.map(|v| (id, v)))
                    .filter(|(_, v)| {
                        time_from.map_or(true, |from| *v >= from)
                            && time_to.map_or(true, |to| *v <= to)
                    })
                    .map(|(id, _)| id)
                    .collect::<Vec<_>>())
            })
            .await?;
        Ok(ids
            .iter()
            .map(|id| format!("'{id}'"))
            .collect::<Vec<_>>()
            .join(", "))
    }

    async fn collect_events(&self, ids: &[String]) -> Result<Vec<EventRecord>> {
        let seeds = ids.to_vec();
        let rows = self
            .run_query(move |conn| {
                let reachable = conn.nodes_within_hops(&seeds, 2)?;
                Ok(reachable
                    .into_iter()
                    .filter(|row| row.node_type == EVENT_NODE_TYPE)
                    .collect::<Vec<_>>())
            })
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let properties: Map<String, Value> =
                    serde_json::from_str(&row.properties).unwrap_or_default();
                EventRecord {
                    id: row.id.clone(),
                    name: row.name.clone(),
                    description: properties
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    location: properties
                        .get("location")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }
            })
            .collect())
    }

    async fn delete_graph(&self) -> Result<()> {
        let _serial = self.serial_lock.lock().await;
        *self.connection.write() = None;
        self.is_closed.store(true, Ordering::SeqCst);

        let result = async {
            let local = self.local_path.display().to_string();
            let parent = parent_dir_of(&local);
            let name = self
                .local_path
                .file_name()
                .context("database path has no file name")?
                .to_string_lossy()
                .into_owned();

            let storage = get_file_storage(&parent)?;
            if storage.is_file(&name).await? {
                storage.remove(&name).await?;
                storage.remove(&format!("{name}.lock")).await?;
                storage.remove(&format!("{name}.wal")).await?;
            } else {
                storage.remove_all(&name).await?;
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                info!("Deleted graph database files at {}", self.db_path);
                Ok(())
            }
            Err(e) => {
                error!("Failed to delete graph data: {e}");
                Err(e)
            }
        }
    }
}

// Global adapter cache: one adapter per canonical path, with a build
// lock so concurrent first-opens bootstrap exactly once.

static ADAPTER_CACHE: Lazy<DashMap<String, Arc<GraphAdapter>>> = Lazy::new(DashMap::new);
static ADAPTER_BUILD_LOCK: Lazy<tokio::sync::Mutex<()>> =
    Lazy::new(|| tokio::sync::Mutex::new(()));

fn canonical_cache_key(db_path: &str) -> String {
    if StorageProviderRegistry::is_cloud_uri(db_path) {
        return db_path.to_string();
    }
    let path = Path::new(db_path);
    if path.is_absolute() {
        db_path.to_string()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path).display().to_string())
            .unwrap_or_else(|_| db_path.to_string())
    }
}

/// Obtain the shared adapter for a path, constructing it on first use.
pub async fn get_graph_adapter(db_path: &str) -> Result<Arc<GraphAdapter>> {
    let key = canonical_cache_key(db_path);
    if let Some(adapter) = ADAPTER_CACHE.get(&key) {
        return Ok(adapter.value().clone());
    }

    let _build = ADAPTER_BUILD_LOCK.lock().await;
    if let Some(adapter) = ADAPTER_CACHE.get(&key) {
        return Ok(adapter.value().clone());
    }
    let adapter = Arc::new(GraphAdapter::new(db_path).await?);
    ADAPTER_CACHE.insert(key, adapter.clone());
    Ok(adapter)
}

/// Drop a cached adapter, e.g. after `delete_graph`.
pub fn evict_graph_adapter(db_path: &str) {
    ADAPTER_CACHE.remove(&canonical_cache_key(db_path));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_properties_happy_path() {
        let mut dict = Map::new();
        dict.insert("id".to_string(), json!("a"));
        GraphAdapter::merge_properties(&mut dict, "{\"k\":\"v\",\"n\":2}", "a");
        assert_eq!(dict["k"], json!("v"));
        assert_eq!(dict["n"], json!(2));
        assert!(!dict.contains_key("properties"));
    }

    #[test]
    fn test_merge_properties_invalid_blob_keeps_dict() {
        let mut dict = Map::new();
        dict.insert("id".to_string(), json!("a"));
        GraphAdapter::merge_properties(&mut dict, "{not json", "a");
        assert_eq!(dict.len(), 1);
        assert_eq!(dict["id"], json!("a"));
    }

    #[test]
    fn test_canonical_cache_key_absolutizes_relative_paths() {
        let key = canonical_cache_key("relative/graph.db");
        assert!(Path::new(&key).is_absolute());
        assert_eq!(canonical_cache_key("s3://bucket/db"), "s3://bucket/db");
    }
}
