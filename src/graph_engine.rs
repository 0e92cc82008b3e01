//! Embedded property-graph engine
//!
//! A blocking, single-writer storage engine holding one node table and
//! one relationship table. The main database file carries the catalog
//! header (magic + storage version code) followed by a checksummed
//! snapshot of both tables; mutations between checkpoints are appended
//! to a `.wal` sidecar and replayed on open. A `.lock` sidecar enforces
//! exclusive access for the lifetime of the handle.
//!
//! The engine is synchronous; callers run queries on a worker executor
//! (see `GraphAdapter`) so an async scheduler is never stalled by disk
//! I/O.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::storage_version::{
    encode_header, StorageVersion, StorageVersionError, CURRENT_STORAGE_VERSION, STORAGE_MAGIC,
};
use crate::types::EdgeKey;

/// Schema DDL executed by the adapter on every open. Creation is
/// idempotent; the statements are also what `EXPORT DATABASE` writes
/// into its schema file.
pub const NODE_TABLE_DDL: &str = "CREATE NODE TABLE IF NOT EXISTS Node(\
    id STRING PRIMARY KEY, name STRING, type STRING, \
    created_at TIMESTAMP, updated_at TIMESTAMP, properties STRING)";
pub const EDGE_TABLE_DDL: &str = "CREATE REL TABLE IF NOT EXISTS EDGE(\
    FROM Node TO Node, relationship_name STRING, \
    created_at TIMESTAMP, updated_at TIMESTAMP, properties STRING)";

const SCHEMA_FILE_NAME: &str = "schema.cypher";
const EXPORT_NODES_FILE: &str = "nodes.json";
const EXPORT_EDGES_FILE: &str = "edges.json";

/// Failure classes callers need to distinguish.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("storage version mismatch: database has code {found}, engine writes code {current}")]
    VersionMismatch { found: u64, current: u64 },

    #[error("database is locked by another process: {0}")]
    Locked(PathBuf),

    #[error("extension {0} is not installed")]
    ExtensionNotInstalled(&'static str),

    #[error("extension {0} is not loaded in this connection")]
    ExtensionNotLoaded(&'static str),

    #[error("engine does not understand statement: {0}")]
    UnknownStatement(String),

    #[error("unknown column in filter: {0}")]
    UnknownColumn(String),
}

/// Engine extensions that must be installed before they can be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extension {
    Json,
}

impl Extension {
    fn name(&self) -> &'static str {
        match self {
            Extension::Json => "JSON",
        }
    }
}

// Extensions are installed once per process; loading is per-database.
static INSTALLED_EXTENSIONS: Lazy<Mutex<HashSet<Extension>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));

/// Tuning and compatibility knobs for opening a database.
#[derive(Debug, Clone, Default)]
pub struct DatabaseOptions {
    /// Accept any known storage version code instead of requiring the
    /// code this engine writes. Used by migration tooling, where the
    /// runtime environment's engine release is assumed to match the
    /// database it operates on. The adapter always opens strict.
    pub compat_open: bool,
}

/// A stored node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRow {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub properties: String,
}

/// A stored edge, key columns inlined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRow {
    pub source: String,
    pub target: String,
    pub relationship_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub properties: String,
}

impl EdgeRow {
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(
            self.source.clone(),
            self.target.clone(),
            self.relationship_name.clone(),
        )
    }
}

/// Node fields written by a merge; timestamps are resolved by the engine.
#[derive(Debug, Clone)]
pub struct NodeWrite {
    pub id: String,
    pub name: String,
    pub node_type: String,
    pub properties: String,
}

/// Edge fields written by a merge.
#[derive(Debug, Clone)]
pub struct EdgeWrite {
    pub key: EdgeKey,
    pub properties: String,
}

/// Direction selector for labeled edge deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EdgeMeta {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    properties: String,
}

#[derive(Default)]
struct TableState {
    nodes: BTreeMap<String, NodeRow>,
    edges: BTreeMap<EdgeKey, EdgeMeta>,
    edges_out: HashMap<String, BTreeSet<EdgeKey>>,
    edges_in: HashMap<String, BTreeSet<EdgeKey>>,
}

impl TableState {
    fn index_edge(&mut self, key: &EdgeKey) {
        self.edges_out
            .entry(key.source.clone())
            .or_default()
            .insert(key.clone());
        self.edges_in
            .entry(key.target.clone())
            .or_default()
            .insert(key.clone());
    }

    fn unindex_edge(&mut self, key: &EdgeKey) {
        if let Some(set) = self.edges_out.get_mut(&key.source) {
            set.remove(key);
            if set.is_empty() {
                self.edges_out.remove(&key.source);
            }
        }
        if let Some(set) = self.edges_in.get_mut(&key.target) {
            set.remove(key);
            if set.is_empty() {
                self.edges_in.remove(&key.target);
            }
        }
    }

    fn upsert_node(&mut self, row: NodeRow) {
        self.nodes.insert(row.id.clone(), row);
    }

    fn upsert_edge(&mut self, row: EdgeRow) {
        let key = row.key();
        self.edges.insert(
            key.clone(),
            EdgeMeta {
                created_at: row.created_at,
                updated_at: row.updated_at,
                properties: row.properties,
            },
        );
        self.index_edge(&key);
    }

    fn remove_node(&mut self, id: &str) {
        if self.nodes.remove(id).is_none() {
            return;
        }
        // Detach: drop every incident edge.
        let mut incident: BTreeSet<EdgeKey> = BTreeSet::new();
        if let Some(out) = self.edges_out.get(id) {
            incident.extend(out.iter().cloned());
        }
        if let Some(inc) = self.edges_in.get(id) {
            incident.extend(inc.iter().cloned());
        }
        for key in incident {
            self.edges.remove(&key);
            self.unindex_edge(&key);
        }
    }

    fn remove_edge(&mut self, key: &EdgeKey) {
        if self.edges.remove(key).is_some() {
            self.unindex_edge(key);
        }
    }

    fn edge_row(&self, key: &EdgeKey) -> Option<EdgeRow> {
        self.edges.get(key).map(|meta| EdgeRow {
            source: key.source.clone(),
            target: key.target.clone(),
            relationship_name: key.label.clone(),
            created_at: meta.created_at,
            updated_at: meta.updated_at,
            properties: meta.properties.clone(),
        })
    }

    fn incident_keys(&self, id: &str) -> BTreeSet<EdgeKey> {
        let mut keys: BTreeSet<EdgeKey> = BTreeSet::new();
        if let Some(out) = self.edges_out.get(id) {
            keys.extend(out.iter().cloned());
        }
        if let Some(inc) = self.edges_in.get(id) {
            keys.extend(inc.iter().cloned());
        }
        keys
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    nodes: Vec<NodeRow>,
    edges: Vec<EdgeRow>,
}

/// WAL records store rows post-resolution so replay is deterministic.
#[derive(Serialize, Deserialize)]
enum WalRecord {
    UpsertNodes(Vec<NodeRow>),
    UpsertEdges(Vec<EdgeRow>),
    DeleteNodes(Vec<String>),
    DeleteEdges(Vec<EdgeKey>),
}

struct DbInner {
    path: PathBuf,
    wal_path: PathBuf,
    lock_path: PathBuf,
    version: StorageVersion,
    state: RwLock<TableState>,
    wal: Mutex<Option<File>>,
    loaded_extensions: RwLock<HashSet<Extension>>,
}

impl Drop for DbInner {
    fn drop(&mut self) {
        // Release the exclusive lock sidecar.
        let _ = fs::remove_file(&self.lock_path);
    }
}

/// Handle to an open database. Cheap to clone; the underlying state is
/// shared and internally synchronized.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or implicitly create) the database at `path`.
    ///
    /// The main file is created with the current storage version when it
    /// does not exist. An existing file whose version code differs from
    /// the engine's is refused with [`EngineError::VersionMismatch`]
    /// unless `compat_open` is set, in which case any known code is
    /// accepted and preserved on checkpoint.
    pub fn open(path: impl AsRef<Path>, options: DatabaseOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let lock_path = sidecar(&path, "lock");
        let wal_path = sidecar(&path, "wal");
        acquire_lock(&lock_path)?;

        // Drop the lock on any failure below.
        let open_result = (|| -> Result<DbInner> {
            let (version, state) = if path.exists() {
                read_main_file(&path, &options)?
            } else {
                let version = CURRENT_STORAGE_VERSION;
                write_main_file(&path, version, &TableState::default())?;
                (version, TableState::default())
            };

            let inner = DbInner {
                path: path.clone(),
                wal_path: wal_path.clone(),
                lock_path: lock_path.clone(),
                version,
                state: RwLock::new(state),
                wal: Mutex::new(None),
                loaded_extensions: RwLock::new(HashSet::new()),
            };

            replay_wal(&inner)?;

            let wal_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&wal_path)
                .with_context(|| format!("failed to open WAL file: {}", wal_path.display()))?;
            *inner.wal.lock() = Some(wal_file);

            Ok(inner)
        })();

        match open_result {
            Ok(inner) => {
                debug!("opened graph database at {}", path.display());
                Ok(Self {
                    inner: Arc::new(inner),
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&lock_path);
                Err(e)
            }
        }
    }

    /// Create a connection to this database.
    pub fn connect(&self) -> Connection {
        Connection { db: self.clone() }
    }

    /// The storage version this handle reads and writes.
    pub fn storage_version(&self) -> StorageVersion {
        self.inner.version
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn append_wal(&self, record: &WalRecord) -> Result<()> {
        let payload = bincode::serialize(record).context("failed to serialize WAL record")?;
        let mut guard = self.inner.wal.lock();
        let file = guard
            .as_mut()
            .context("WAL writer is not initialized")?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&crc32c::crc32c(&payload).to_le_bytes())?;
        file.write_all(&payload)?;
        file.flush()?;
        Ok(())
    }

    /// Flush both tables into the main file and truncate the WAL so the
    /// on-disk files are safe to copy.
    pub fn checkpoint(&self) -> Result<()> {
        let state = self.inner.state.read();
        write_main_file(&self.inner.path, self.inner.version, &state)?;
        drop(state);

        let mut guard = self.inner.wal.lock();
        if let Some(file) = guard.as_mut() {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.sync_all()?;
        }
        debug!("checkpoint written to {}", self.inner.path.display());
        Ok(())
    }
}

/// Query surface over an open database.
///
/// One logical connection; clones share the handle. Mutating operations
/// append to the WAL before touching the in-memory tables.
#[derive(Clone)]
pub struct Connection {
    db: Database,
}

impl Connection {
    /// Execute an opaque admin statement and return its rows.
    ///
    /// The engine understands `CHECKPOINT`, `INSTALL JSON`,
    /// `LOAD EXTENSION JSON`, idempotent `CREATE ... TABLE IF NOT
    /// EXISTS` DDL, `EXPORT DATABASE '<dir>'` and
    /// `IMPORT DATABASE '<dir>'`. Anything else is refused.
    pub fn execute(&self, statement: &str) -> Result<Vec<Vec<Value>>> {
        let stmt = statement.trim().trim_end_matches(';').trim();
        let upper = stmt.to_uppercase();

        if upper == "CHECKPOINT" {
            self.db.checkpoint()?;
            return Ok(Vec::new());
        }
        if upper == "INSTALL JSON" {
            INSTALLED_EXTENSIONS.lock().insert(Extension::Json);
            return Ok(Vec::new());
        }
        if upper == "LOAD EXTENSION JSON" {
            self.load_extension(Extension::Json)?;
            return Ok(Vec::new());
        }
        if upper.starts_with("CREATE NODE TABLE IF NOT EXISTS")
            || upper.starts_with("CREATE REL TABLE IF NOT EXISTS")
        {
            // The node and relationship tables are intrinsic; creation
            // is a no-op as long as the DDL is the IF NOT EXISTS form.
            return Ok(Vec::new());
        }
        if let Some(dir) = parse_quoted_suffix(stmt, "EXPORT DATABASE") {
            self.export_database(Path::new(&dir))?;
            return Ok(Vec::new());
        }
        if let Some(dir) = parse_quoted_suffix(stmt, "IMPORT DATABASE") {
            self.import_database(Path::new(&dir))?;
            return Ok(Vec::new());
        }

        Err(EngineError::UnknownStatement(stmt.to_string()).into())
    }

    fn load_extension(&self, extension: Extension) -> Result<()> {
        if !INSTALLED_EXTENSIONS.lock().contains(&extension) {
            return Err(EngineError::ExtensionNotInstalled(extension.name()).into());
        }
        self.db.inner.loaded_extensions.write().insert(extension);
        Ok(())
    }

    fn require_extension(&self, extension: Extension) -> Result<()> {
        if !self.db.inner.loaded_extensions.read().contains(&extension) {
            return Err(EngineError::ExtensionNotLoaded(extension.name()).into());
        }
        Ok(())
    }

    // Node operations

    pub fn has_node(&self, id: &str) -> Result<bool> {
        Ok(self.db.inner.state.read().nodes.contains_key(id))
    }

    pub fn node_count(&self) -> Result<usize> {
        Ok(self.db.inner.state.read().nodes.len())
    }

    /// Merge nodes by id: core columns are overwritten, `updated_at`
    /// refreshed, `created_at` kept from the existing row.
    pub fn merge_nodes(&self, writes: &[NodeWrite], now: DateTime<Utc>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let resolved: Vec<NodeRow> = {
            let state = self.db.inner.state.read();
            writes
                .iter()
                .map(|write| {
                    let created_at = state
                        .nodes
                        .get(&write.id)
                        .map(|existing| existing.created_at)
                        .unwrap_or(now);
                    NodeRow {
                        id: write.id.clone(),
                        name: write.name.clone(),
                        node_type: write.node_type.clone(),
                        created_at,
                        updated_at: now,
                        properties: write.properties.clone(),
                    }
                })
                .collect()
        };

        self.db.append_wal(&WalRecord::UpsertNodes(resolved.clone()))?;
        let mut state = self.db.inner.state.write();
        for row in resolved {
            state.upsert_node(row);
        }
        Ok(())
    }

    /// Detach-delete nodes: every incident edge goes with them.
    pub fn delete_nodes(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.db.append_wal(&WalRecord::DeleteNodes(ids.to_vec()))?;
        let mut state = self.db.inner.state.write();
        for id in ids {
            state.remove_node(id);
        }
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Result<Option<NodeRow>> {
        Ok(self.db.inner.state.read().nodes.get(id).cloned())
    }

    pub fn get_nodes(&self, ids: &[String]) -> Result<Vec<NodeRow>> {
        let state = self.db.inner.state.read();
        Ok(ids
            .iter()
            .filter_map(|id| state.nodes.get(id).cloned())
            .collect())
    }

    pub fn all_nodes(&self) -> Result<Vec<NodeRow>> {
        Ok(self.db.inner.state.read().nodes.values().cloned().collect())
    }

    pub fn nodes_by_type_and_names(
        &self,
        node_type: &str,
        names: &[String],
    ) -> Result<Vec<NodeRow>> {
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        let state = self.db.inner.state.read();
        Ok(state
            .nodes
            .values()
            .filter(|row| row.node_type == node_type && wanted.contains(row.name.as_str()))
            .cloned()
            .collect())
    }

    pub fn nodes_by_type(&self, node_type: &str) -> Result<Vec<NodeRow>> {
        let state = self.db.inner.state.read();
        Ok(state
            .nodes
            .values()
            .filter(|row| row.node_type == node_type)
            .cloned()
            .collect())
    }

    /// Nodes whose materialized columns satisfy every filter.
    /// Filters may address `id`, `name` and `type` only; anything else
    /// is a schema error.
    pub fn filter_nodes(&self, filters: &[(String, Vec<String>)]) -> Result<Vec<NodeRow>> {
        for (attribute, _) in filters {
            if !matches!(attribute.as_str(), "id" | "name" | "type") {
                return Err(EngineError::UnknownColumn(attribute.clone()).into());
            }
        }
        let state = self.db.inner.state.read();
        Ok(state
            .nodes
            .values()
            .filter(|row| {
                filters.iter().all(|(attribute, values)| {
                    let column = match attribute.as_str() {
                        "id" => &row.id,
                        "name" => &row.name,
                        _ => &row.node_type,
                    };
                    values.iter().any(|v| v == column)
                })
            })
            .cloned()
            .collect())
    }

    // Edge operations

    pub fn has_edge(&self, key: &EdgeKey) -> Result<bool> {
        Ok(self.db.inner.state.read().edges.contains_key(key))
    }

    pub fn edge_count(&self) -> Result<usize> {
        Ok(self.db.inner.state.read().edges.len())
    }

    /// Of the given identities, the ones present in the table.
    pub fn existing_edges(&self, keys: &[EdgeKey]) -> Result<Vec<EdgeKey>> {
        let state = self.db.inner.state.read();
        Ok(keys
            .iter()
            .filter(|key| state.edges.contains_key(key))
            .cloned()
            .collect())
    }

    /// Merge edges by identity. An edge whose endpoints are not both
    /// present is not created (match semantics, not create semantics).
    /// On an existing identity, `updated_at` and the properties blob are
    /// overwritten and `created_at` is preserved.
    pub fn merge_edges(&self, writes: &[EdgeWrite], now: DateTime<Utc>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let resolved: Vec<EdgeRow> = {
            let state = self.db.inner.state.read();
            writes
                .iter()
                .filter(|write| {
                    state.nodes.contains_key(&write.key.source)
                        && state.nodes.contains_key(&write.key.target)
                })
                .map(|write| {
                    let created_at = state
                        .edges
                        .get(&write.key)
                        .map(|meta| meta.created_at)
                        .unwrap_or(now);
                    EdgeRow {
                        source: write.key.source.clone(),
                        target: write.key.target.clone(),
                        relationship_name: write.key.label.clone(),
                        created_at,
                        updated_at: now,
                        properties: write.properties.clone(),
                    }
                })
                .collect()
        };
        if resolved.is_empty() {
            return Ok(());
        }

        self.db.append_wal(&WalRecord::UpsertEdges(resolved.clone()))?;
        let mut state = self.db.inner.state.write();
        for row in resolved {
            state.upsert_edge(row);
        }
        Ok(())
    }

    pub fn all_edges(&self) -> Result<Vec<EdgeRow>> {
        let state = self.db.inner.state.read();
        Ok(state
            .edges
            .keys()
            .filter_map(|key| state.edge_row(key))
            .collect())
    }

    /// Every edge incident to a node, regardless of direction.
    pub fn edges_touching(&self, id: &str) -> Result<Vec<EdgeRow>> {
        let state = self.db.inner.state.read();
        Ok(state
            .incident_keys(id)
            .iter()
            .filter_map(|key| state.edge_row(key))
            .collect())
    }

    pub fn edges_out(&self, id: &str, label: Option<&str>) -> Result<Vec<EdgeRow>> {
        let state = self.db.inner.state.read();
        Ok(state
            .edges_out
            .get(id)
            .into_iter()
            .flatten()
            .filter(|key| label.map_or(true, |l| key.label == l))
            .filter_map(|key| state.edge_row(key))
            .collect())
    }

    pub fn edges_in(&self, id: &str, label: Option<&str>) -> Result<Vec<EdgeRow>> {
        let state = self.db.inner.state.read();
        Ok(state
            .edges_in
            .get(id)
            .into_iter()
            .flatten()
            .filter(|key| label.map_or(true, |l| key.label == l))
            .filter_map(|key| state.edge_row(key))
            .collect())
    }

    /// Distinct nodes adjacent to `id` in either direction.
    pub fn neighbors(&self, id: &str) -> Result<Vec<NodeRow>> {
        let state = self.db.inner.state.read();
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for key in state.incident_keys(id) {
            let other = if key.source == id {
                &key.target
            } else {
                &key.source
            };
            if let Some(row) = state.nodes.get(other) {
                seen.insert(row.id.as_str());
            }
        }
        Ok(seen
            .into_iter()
            .filter_map(|other| state.nodes.get(other).cloned())
            .collect())
    }

    pub fn delete_edges(&self, keys: &[EdgeKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.db.append_wal(&WalRecord::DeleteEdges(keys.to_vec()))?;
        let mut state = self.db.inner.state.write();
        for key in keys {
            state.remove_edge(key);
        }
        Ok(())
    }

    /// Delete every labeled edge leaving (or entering) the given nodes.
    pub fn delete_labeled_edges(
        &self,
        ids: &[String],
        label: &str,
        direction: EdgeDirection,
    ) -> Result<()> {
        let keys: Vec<EdgeKey> = {
            let state = self.db.inner.state.read();
            ids.iter()
                .flat_map(|id| {
                    let index = match direction {
                        EdgeDirection::Outgoing => state.edges_out.get(id),
                        EdgeDirection::Incoming => state.edges_in.get(id),
                    };
                    index
                        .into_iter()
                        .flatten()
                        .filter(|key| key.label == label)
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        self.delete_edges(&keys)
    }

    /// Overwrite an edge's properties blob, leaving timestamps alone.
    pub fn set_edge_properties(&self, key: &EdgeKey, properties: String) -> Result<()> {
        let resolved = {
            let state = self.db.inner.state.read();
            match state.edge_row(key) {
                Some(mut row) => {
                    row.properties = properties;
                    row
                }
                None => return Ok(()),
            }
        };
        self.db.append_wal(&WalRecord::UpsertEdges(vec![resolved.clone()]))?;
        self.db.inner.state.write().upsert_edge(resolved);
        Ok(())
    }

    // Graph-wide reads

    /// Ids of nodes without a single incident edge.
    pub fn disconnected_node_ids(&self) -> Result<Vec<String>> {
        let state = self.db.inner.state.read();
        Ok(state
            .nodes
            .keys()
            .filter(|id| {
                !state.edges_out.contains_key(*id) && !state.edges_in.contains_key(*id)
            })
            .cloned()
            .collect())
    }

    /// Distinct node table labels present (one fixed table).
    pub fn node_labels(&self) -> Result<Vec<String>> {
        let state = self.db.inner.state.read();
        if state.nodes.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec!["Node".to_string()])
        }
    }

    pub fn distinct_relationship_names(&self) -> Result<Vec<String>> {
        let state = self.db.inner.state.read();
        let names: BTreeSet<String> =
            state.edges.keys().map(|key| key.label.clone()).collect();
        Ok(names.into_iter().collect())
    }

    /// Distinct nodes reachable from the seed set within `1..=max_hops`
    /// undirected hops. Seeds themselves are excluded unless reachable
    /// through a cycle.
    pub fn nodes_within_hops(&self, ids: &[String], max_hops: usize) -> Result<Vec<NodeRow>> {
        let state = self.db.inner.state.read();
        let mut found: BTreeSet<String> = BTreeSet::new();

        for seed in ids {
            let mut depths: HashMap<&str, usize> = HashMap::new();
            let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
            depths.insert(seed.as_str(), 0);
            queue.push_back((seed.as_str(), 0));

            while let Some((current, depth)) = queue.pop_front() {
                if depth == max_hops {
                    continue;
                }
                for key in state.incident_keys(current) {
                    let other = if key.source == current {
                        key.target.clone()
                    } else {
                        key.source.clone()
                    };
                    let other_ref = state.nodes.get(&other).map(|row| row.id.as_str());
                    if let Some(other_id) = other_ref {
                        if !depths.contains_key(other_id) {
                            depths.insert(other_id, depth + 1);
                            found.insert(other_id.to_string());
                            queue.push_back((other_id, depth + 1));
                        }
                    }
                }
            }
        }

        Ok(found
            .iter()
            .filter_map(|id| state.nodes.get(id).cloned())
            .collect())
    }

    /// Extract an i64-castable JSON field from the property blobs of
    /// nodes of one type. Requires the JSON extension to be loaded.
    pub fn scan_json_i64(
        &self,
        node_type: &str,
        field: &str,
    ) -> Result<Vec<(String, Option<i64>)>> {
        self.require_extension(Extension::Json)?;
        let state = self.db.inner.state.read();
        Ok(state
            .nodes
            .values()
            .filter(|row| row.node_type == node_type)
            .map(|row| {
                let extracted = serde_json::from_str::<Value>(&row.properties)
                    .ok()
                    .and_then(|value| value.get(field).cloned())
                    .and_then(|value| match value {
                        Value::Number(n) => n.as_i64(),
                        Value::String(s) if !s.is_empty() => s.parse::<i64>().ok(),
                        _ => None,
                    });
                (row.id.clone(), extracted)
            })
            .collect())
    }

    // Export / import

    /// Write the schema file and both table payloads into `dir`.
    pub fn export_database(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create export directory: {}", dir.display()))?;

        let schema = format!("{};\n{};\n", NODE_TABLE_DDL, EDGE_TABLE_DDL);
        fs::write(dir.join(SCHEMA_FILE_NAME), schema)?;

        let state = self.db.inner.state.read();
        let nodes: Vec<&NodeRow> = state.nodes.values().collect();
        let edges: Vec<EdgeRow> = state
            .edges
            .keys()
            .filter_map(|key| state.edge_row(key))
            .collect();

        fs::write(
            dir.join(EXPORT_NODES_FILE),
            serde_json::to_vec_pretty(&nodes)?,
        )?;
        fs::write(
            dir.join(EXPORT_EDGES_FILE),
            serde_json::to_vec_pretty(&edges)?,
        )?;
        Ok(())
    }

    /// Load an export produced by [`Self::export_database`] into this
    /// database. The database must be empty; stored timestamps are
    /// preserved. Ends with a checkpoint so the import is durable.
    pub fn import_database(&self, dir: &Path) -> Result<()> {
        let schema_path = dir.join(SCHEMA_FILE_NAME);
        let schema = fs::read_to_string(&schema_path)
            .with_context(|| format!("failed to read schema file: {}", schema_path.display()))?;
        if schema.trim().is_empty() {
            bail!("schema file is empty: {}", schema_path.display());
        }

        if self.node_count()? > 0 {
            bail!("cannot import into a non-empty database");
        }

        let nodes: Vec<NodeRow> =
            serde_json::from_slice(&fs::read(dir.join(EXPORT_NODES_FILE))?)?;
        let edges: Vec<EdgeRow> =
            serde_json::from_slice(&fs::read(dir.join(EXPORT_EDGES_FILE))?)?;

        self.db.append_wal(&WalRecord::UpsertNodes(nodes.clone()))?;
        self.db.append_wal(&WalRecord::UpsertEdges(edges.clone()))?;
        {
            let mut state = self.db.inner.state.write();
            for row in nodes {
                state.upsert_node(row);
            }
            for row in edges {
                state.upsert_edge(row);
            }
        }
        self.db.checkpoint()
    }
}

fn sidecar(path: &Path, extension: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".");
    os.push(extension);
    PathBuf::from(os)
}

fn acquire_lock(lock_path: &Path) -> Result<()> {
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(mut file) => {
            let _ = write!(file, "{}", std::process::id());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(EngineError::Locked(lock_path.to_path_buf()).into())
        }
        Err(e) => Err(e).with_context(|| {
            format!("failed to create lock file: {}", lock_path.display())
        }),
    }
}

fn read_main_file(path: &Path, options: &DatabaseOptions) -> Result<(StorageVersion, TableState)> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open database file: {}", path.display()))?;

    let mut header = [0u8; 12];
    file.read_exact(&mut header)
        .map_err(|_| StorageVersionError::HeaderTruncated(path.to_path_buf()))?;
    if &header[..3] != STORAGE_MAGIC {
        return Err(StorageVersionError::BadMagic {
            path: path.to_path_buf(),
        }
        .into());
    }

    let mut code_bytes = [0u8; 8];
    code_bytes.copy_from_slice(&header[4..12]);
    let code = u64::from_le_bytes(code_bytes);
    let version = StorageVersion::from_code(code)?;

    if !options.compat_open && version != CURRENT_STORAGE_VERSION {
        return Err(EngineError::VersionMismatch {
            found: code,
            current: CURRENT_STORAGE_VERSION.code(),
        }
        .into());
    }

    let mut crc_bytes = [0u8; 4];
    file.read_exact(&mut crc_bytes)
        .context("database snapshot frame is truncated")?;
    let expected_crc = u32::from_le_bytes(crc_bytes);

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)
        .context("database snapshot frame is truncated")?;
    let body_len = u64::from_le_bytes(len_bytes) as usize;

    let mut body = vec![0u8; body_len];
    file.read_exact(&mut body)
        .context("database snapshot body is truncated")?;
    if crc32c::crc32c(&body) != expected_crc {
        bail!(
            "database snapshot checksum mismatch: {} is corrupt",
            path.display()
        );
    }

    let snapshot: Snapshot =
        bincode::deserialize(&body).context("failed to decode database snapshot")?;
    let mut state = TableState::default();
    for row in snapshot.nodes {
        state.upsert_node(row);
    }
    for row in snapshot.edges {
        state.upsert_edge(row);
    }
    Ok((version, state))
}

fn write_main_file(path: &Path, version: StorageVersion, state: &TableState) -> Result<()> {
    let snapshot = Snapshot {
        nodes: state.nodes.values().cloned().collect(),
        edges: state
            .edges
            .keys()
            .filter_map(|key| state.edge_row(key))
            .collect(),
    };
    let body = bincode::serialize(&snapshot).context("failed to encode database snapshot")?;

    let tmp_path = sidecar(path, "tmp");
    let mut file = File::create(&tmp_path)
        .with_context(|| format!("failed to create snapshot file: {}", tmp_path.display()))?;
    file.write_all(&encode_header(version))?;
    file.write_all(&crc32c::crc32c(&body).to_le_bytes())?;
    file.write_all(&(body.len() as u64).to_le_bytes())?;
    file.write_all(&body)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to move snapshot into place: {}", path.display()))?;
    Ok(())
}

fn replay_wal(inner: &DbInner) -> Result<()> {
    let Ok(mut file) = File::open(&inner.wal_path) else {
        return Ok(());
    };

    let mut replayed = 0usize;
    loop {
        let mut len_bytes = [0u8; 4];
        match file.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(_) => break,
        }
        let mut crc_bytes = [0u8; 4];
        if file.read_exact(&mut crc_bytes).is_err() {
            warn!("WAL has a truncated frame header; dropping tail");
            break;
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        if file.read_exact(&mut payload).is_err() {
            warn!("WAL has a truncated frame body; dropping tail");
            break;
        }
        if crc32c::crc32c(&payload) != u32::from_le_bytes(crc_bytes) {
            warn!("WAL frame checksum mismatch; dropping tail");
            break;
        }
        let Ok(record) = bincode::deserialize::<WalRecord>(&payload) else {
            warn!("WAL frame does not decode; dropping tail");
            break;
        };

        let mut state = inner.state.write();
        match record {
            WalRecord::UpsertNodes(rows) => {
                for row in rows {
                    state.upsert_node(row);
                }
            }
            WalRecord::UpsertEdges(rows) => {
                for row in rows {
                    state.upsert_edge(row);
                }
            }
            WalRecord::DeleteNodes(ids) => {
                for id in &ids {
                    state.remove_node(id);
                }
            }
            WalRecord::DeleteEdges(keys) => {
                for key in &keys {
                    state.remove_edge(key);
                }
            }
        }
        replayed += 1;
    }

    if replayed > 0 {
        debug!("replayed {} WAL records", replayed);
    }
    Ok(())
}

fn parse_quoted_suffix(stmt: &str, prefix: &str) -> Option<String> {
    let upper = stmt.to_uppercase();
    if !upper.starts_with(prefix) {
        return None;
    }
    let rest = stmt[prefix.len()..].trim();
    let rest = rest.strip_prefix('\'')?;
    let rest = rest.strip_suffix('\'')?;
    Some(rest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, name: &str) -> NodeWrite {
        NodeWrite {
            id: id.to_string(),
            name: name.to_string(),
            node_type: "Doc".to_string(),
            properties: "{}".to_string(),
        }
    }

    fn edge(source: &str, target: &str, label: &str) -> EdgeWrite {
        EdgeWrite {
            key: EdgeKey::new(source, target, label),
            properties: "{}".to_string(),
        }
    }

    fn open_db(dir: &Path) -> Database {
        Database::open(dir.join("graph.db"), DatabaseOptions::default()).unwrap()
    }

    #[test]
    fn test_open_creates_file_and_sidecars() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("graph.db");
        let db = Database::open(&path, DatabaseOptions::default())?;

        assert!(path.exists());
        assert!(sidecar(&path, "lock").exists());
        assert_eq!(db.storage_version(), CURRENT_STORAGE_VERSION);

        drop(db);
        assert!(!sidecar(&path, "lock").exists(), "lock released on drop");
        Ok(())
    }

    #[test]
    fn test_second_open_is_refused_while_locked() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("graph.db");
        let _db = Database::open(&path, DatabaseOptions::default())?;

        let err = Database::open(&path, DatabaseOptions::default()).unwrap_err();
        assert!(err.downcast_ref::<EngineError>().is_some());
        Ok(())
    }

    #[test]
    fn test_merge_preserves_created_at() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open_db(dir.path());
        let conn = db.connect();

        let first = Utc::now();
        conn.merge_nodes(&[node("a", "A")], first)?;
        let created = conn.get_node("a")?.unwrap().created_at;

        let later = first + chrono::Duration::seconds(5);
        conn.merge_nodes(&[node("a", "A2")], later)?;

        let row = conn.get_node("a")?.unwrap();
        assert_eq!(row.created_at, created);
        assert_eq!(row.updated_at, later);
        assert_eq!(row.name, "A2");
        Ok(())
    }

    #[test]
    fn test_edge_requires_existing_endpoints() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open_db(dir.path());
        let conn = db.connect();
        let now = Utc::now();

        conn.merge_nodes(&[node("a", "A")], now)?;
        conn.merge_edges(&[edge("a", "ghost", "mentions")], now)?;
        assert_eq!(conn.edge_count()?, 0);

        conn.merge_nodes(&[node("b", "B")], now)?;
        conn.merge_edges(&[edge("a", "b", "mentions")], now)?;
        assert_eq!(conn.edge_count()?, 1);
        Ok(())
    }

    #[test]
    fn test_edge_merge_is_idempotent_by_identity() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open_db(dir.path());
        let conn = db.connect();
        let now = Utc::now();

        conn.merge_nodes(&[node("a", "A"), node("b", "B")], now)?;
        conn.merge_edges(&[edge("a", "b", "mentions")], now)?;
        let created = conn.all_edges()?[0].created_at;

        let later = now + chrono::Duration::seconds(3);
        let mut update = edge("a", "b", "mentions");
        update.properties = "{\"w\":2}".to_string();
        conn.merge_edges(&[update], later)?;

        let rows = conn.all_edges()?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].created_at, created);
        assert_eq!(rows[0].updated_at, later);
        assert_eq!(rows[0].properties, "{\"w\":2}");
        Ok(())
    }

    #[test]
    fn test_detach_delete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open_db(dir.path());
        let conn = db.connect();
        let now = Utc::now();

        conn.merge_nodes(&[node("a", "A"), node("b", "B"), node("c", "C")], now)?;
        conn.merge_edges(
            &[edge("a", "b", "x"), edge("b", "c", "y"), edge("c", "a", "z")],
            now,
        )?;

        conn.delete_nodes(&["a".to_string()])?;
        assert!(!conn.has_node("a")?);
        assert_eq!(conn.edge_count()?, 1);
        assert!(conn.has_edge(&EdgeKey::new("b", "c", "y"))?);
        Ok(())
    }

    #[test]
    fn test_wal_replay_without_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("graph.db");
        {
            let db = Database::open(&path, DatabaseOptions::default())?;
            let conn = db.connect();
            let now = Utc::now();
            conn.merge_nodes(&[node("a", "A"), node("b", "B")], now)?;
            conn.merge_edges(&[edge("a", "b", "mentions")], now)?;
            // No checkpoint: data lives only in the WAL.
        }
        {
            let db = Database::open(&path, DatabaseOptions::default())?;
            let conn = db.connect();
            assert!(conn.has_node("a")?);
            assert!(conn.has_edge(&EdgeKey::new("a", "b", "mentions"))?);
        }
        Ok(())
    }

    #[test]
    fn test_checkpoint_truncates_wal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("graph.db");
        let db = Database::open(&path, DatabaseOptions::default())?;
        let conn = db.connect();
        conn.merge_nodes(&[node("a", "A")], Utc::now())?;

        let wal = sidecar(&path, "wal");
        assert!(fs::metadata(&wal)?.len() > 0);
        db.checkpoint()?;
        assert_eq!(fs::metadata(&wal)?.len(), 0);

        drop(conn);
        drop(db);
        let db = Database::open(&path, DatabaseOptions::default())?;
        assert!(db.connect().has_node("a")?);
        Ok(())
    }

    #[test]
    fn test_version_mismatch_is_refused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("graph.db");
        {
            let db = Database::open(&path, DatabaseOptions::default())?;
            db.checkpoint()?;
        }

        // Patch the header down to an older known code.
        let mut bytes = fs::read(&path)?;
        bytes[4..12].copy_from_slice(&37u64.to_le_bytes());
        fs::write(&path, &bytes)?;

        let err = Database::open(&path, DatabaseOptions::default()).unwrap_err();
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::VersionMismatch { found, .. }) => assert_eq!(*found, 37),
            other => panic!("expected VersionMismatch, got {:?}", other),
        }

        // Compat mode accepts the old code and preserves it.
        let db = Database::open(
            &path,
            DatabaseOptions { compat_open: true },
        )?;
        assert_eq!(db.storage_version(), StorageVersion::V0_9_0);
        Ok(())
    }

    #[test]
    fn test_export_import_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = Database::open(dir.path().join("src.db"), DatabaseOptions::default())?;
        let conn = source.connect();
        let now = Utc::now();
        conn.merge_nodes(&[node("a", "A"), node("b", "B")], now)?;
        conn.merge_edges(&[edge("a", "b", "mentions")], now)?;

        let export_dir = dir.path().join("export");
        conn.export_database(&export_dir)?;
        assert!(export_dir.join("schema.cypher").exists());

        let target = Database::open(dir.path().join("dst.db"), DatabaseOptions::default())?;
        let target_conn = target.connect();
        target_conn.import_database(&export_dir)?;

        assert_eq!(target_conn.node_count()?, 2);
        assert_eq!(target_conn.edge_count()?, 1);
        let original = conn.get_node("a")?.unwrap();
        let imported = target_conn.get_node("a")?.unwrap();
        assert_eq!(imported.created_at, original.created_at);
        Ok(())
    }

    #[test]
    fn test_json_extension_gating() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open_db(dir.path());
        let conn = db.connect();
        let now = Utc::now();
        let mut ts = node("t1", "ts");
        ts.node_type = "Timestamp".to_string();
        ts.properties = "{\"time_at\": \"1700000000\"}".to_string();
        conn.merge_nodes(&[ts], now)?;

        let err = conn.scan_json_i64("Timestamp", "time_at").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::ExtensionNotLoaded("JSON"))
        ));

        conn.execute("INSTALL JSON;")?;
        conn.execute("LOAD EXTENSION JSON;")?;
        let values = conn.scan_json_i64("Timestamp", "time_at")?;
        assert_eq!(values, vec![("t1".to_string(), Some(1_700_000_000))]);
        Ok(())
    }

    #[test]
    fn test_unknown_statement_is_refused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open_db(dir.path());
        let err = db.connect().execute("MATCH (n) RETURN n").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::UnknownStatement(_))
        ));
        Ok(())
    }

    #[test]
    fn test_filter_nodes_unknown_column() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open_db(dir.path());
        let conn = db.connect();
        let err = conn
            .filter_nodes(&[("color".to_string(), vec!["red".to_string()])])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::UnknownColumn(_))
        ));
        Ok(())
    }
}
