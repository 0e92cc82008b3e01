// EngramDB - Embedded property-graph storage for knowledge-graph ingestion
// Root library module

pub mod cloud_storage;
pub mod cloud_sync;
pub mod config;
pub mod contracts;
pub mod file_storage;
pub mod graph_adapter;
pub mod graph_engine;
pub mod migration;
pub mod observability;
pub mod process_lock;
pub mod pure;
pub mod storage_version;
pub mod types;

// Re-export key types
pub use observability::{
    get_metrics, init_logging, init_logging_with_level, record_metric, with_trace_id, MetricType,
};

pub use contracts::{GraphData, GraphStore};

// Re-export validated types
pub use types::{
    AttributeFilter, EdgeKey, EdgeSpec, EventRecord, GraphEntity, GraphMetrics, NodeDict,
    TimestampPair,
};

// Re-export the adapter and its cache
pub use graph_adapter::{evict_graph_adapter, get_graph_adapter, GraphAdapter};

// Re-export the embedded engine surface
pub use graph_engine::{
    Connection, Database, DatabaseOptions, EdgeRow, EngineError, NodeRow, EDGE_TABLE_DDL,
    NODE_TABLE_DDL,
};

// Re-export storage-version introspection
pub use storage_version::{
    read_storage_version, read_storage_version_code, StorageVersion, StorageVersionError,
    CURRENT_STORAGE_VERSION,
};

// Re-export migration tooling
pub use migration::{migrate_in_place, MigrationError, MigrationOptions, Migrator};

// Re-export file storage
pub use file_storage::{
    get_file_storage, FileStorage, LocalFileStorage, OpenMode, StorageData, StorageManager,
};

// Re-export cloud layers
pub use cloud_storage::{
    register_default_providers, CloudStorageProvider, RegistryError, StorageProviderRegistry,
};
pub use cloud_sync::CloudSync;

// Re-export configuration
pub use config::{get_config, set_config, CloudCredentials, EngramConfig, StorageBackend};

// Re-export the cross-process lock
pub use process_lock::{graph_lock_name, NamedProcessLock, ProcessLockGuard};
