// Integration tests for cross-version migration: real subprocess steps
// through the compiled CLI, storage-version detection, in-place
// overwrite semantics and the adapter's automatic migration on open.
use anyhow::Result;
use chrono::Utc;
use engramdb::{
    Connection, Database, DatabaseOptions, EngramConfig, GraphAdapter, GraphStore,
    MigrationOptions, Migrator, StorageVersion, CURRENT_STORAGE_VERSION,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Stage the compiled CLI as the engine release for the given versions.
fn stage_releases(dir: &Path, versions: &[StorageVersion]) -> Result<PathBuf> {
    let releases = dir.join("releases");
    fs::create_dir_all(&releases)?;
    let cli = env!("CARGO_BIN_EXE_engramdb");
    for version in versions {
        fs::copy(cli, releases.join(format!("engramdb-{}", version.release())))?;
    }
    Ok(releases)
}

fn seed_database(path: &Path) -> Result<()> {
    let database = Database::open(path, DatabaseOptions::default())?;
    let connection = database.connect();
    seed_connection(&connection)?;
    database.checkpoint()?;
    Ok(())
}

fn seed_connection(connection: &Connection) -> Result<()> {
    let now = Utc::now();
    connection.merge_nodes(
        &[
            engramdb::graph_engine::NodeWrite {
                id: "a".into(),
                name: "A".into(),
                node_type: "Doc".into(),
                properties: "{\"k\":\"v\"}".into(),
            },
            engramdb::graph_engine::NodeWrite {
                id: "b".into(),
                name: "B".into(),
                node_type: "Doc".into(),
                properties: "{}".into(),
            },
        ],
        now,
    )?;
    connection.merge_edges(
        &[engramdb::graph_engine::EdgeWrite {
            key: engramdb::EdgeKey::new("a", "b", "mentions"),
            properties: "{\"w\":1}".into(),
        }],
        now,
    )?;
    Ok(())
}

fn patch_version_code(path: &Path, code: u64) -> Result<()> {
    let mut bytes = fs::read(path)?;
    bytes[4..12].copy_from_slice(&code.to_le_bytes());
    fs::write(path, &bytes)?;
    Ok(())
}

#[test]
fn test_same_version_migration_is_a_noop_on_data() -> Result<()> {
    let temp = TempDir::new()?;
    let old_db = temp.path().join("old.db");
    seed_database(&old_db)?;
    let releases = stage_releases(temp.path(), &[CURRENT_STORAGE_VERSION])?;

    let new_db = temp.path().join("new.db");
    Migrator::with_releases_dir(&releases).migrate(&MigrationOptions {
        old_db: old_db.clone(),
        new_db: new_db.clone(),
        old_version: None,
        new_version: CURRENT_STORAGE_VERSION,
        overwrite: false,
        delete_old: false,
    })?;

    // Original untouched, new database holds identical data.
    assert!(old_db.exists());
    let old = Database::open(&old_db, DatabaseOptions::default())?;
    let new = Database::open(&new_db, DatabaseOptions::default())?;
    let old_conn = old.connect();
    let new_conn = new.connect();

    assert_eq!(old_conn.node_count()?, new_conn.node_count()?);
    assert_eq!(old_conn.edge_count()?, new_conn.edge_count()?);
    let old_a = old_conn.get_node("a")?.unwrap();
    let new_a = new_conn.get_node("a")?.unwrap();
    assert_eq!(old_a.properties, new_a.properties);
    assert_eq!(old_a.created_at, new_a.created_at);

    // The environment scratch was removed after success.
    assert!(!temp.path().join(".engine_envs").exists());
    Ok(())
}

#[test]
fn test_overwrite_moves_new_into_place_with_backup() -> Result<()> {
    let temp = TempDir::new()?;
    let old_db = temp.path().join("graph.db");
    seed_database(&old_db)?;
    // Pretend the source was written by the previous engine release.
    patch_version_code(&old_db, StorageVersion::V0_10_0.code())?;
    let releases = stage_releases(
        temp.path(),
        &[StorageVersion::V0_10_0, CURRENT_STORAGE_VERSION],
    )?;

    Migrator::with_releases_dir(&releases).migrate(&MigrationOptions {
        old_db: old_db.clone(),
        new_db: temp.path().join("graph_new.db"),
        old_version: None,
        new_version: CURRENT_STORAGE_VERSION,
        overwrite: true,
        delete_old: false,
    })?;

    // The original lives on as a backup; the upgraded database took
    // the original location and opens strict.
    assert!(temp.path().join("graph.db_old").exists());
    let upgraded = Database::open(&old_db, DatabaseOptions::default())?;
    assert_eq!(upgraded.storage_version(), CURRENT_STORAGE_VERSION);
    assert_eq!(upgraded.connect().node_count()?, 2);
    Ok(())
}

#[test]
fn test_overwrite_with_delete_old_leaves_no_backup() -> Result<()> {
    let temp = TempDir::new()?;
    let old_db = temp.path().join("graph.db");
    seed_database(&old_db)?;
    let releases = stage_releases(temp.path(), &[CURRENT_STORAGE_VERSION])?;

    Migrator::with_releases_dir(&releases).migrate(&MigrationOptions {
        old_db: old_db.clone(),
        new_db: temp.path().join("graph_new.db"),
        old_version: None,
        new_version: CURRENT_STORAGE_VERSION,
        overwrite: true,
        delete_old: true,
    })?;

    assert!(!temp.path().join("graph.db_old").exists());
    let upgraded = Database::open(&old_db, DatabaseOptions::default())?;
    assert_eq!(upgraded.connect().edge_count()?, 1);
    Ok(())
}

#[test]
fn test_version_detection_from_patched_catalog() -> Result<()> {
    let temp = TempDir::new()?;
    let db = temp.path().join("old.db");
    seed_database(&db)?;
    patch_version_code(&db, 37)?;

    assert_eq!(
        engramdb::read_storage_version(&db)?,
        StorageVersion::V0_9_0
    );
    Ok(())
}

#[tokio::test]
async fn test_adapter_migrates_old_database_on_open() -> Result<()> {
    let temp = TempDir::new()?;
    let db_path = temp.path().join("auto.db");
    seed_database(&db_path)?;
    patch_version_code(&db_path, StorageVersion::V0_9_0.code())?;

    // Make the engine releases resolvable for the in-place migration.
    let releases = stage_releases(
        temp.path(),
        &[StorageVersion::V0_9_0, CURRENT_STORAGE_VERSION],
    )?;
    let mut config = EngramConfig::default();
    config.releases_dir = Some(releases);
    engramdb::set_config(config);

    let adapter = GraphAdapter::new(&db_path.display().to_string()).await?;

    // Migration ran once: backup exists, data survived, second open is
    // plain (the adapter reconnects on every query in this test's
    // default mode, which would fail if the catalog were still old).
    assert!(temp.path().join("auto.db_old").exists());
    assert!(adapter.has_node("a").await?);
    assert!(adapter.has_edge("a", "b", "mentions").await?);
    let (nodes, edges) = adapter.get_graph_data().await?;
    assert_eq!((nodes.len(), edges.len()), (2, 1));

    engramdb::set_config(EngramConfig::default());
    Ok(())
}

#[tokio::test]
async fn test_unknown_version_code_refuses_to_open() -> Result<()> {
    let temp = TempDir::new()?;
    let db_path = temp.path().join("weird.db");
    seed_database(&db_path)?;
    patch_version_code(&db_path, 99)?;

    let err = GraphAdapter::new(&db_path.display().to_string())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown storage version code 99"));
    // Nothing was migrated or renamed.
    assert!(db_path.exists());
    assert!(!temp.path().join("weird.db_old").exists());
    Ok(())
}

#[test]
fn test_cli_reports_precondition_failures_with_exit_code_one() -> Result<()> {
    let temp = TempDir::new()?;
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_engramdb"))
        .args([
            "migrate",
            "--new-version",
            "0.11.0",
            "--old-db",
            temp.path().join("missing.db").to_str().unwrap(),
            "--new-db",
            temp.path().join("new.db").to_str().unwrap(),
        ])
        .output()?;
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
    Ok(())
}

#[test]
fn test_cli_shell_runs_admin_statements() -> Result<()> {
    let temp = TempDir::new()?;
    let db = temp.path().join("shell.db");
    seed_database(&db)?;

    let export_dir = temp.path().join("export");
    let status = std::process::Command::new(env!("CARGO_BIN_EXE_engramdb"))
        .args([
            "shell",
            db.to_str().unwrap(),
            "--command",
            &format!("EXPORT DATABASE '{}'", export_dir.display()),
        ])
        .status()?;
    assert!(status.success());
    assert!(export_dir.join("schema.cypher").exists());

    let schema = fs::read_to_string(export_dir.join("schema.cypher"))?;
    assert!(!schema.trim().is_empty());
    Ok(())
}
