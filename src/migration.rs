//! Cross-version database migration
//!
//! Upgrades an on-disk database between incompatible storage formats by
//! provisioning one isolated runtime environment per engine version and
//! driving `EXPORT DATABASE` / `IMPORT DATABASE` through short-lived
//! subprocesses. Data moves between the versions exclusively through
//! the export directory; the two engine releases never share a process.
//!
//! The module is blocking throughout: migration runs either from the
//! CLI or on the adapter's worker executor.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

use crate::config::get_config;
use crate::observability::{record_metric, MetricType};
use crate::storage_version::{read_storage_version, StorageVersion, CURRENT_STORAGE_VERSION};

/// Name of the scratch directory holding per-version environments,
/// created next to the database being migrated.
const ENGINE_ENVS_DIR: &str = ".engine_envs";

/// Sidecar extensions that travel with a file-based database.
const SIDECAR_EXTS: &[&str] = &["", ".lock", ".wal"];

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("source database '{0}' does not exist")]
    SourceMissing(PathBuf),

    #[error("a file already exists at the new database location '{0}'; remove it or pick another path")]
    TargetExists(PathBuf),

    #[error("no engine release found for version {0}; set ENGRAMDB_RELEASES_DIR")]
    ReleaseNotFound(String),

    #[error("export produced no usable schema file at '{0}'")]
    SchemaFileInvalid(PathBuf),

    #[error("migration step failed (exit code {exit_code}): {command}\n{stderr}")]
    StepFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
}

impl MigrationError {
    /// Process exit code the CLI should report for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            MigrationError::StepFailed { exit_code, .. } => *exit_code,
            _ => 1,
        }
    }
}

/// What to do with the original database once the new one exists.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub old_db: PathBuf,
    pub new_db: PathBuf,
    /// Detected from the catalog header when absent.
    pub old_version: Option<StorageVersion>,
    pub new_version: StorageVersion,
    /// Move the new database into the original location, keeping the
    /// original as a `<name>_old` backup.
    pub overwrite: bool,
    /// With `overwrite`, delete the original instead of backing it up.
    pub delete_old: bool,
}

/// Orchestrates one migration run.
pub struct Migrator {
    releases_dir: Option<PathBuf>,
}

impl Migrator {
    /// Resolve engine releases from the process configuration.
    pub fn new() -> Self {
        Self {
            releases_dir: get_config().releases_dir.clone(),
        }
    }

    pub fn with_releases_dir(releases_dir: impl Into<PathBuf>) -> Self {
        Self {
            releases_dir: Some(releases_dir.into()),
        }
    }

    /// Run the migration end to end.
    ///
    /// On success the environment scratch directory is removed; on
    /// failure it is left in place for inspection and the error carries
    /// the failing step's exit code.
    pub fn migrate(&self, options: &MigrationOptions) -> Result<()> {
        if !options.old_db.exists() {
            return Err(MigrationError::SourceMissing(options.old_db.clone()).into());
        }

        let old_version = match options.old_version {
            Some(version) => version,
            None => read_storage_version(&options.old_db)?,
        };

        if let Some(parent) = options.new_db.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        if options.new_db.exists() {
            return Err(MigrationError::TargetExists(options.new_db.clone()).into());
        }

        let envs_dir = options
            .old_db
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join(ENGINE_ENVS_DIR);

        info!("setting up engine {} environment", old_version);
        let old_exe = self.ensure_env(&envs_dir, old_version)?;
        info!("setting up engine {} environment", options.new_version);
        let new_exe = self.ensure_env(&envs_dir, options.new_version)?;

        let export_scratch = tempfile::tempdir().context("failed to create export scratch")?;
        let export_dir = export_scratch.path().join("engine_export");

        info!(
            "exporting {} -> {}",
            options.old_db.display(),
            export_dir.display()
        );
        run_migration_step(
            &old_exe,
            &options.old_db,
            &format!("EXPORT DATABASE '{}'", export_dir.display()),
        )?;

        let schema_file = export_dir.join("schema.cypher");
        let schema_len = fs::metadata(&schema_file).map(|m| m.len()).unwrap_or(0);
        if schema_len == 0 {
            return Err(MigrationError::SchemaFileInvalid(schema_file).into());
        }

        info!("importing into {}", options.new_db.display());
        run_migration_step(
            &new_exe,
            &options.new_db,
            &format!("IMPORT DATABASE '{}'", export_dir.display()),
        )?;

        if options.overwrite || options.delete_old {
            rename_databases(&options.old_db, &options.new_db, options.delete_old)?;
        }

        // Scratch environments are only removed after a full success.
        if let Err(e) = fs::remove_dir_all(&envs_dir) {
            warn!(
                "could not clean up engine environments at {}: {}",
                envs_dir.display(),
                e
            );
        }

        record_metric(MetricType::Counter {
            name: "migration.runs",
            value: 1,
        });
        info!("migration finished successfully");
        Ok(())
    }

    /// Materialize a clean environment for one engine version and
    /// return the path of its executable. A leftover environment for
    /// the same version is removed first.
    fn ensure_env(&self, envs_dir: &Path, version: StorageVersion) -> Result<PathBuf> {
        let env_dir = envs_dir.join(version.release());
        if env_dir.exists() {
            fs::remove_dir_all(&env_dir).with_context(|| {
                format!("failed to reset environment: {}", env_dir.display())
            })?;
        }
        let bin_dir = env_dir.join("bin");
        fs::create_dir_all(&bin_dir)?;

        let release_exe = self.resolve_release(version)?;
        let env_exe = bin_dir.join(exe_name("engramdb"));
        fs::copy(&release_exe, &env_exe).with_context(|| {
            format!(
                "failed to install engine release {} into {}",
                release_exe.display(),
                env_exe.display()
            )
        })?;
        Ok(env_exe)
    }

    /// Locate the engine release binary for a version: a configured
    /// releases directory first, falling back to the running executable
    /// when the requested version is the one this build ships.
    fn resolve_release(&self, version: StorageVersion) -> Result<PathBuf> {
        if let Some(dir) = &self.releases_dir {
            let candidate = dir.join(exe_name(&format!("engramdb-{}", version.release())));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        if version == CURRENT_STORAGE_VERSION {
            if let Ok(current) = std::env::current_exe() {
                return Ok(current);
            }
        }
        Err(MigrationError::ReleaseNotFound(version.release().to_string()).into())
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}

/// Upgrade a database in place to the running engine's version, keeping
/// the original as a `<name>_old` backup. Used by the adapter when an
/// open is refused with a version mismatch.
pub fn migrate_in_place(db_path: &Path, old_version: StorageVersion) -> Result<()> {
    let mut new_db = db_path.as_os_str().to_os_string();
    new_db.push("_new");
    let options = MigrationOptions {
        old_db: db_path.to_path_buf(),
        new_db: PathBuf::from(new_db),
        old_version: Some(old_version),
        new_version: CURRENT_STORAGE_VERSION,
        overwrite: true,
        delete_old: false,
    };
    Migrator::new().migrate(&options)
}

/// Spawn the environment's engine shell to run one admin statement.
fn run_migration_step(exe: &Path, db_path: &Path, statement: &str) -> Result<()> {
    let output = Command::new(exe)
        .arg("shell")
        .arg(db_path)
        .arg("--command")
        .arg(statement)
        .output()
        .with_context(|| format!("failed to spawn engine shell: {}", exe.display()))?;

    if !output.status.success() {
        return Err(MigrationError::StepFailed {
            command: statement.to_string(),
            exit_code: output.status.code().unwrap_or(1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
        .into());
    }
    Ok(())
}

/// Back up (or delete) the original database and move the new one into
/// its place. File-based databases carry their `.lock` and `.wal`
/// sidecars; directory-based databases move as a whole.
fn rename_databases(old_db: &Path, new_db: &Path, delete_old: bool) -> Result<()> {
    let base_dir = old_db
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let name = old_db
        .file_name()
        .context("old database path has no file name")?
        .to_string_lossy()
        .into_owned();
    let backup_base = base_dir.join(format!("{name}_old"));

    if old_db.is_file() {
        for ext in SIDECAR_EXTS {
            let src = with_suffix(old_db, ext);
            if src.exists() {
                if delete_old {
                    fs::remove_file(&src)?;
                } else {
                    let dst = with_suffix(&backup_base, ext);
                    fs::rename(&src, &dst)?;
                    info!("renamed '{}' to '{}'", src.display(), dst.display());
                }
            }
        }
    } else if old_db.is_dir() {
        if delete_old {
            fs::remove_dir_all(old_db)?;
        } else {
            fs::rename(old_db, &backup_base)?;
            info!(
                "renamed directory '{}' to '{}'",
                old_db.display(),
                backup_base.display()
            );
        }
    } else {
        return Err(MigrationError::SourceMissing(old_db.to_path_buf()).into());
    }

    for ext in SIDECAR_EXTS {
        let src = with_suffix(new_db, ext);
        if src.exists() {
            let dst = with_suffix(&base_dir.join(&name), ext);
            fs::rename(&src, &dst)?;
            info!("renamed '{}' to '{}'", src.display(), dst.display());
        }
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

fn exe_name(base: &str) -> String {
    if cfg!(windows) {
        format!("{base}.exe")
    } else {
        base.to_string()
    }
}
