// EngramDB CLI - migration tool and engine shell
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use engramdb::{
    init_logging_with_level, DatabaseOptions, MigrationError, MigrationOptions, Migrator,
    StorageVersion, CURRENT_STORAGE_VERSION,
};

#[derive(Parser)]
#[command(
    name = "engramdb",
    about = "Embedded property-graph storage for knowledge-graph ingestion",
    version
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress everything except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate a database between storage versions
    ///
    /// Provisions one isolated runtime environment per engine version
    /// and drives EXPORT/IMPORT through subprocesses. Can only migrate
    /// to newer engine versions.
    Migrate {
        /// Source engine version (e.g. 0.9.0); detected from the
        /// catalog header when omitted
        #[arg(long)]
        old_version: Option<String>,

        /// Target engine version (e.g. 0.11.0)
        #[arg(long)]
        new_version: String,

        /// Path to the source database (file or directory)
        #[arg(long)]
        old_db: PathBuf,

        /// Path for the new database; must not already exist
        #[arg(long)]
        new_db: PathBuf,

        /// Move the new database into the old location, keeping the
        /// original as a <name>_old backup
        #[arg(long, default_value_t = false)]
        overwrite: bool,

        /// With --overwrite, delete the original instead of backing it
        /// up
        #[arg(long, default_value_t = false)]
        delete_old: bool,

        /// Directory holding engramdb-<version> release binaries
        #[arg(long, env = "ENGRAMDB_RELEASES_DIR")]
        releases_dir: Option<PathBuf>,
    },

    /// Execute one admin statement against a database
    ///
    /// This is the per-step subprocess the migration spawns inside each
    /// runtime environment; the database is opened accepting any known
    /// storage version.
    Shell {
        /// Path to the database
        db: PathBuf,

        /// Statement to execute (e.g. "EXPORT DATABASE '/tmp/out'")
        #[arg(short, long)]
        command: String,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging_with_level(cli.verbose, cli.quiet) {
        eprintln!("failed to initialize logging: {e}");
    }

    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e:#}");
            e.downcast_ref::<MigrationError>()
                .map(MigrationError::exit_code)
                .unwrap_or(1)
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Migrate {
            old_version,
            new_version,
            old_db,
            new_db,
            overwrite,
            delete_old,
            releases_dir,
        } => {
            let old_version = old_version
                .map(|v| {
                    StorageVersion::from_release(&v)
                        .ok_or_else(|| anyhow::anyhow!("unknown engine version: {v}"))
                })
                .transpose()?;
            let new_version = StorageVersion::from_release(&new_version)
                .ok_or_else(|| anyhow::anyhow!("unknown engine version: {new_version}"))?;

            eprintln!(
                "Migrating database {} -> engine {}",
                old_db.display(),
                new_version
            );

            let migrator = match releases_dir {
                Some(dir) => Migrator::with_releases_dir(dir),
                None => Migrator::new(),
            };
            migrator.migrate(&MigrationOptions {
                old_db,
                new_db,
                old_version,
                new_version,
                overwrite,
                delete_old,
            })?;
            eprintln!("Migration finished successfully");
            Ok(())
        }

        Commands::Shell { db, command } => {
            // The environment's engine release is assumed to match the
            // database it operates on; accept any known catalog code.
            let database = engramdb::Database::open(
                &db,
                DatabaseOptions { compat_open: true },
            )?;
            let rows = database.connect().execute(&command)?;
            for row in rows {
                let rendered: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                println!("{}", rendered.join("\t"));
            }
            if database.storage_version() != CURRENT_STORAGE_VERSION {
                tracing::debug!(
                    "operated on storage version {}",
                    database.storage_version()
                );
            }
            Ok(())
        }
    }
}
