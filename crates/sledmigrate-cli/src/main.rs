//! sled-migrate - database migration tool for sled.
//!
//! Provides schema versioning, migration management, and data validation
//! for sled databases. Migrations are compiled into this binary through the
//! `migrations` module.

mod commands;
mod migrations;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Database migration tool for sled.
#[derive(Parser, Debug)]
#[command(name = "sled-migrate")]
#[command(version, about = "Database migration tool for sled")]
#[command(long_about = "A database migration tool for sled that provides schema \
versioning, migration management, and data validation.\n\n\
This tool allows you to:\n\
- Upgrade your database schema to the latest version\n\
- Rollback to previous schema versions\n\
- Rerun specific migrations\n\
- Validate catalog integrity\n\
- View migration status and history")]
pub struct Cli {
    /// Path to the sled database directory
    #[arg(short = 'd', long)]
    pub database: PathBuf,

    /// Enable verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Show what would be done without executing
    #[arg(short = 'n', long = "dry-run", global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show migration status
    Status,

    /// Apply pending migrations, optionally up to a target version
    Up {
        /// Target version (Unix timestamp); all pending when omitted
        target_version: Option<i64>,
        /// Skip creating a backup before migration
        #[arg(long)]
        no_backup: bool,
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Roll back migrations above a target version
    Down {
        /// Target version (Unix timestamp); 0 rolls everything back
        target_version: i64,
        /// Skip creating a backup before rollback
        #[arg(long)]
        no_backup: bool,
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Re-execute a single migration (down, then up)
    Rerun {
        /// Migration ID to rerun
        id: String,
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Validate catalog consistency
    Validate,

    /// Show the migration history
    History,

    /// Manage database backups
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Force the catalog status back to clean (use with caution)
    ForceClean {
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Synthesize history records for applied migrations that lack them
    Repair,
}

#[derive(Subcommand, Debug)]
pub enum BackupAction {
    /// Create a backup of the database
    Create {
        /// Description stored in the backup metadata
        #[arg(long, default_value = "Manual backup")]
        description: String,
        /// Produce a plain directory instead of a .tar.gz archive
        #[arg(long)]
        no_compress: bool,
    },
    /// List available backups
    List,
    /// Restore the database from a backup
    Restore {
        /// Path to the backup artifact
        path: PathBuf,
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Remove backups older than the given age
    Cleanup {
        /// Maximum backup age in hours
        #[arg(long, default_value_t = 168)]
        older_than_hours: u64,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("sledmigrate_core={default_level}").parse().unwrap())
                .add_directive(format!("sled_migrate={default_level}").parse().unwrap()),
        )
        .with_target(false)
        .init();

    if let Err(e) = commands::run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
