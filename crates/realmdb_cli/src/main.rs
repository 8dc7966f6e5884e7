//! realmdb CLI
//!
//! Command-line tools for realm files.
//!
//! # Commands
//!
//! - `inspect` - Display schema, object counts and file statistics
//! - `verify` - Check every log record and object
//! - `compact` - Rewrite the file as a single snapshot
//! - `dump-log` - Dump commit log records for debugging
//! - `convert` - Write a copy of a realm to another file
//! - `delete-files` - Delete a realm and its auxiliary files

mod commands;

use clap::{Parser, Subcommand};
use realmdb_core::logging::{LogConfig, LogLevel};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// realmdb command-line database tools.
#[derive(Parser)]
#[command(name = "realmdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the realm file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Per-category log level, e.g. `realm.storage=debug`
    #[arg(global = true, long = "log", value_name = "CATEGORY=LEVEL")]
    log: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display schema, object counts and file statistics
    Inspect {
        /// Show the properties of each class
        #[arg(short, long)]
        classes: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check every log record and object
    Verify,

    /// Rewrite the file as a single snapshot
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Dump commit log records for debugging
    DumpLog {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Start from this byte offset
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Write a copy of the realm to another file
    Convert {
        /// Destination realm file
        target: PathBuf,

        /// Merge into an existing destination
        #[arg(short, long)]
        merge: bool,
    },

    /// Delete a realm and its auxiliary files
    DeleteFiles,

    /// Show version information
    Version,
}

fn log_config(verbose: bool, overrides: &[String]) -> Result<LogConfig, Box<dyn std::error::Error>> {
    let mut config = LogConfig::new(if verbose { LogLevel::Debug } else { LogLevel::Info });
    for entry in overrides {
        let (category, level) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected CATEGORY=LEVEL, got '{entry}'"))?;
        config.set_level_by_name(category, level.parse()?)?;
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let config = log_config(cli.verbose, &cli.log)?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.directive()))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { classes, format } => {
            let path = cli.path.ok_or("Realm path required for inspect")?;
            commands::inspect::run(&path, classes, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Realm path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Realm path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::DumpLog {
            limit,
            offset,
            format,
        } => {
            let path = cli.path.ok_or("Realm path required for dump-log")?;
            commands::dump_log::run(&path, limit, offset, &format)?;
        }
        Commands::Convert { target, merge } => {
            let path = cli.path.ok_or("Realm path required for convert")?;
            commands::convert::run(&path, &target, merge)?;
        }
        Commands::DeleteFiles => {
            let path = cli.path.ok_or("Realm path required for delete-files")?;
            commands::delete_files::run(&path)?;
        }
        Commands::Version => {
            println!("realmdb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("realmdb core v{}", realmdb_core::VERSION);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use realmdb_core::logging::LogCategory;

    #[test]
    fn log_overrides_apply_per_category() {
        let config = log_config(false, &["realm.sync=trace".to_owned()]).unwrap();
        assert_eq!(config.level(LogCategory::Session), LogLevel::Trace);
        assert_eq!(config.level(LogCategory::Storage), LogLevel::Info);
        assert!(log_config(true, &["realm.sync".to_owned()]).is_err());
        assert!(log_config(true, &["realm.sync=loud".to_owned()]).is_err());
    }

    #[test]
    fn arguments_parse() {
        let cli = Cli::try_parse_from(["realmdb", "-p", "a.realm", "convert", "b.realm", "--merge"]).unwrap();
        assert_eq!(cli.path, Some(PathBuf::from("a.realm")));
        assert!(matches!(cli.command, Commands::Convert { merge: true, .. }));
    }
}
