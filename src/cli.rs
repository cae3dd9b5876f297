use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;

/// Command-line interface for the site usage daemon.
#[derive(Debug, Parser)]
#[command(author, version, about = "Local per-site browsing time tracker", long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file (defaults to ./site-usage.toml if present).
    #[arg(long, value_name = "FILE")]
    pub config_path: Option<PathBuf>,
    /// Print the stored statistics for one day (YYYY-MM-DD) as JSON and exit.
    #[arg(long, value_name = "DATE")]
    pub stats: Option<NaiveDate>,
}
