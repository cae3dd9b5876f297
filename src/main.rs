mod app;
mod browser;
mod cli;
mod config;
mod messages;
mod recorder;
mod scheduler;
mod server;
mod storage;
mod tracking;

use anyhow::{Context, Result};
use clap::Parser;
use std::{fs::OpenOptions, path::Path, sync::Mutex};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let config = config::AppConfig::load(cli.config_path.as_deref())?;
    init_tracing(&config.storage.log_path)?;
    for ignored in &config.ignored_overrides {
        tracing::warn!(
            key = ignored.key,
            value = %ignored.value,
            reason = %ignored.reason,
            "ignoring invalid environment override"
        );
    }
    let app = app::App::new(config);
    app.run(cli.stats).await
}

fn init_tracing(log_path: &Path) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Stdout is reserved for `--stats` output; tracing goes to a file.
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("failed to open {} for tracing output", log_path.display()))?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .try_init();
    Ok(())
}
