use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    /// Environment overrides that were set but could not be applied. Loading
    /// happens before tracing is installed, so callers log these afterwards.
    #[serde(skip)]
    pub ignored_overrides: Vec<IgnoredOverride>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredOverride {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else {
            let default_path = PathBuf::from("site-usage.toml");
            if default_path.exists() {
                Self::from_file(&default_path)?
            } else {
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| "failed to parse configuration TOML")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = env::var("SITE_USAGE_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Ok(db_path) = env::var("SITE_USAGE_DB_PATH") {
            self.storage.database_path = PathBuf::from(db_path);
        }
        if let Ok(days) = env::var("SITE_USAGE_RETENTION_DAYS") {
            match days.trim().parse() {
                Ok(parsed) => self.tracking.retention_days = parsed,
                Err(err) => self.ignored_overrides.push(IgnoredOverride {
                    key: "SITE_USAGE_RETENTION_DAYS",
                    value: days,
                    reason: err.to_string(),
                }),
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_path: default_log_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Upper bound on time credited to a session that could not be verified
    /// after a restart or suspension.
    #[serde(default = "default_stale_session_cap")]
    pub stale_session_cap_secs: u64,
    #[serde(default = "default_minimized_check_interval")]
    pub minimized_check_interval_secs: u64,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_recorder_queue_capacity")]
    pub recorder_queue_capacity: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            idle_threshold_secs: default_idle_threshold(),
            retention_days: default_retention_days(),
            stale_session_cap_secs: default_stale_session_cap(),
            minimized_check_interval_secs: default_minimized_check_interval(),
            checkpoint_interval_secs: default_checkpoint_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            recorder_queue_capacity: default_recorder_queue_capacity(),
        }
    }
}

impl TrackingConfig {
    pub fn stale_session_cap_ms(&self) -> i64 {
        i64::try_from(self.stale_session_cap_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    pub fn minimized_check_interval(&self) -> Duration {
        Duration::from_secs(self.minimized_check_interval_secs.max(1))
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8790".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("site-usage.db")
}

fn default_log_path() -> PathBuf {
    PathBuf::from("site-usage.log")
}

fn default_enabled() -> bool {
    true
}

fn default_idle_threshold() -> u64 {
    60
}

fn default_retention_days() -> u32 {
    90
}

fn default_stale_session_cap() -> u64 {
    600
}

fn default_minimized_check_interval() -> u64 {
    15
}

fn default_checkpoint_interval() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_recorder_queue_capacity() -> usize {
    256
}
