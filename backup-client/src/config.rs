//! Configuration management for the backup client.
//!
//! Loads configuration from a TOML file; every field except the server URL
//! has a default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Receiver base URL, e.g. `http://backup-host:8080`
    pub url: String,

    /// Timeout for every request except upload bodies
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts per file upload before it is counted as failed
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Pause between upload attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directories backed up by `daemon` and by `backup` without a path
    #[serde(default)]
    pub sources: Vec<PathBuf>,

    #[serde(default = "default_exclusions")]
    pub exclusions: Vec<String>,

    /// Upload workers per run
    #[serde(default = "default_parallel_uploads")]
    pub parallel_uploads: usize,

    /// Identifier sent with every run; hostname and pid when unset
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Local wall-clock times, `HH:MM`
    #[serde(default)]
    pub times: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_exclusions() -> Vec<String> {
    [
        "**/node_modules/**",
        "**/.git/**",
        "**/temp/**",
        "**/tmp/**",
        "**/*.tmp",
        "**/.DS_Store",
        "**/Thumbs.db",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_parallel_uploads() -> usize {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            exclusions: default_exclusions(),
            parallel_uploads: default_parallel_uploads(),
            client_id: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl BackupConfig {
    pub fn client_id(&self) -> String {
        match self.client_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("{}_{}", local_hostname(), std::process::id()),
        }
    }
}

pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "backup-client".to_string())
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::ClientError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| crate::ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::ClientError::Config(e.to_string()))
    }

    fn validate(&self) -> crate::Result<()> {
        if self.server.url.trim().is_empty() {
            return Err(crate::ClientError::Config("server.url must not be empty".into()));
        }
        if self.backup.parallel_uploads == 0 {
            return Err(crate::ClientError::Config(
                "backup.parallel_uploads must be at least 1".into(),
            ));
        }
        if self.server.retry_attempts == 0 {
            return Err(crate::ClientError::Config(
                "server.retry_attempts must be at least 1".into(),
            ));
        }
        crate::fs::ExcludeSet::new(&self.backup.exclusions).map_err(|e| {
            crate::ClientError::Config(format!("backup.exclusions: {}", e))
        })?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                url: "http://localhost:8080".to_string(),
                timeout_secs: default_timeout_secs(),
                retry_attempts: default_retry_attempts(),
                retry_delay_ms: default_retry_delay_ms(),
            },
            backup: BackupConfig::default(),
            schedule: ScheduleConfig::default(),
            log: LogConfig::default(),
        }
    }
}
