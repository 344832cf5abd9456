//! Operator configuration.
//!
//! Loaded from a TOML file, then overridden by `PORT`, `LOG_LEVEL` and
//! `DATA_DIR` from the environment (a `.env` file is honoured).

use backup_engine::models::{ClusterRef, ScheduleSpec, StorageTarget};
use backup_engine::ports::SecretRef;
use backup_engine::EngineConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,

    #[serde(default)]
    pub schedules: Vec<ScheduleSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Defaults to `{data_dir}/operator.db`
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds between schedule evaluations
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one subdirectory per bucket. Defaults to `{data_dir}/blobs`.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Defaults to `{data_dir}/secrets`
    #[serde(default)]
    pub secrets_dir: Option<PathBuf>,

    /// Bucket used by manual backups that name none
    #[serde(default = "default_bucket")]
    pub default_bucket: String,

    #[serde(default)]
    pub default_prefix: String,
}

/// A cluster the operator can reach.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Base URL of the snapshot API, e.g. `http://vectors.default:6333`
    pub url: String,

    #[serde(default)]
    pub api_key: Option<SecretRef>,
}

impl ClusterConfig {
    pub fn cluster_ref(&self) -> ClusterRef {
        ClusterRef::new(&self.namespace, &self.name)
    }
}

// Default values
fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_bucket() -> String {
    "backups".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
            db_path: None,
            log_level: default_log_level(),
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            secrets_dir: None,
            default_bucket: default_bucket(),
            default_prefix: String::new(),
        }
    }
}

impl AppConfig {
    /// Load from `path` (or defaults), apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_toml(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Cron expressions are checked here.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(port) = var("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.server.log_level = level;
        }
        if let Some(dir) = var("DATA_DIR") {
            self.server.data_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.engine.validate()?;
        if self.server.tick_interval_secs == 0 {
            anyhow::bail!("server.tick_interval_secs must be positive");
        }

        let clusters: HashSet<ClusterRef> = self.clusters.iter().map(ClusterConfig::cluster_ref).collect();
        if clusters.len() != self.clusters.len() {
            anyhow::bail!("clusters must have unique namespace/name pairs");
        }

        let mut names = HashSet::new();
        for schedule in &self.schedules {
            if !names.insert(schedule.name.as_str()) {
                anyhow::bail!("schedule {} is defined more than once", schedule.name);
            }
            if !clusters.contains(&schedule.cluster) {
                anyhow::bail!("schedule {} refers to unknown cluster {}", schedule.name, schedule.cluster);
            }
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.server
            .db_path
            .clone()
            .unwrap_or_else(|| self.server.data_dir.join("operator.db"))
    }

    pub fn blob_root(&self) -> PathBuf {
        self.storage
            .root
            .clone()
            .unwrap_or_else(|| self.server.data_dir.join("blobs"))
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.storage
            .secrets_dir
            .clone()
            .unwrap_or_else(|| self.server.data_dir.join("secrets"))
    }

    pub fn default_storage(&self) -> StorageTarget {
        StorageTarget::new(&self.storage.default_bucket, &self.storage.default_prefix)
    }

    pub fn cluster(&self, cluster: &ClusterRef) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.cluster_ref() == *cluster)
    }
}
