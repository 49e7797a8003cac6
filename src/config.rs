//! Startup configuration, read once from a JSON file and shared read-only afterwards.

// System
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Third Party
use serde::Deserialize;

// Local
use crate::catalog::{default_catalog, ResourceKind, ALERT_COLLECTION, NAMESPACE_COLLECTION};
use crate::error::{Result, SyncError};

pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "./config.local.json";

/// The API server rejects watch timeouts close to its own 5 minute limit.
const MAX_WATCH_TIMEOUT_SECONDS: u32 = 290;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub mongo_db: String,
    /// Cluster name used when neither node labels nor the kubeconfig name one.
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for the daily-rotated controller log file.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_save_logs")]
    pub save_logs: bool,
    #[serde(default = "default_watch_timeout")]
    pub watch_timeout_seconds: u32,
    #[serde(default = "default_catalog")]
    pub resources: Vec<ResourceKind>,
    #[serde(default)]
    pub falco: FalcoConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FalcoConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_falco_namespace")]
    pub namespace: String,
    #[serde(default = "default_falco_selector")]
    pub label_selector: String,
    #[serde(default = "default_falco_container")]
    pub container: String,
    /// How long to wait before looking for a Falco pod again when none is running.
    #[serde(default = "default_pod_poll")]
    pub pod_poll_seconds: u64,
}

impl Default for FalcoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: default_falco_namespace(),
            label_selector: default_falco_selector(),
            container: default_falco_container(),
            pod_poll_seconds: default_pod_poll(),
        }
    }
}

impl FalcoConfig {
    pub fn pod_poll_interval(&self) -> Duration {
        Duration::from_secs(self.pod_poll_seconds)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_save_logs() -> bool {
    true
}

fn default_watch_timeout() -> u32 {
    60
}

fn default_falco_namespace() -> String {
    "falco-system".to_string()
}

fn default_falco_selector() -> String {
    "app.kubernetes.io/name=falco".to_string()
}

fn default_falco_container() -> String {
    "falco".to_string()
}

fn default_pod_poll() -> u64 {
    30
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Where to write log files, or `None` when `save_logs` is off.
    pub fn log_directory(&self) -> Option<&Path> {
        self.save_logs.then_some(self.log_dir.as_path())
    }

    /// `CONFIG_PATH` if set, otherwise `./config.local.json`.
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn validate(&self) -> Result<()> {
        if self.mongo_uri.trim().is_empty() {
            return Err(SyncError::InvalidConfig("mongo_uri is empty".to_string()));
        }
        if self.mongo_db.trim().is_empty() {
            return Err(SyncError::InvalidConfig("mongo_db is empty".to_string()));
        }
        if self.watch_timeout_seconds == 0 || self.watch_timeout_seconds > MAX_WATCH_TIMEOUT_SECONDS
        {
            return Err(SyncError::InvalidConfig(format!(
                "watch_timeout_seconds must be between 1 and {}, got {}",
                MAX_WATCH_TIMEOUT_SECONDS, self.watch_timeout_seconds
            )));
        }
        let mut collections: HashSet<&str> = [NAMESPACE_COLLECTION, ALERT_COLLECTION].into();
        for kind in &self.resources {
            if kind.plural.is_empty() || kind.version.is_empty() || kind.kind.is_empty() {
                return Err(SyncError::InvalidConfig(format!(
                    "resource entry {:?} needs version, kind and plural",
                    kind
                )));
            }
            if !collections.insert(kind.collection_name()) {
                return Err(SyncError::InvalidConfig(format!(
                    "collection {} is used by more than one resource",
                    kind.collection_name()
                )));
            }
        }
        if self.falco.enabled && self.falco.namespace.is_empty() {
            return Err(SyncError::InvalidConfig(
                "falco.namespace is empty".to_string(),
            ));
        }
        Ok(())
    }
}
