//! §6's "Persisted worker config": a small local JSON file holding the
//! executor's generated identity and connection parameters, created with
//! defaults on first run. Mirrors `executor-client/config.py`'s
//! `ConfigManager` (SPEC_FULL §10.1).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use taskmesh_common::config::BrokerConfig;
use taskmesh_common::ids::WorkerId;
use taskmesh_common::SafeDisplay;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub server_url: url::Url,
    pub executor_uuid: WorkerId,
    pub executor_name: String,
    pub owner_username: Option<String>,
    pub owner_password: Option<String>,
    /// Bound 1..3 per §3's Worker invariant; the local value is the
    /// authority the intake loop admits against (§4.7 step 3).
    pub max_concurrent: u32,
    pub default_browser: String,
    pub broker: BrokerConfig,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: std::time::Duration,
    /// Carried over from the persisted config schema; this binary logs
    /// through `tracing` to stdout, not a local rotating file, so nothing
    /// here currently reads it.
    pub log_retention_days: i64,
}

impl WorkerConfig {
    fn generate_default() -> Self {
        Self {
            server_url: url::Url::parse("http://localhost:8090").unwrap(),
            executor_uuid: WorkerId::new_v4(),
            executor_name: default_executor_name(),
            owner_username: None,
            owner_password: None,
            max_concurrent: 3,
            default_browser: "chromium".to_string(),
            broker: BrokerConfig::default(),
            heartbeat_interval: std::time::Duration::from_secs(30),
            log_retention_days: 30,
        }
    }
}

fn default_executor_name() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "taskmesh-worker".to_string())
}

impl SafeDisplay for WorkerConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "server: {}, executor: {} ({}), max_concurrent: {}, browser: {}, broker: {}, heartbeat_interval: {:?}",
            self.server_url,
            self.executor_name,
            self.executor_uuid,
            self.max_concurrent,
            self.default_browser,
            self.broker.to_safe_string(),
            self.heartbeat_interval,
        )
    }
}

/// Loads the persisted config from `path`, creating it with generated
/// defaults (a fresh `executor_uuid`, hostname-derived name) if it does not
/// yet exist — mirrors the original `ConfigManager`'s first-run behavior.
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load_or_create(&self) -> anyhow::Result<WorkerConfig> {
        if self.path.exists() {
            let raw = std::fs::read_to_string(&self.path)?;
            let config: WorkerConfig = serde_json::from_str(&raw)?;
            return Ok(config);
        }

        let config = WorkerConfig::generate_default();
        self.save(&config)?;
        Ok(config)
    }

    pub fn save(&self, config: &WorkerConfig) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let raw = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("config/worker-agent.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_defaults_on_first_run_and_persists_the_generated_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        let manager = ConfigManager::new(&path);

        let first = manager.load_or_create().unwrap();
        assert!(path.exists());

        let second = manager.load_or_create().unwrap();
        assert_eq!(first.executor_uuid, second.executor_uuid);
        assert_eq!(first.max_concurrent, 3);
    }
}
