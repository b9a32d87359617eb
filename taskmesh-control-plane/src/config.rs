//! Control plane configuration, layered TOML + `APP__`-prefixed env (§10.1).

use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use taskmesh_common::config::{BrokerConfig, DbConfig};
use taskmesh_common::tracing_config::TracingConfig;
use taskmesh_common::SafeDisplay;
use taskmesh_service_base::clients::RemoteServiceConfig;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    pub tracing: TracingConfig,
    pub http_port: u16,
    pub db: DbConfig,
    pub broker: BrokerConfig,
    pub dispatch: DispatchConfig,
    pub worker_liveness_secs: i64,
    pub script_catalog: RemoteServiceConfig,
    pub status_log_retention_days: i64,
    /// Where `POST /tasks/{id}/screenshot` writes uploaded images (§6); the
    /// stored path is injected into `Execution.result` rather than the
    /// bytes themselves.
    pub media_root: PathBuf,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("taskmesh-control-plane"),
            http_port: 8090,
            db: DbConfig::default(),
            broker: BrokerConfig::default(),
            dispatch: DispatchConfig::default(),
            worker_liveness_secs: 120,
            script_catalog: RemoteServiceConfig::default(),
            status_log_retention_days: 30,
            media_root: PathBuf::from("media"),
        }
    }
}

impl SafeDisplay for ControlPlaneConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "DB:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "broker:");
        let _ = writeln!(&mut result, "{}", self.broker.to_safe_string_indented());
        let _ = writeln!(&mut result, "dispatch:");
        let _ = writeln!(&mut result, "{}", self.dispatch.to_safe_string_indented());
        let _ = writeln!(&mut result, "worker liveness: {}s", self.worker_liveness_secs);
        let _ = writeln!(&mut result, "script catalog:");
        let _ = writeln!(&mut result, "{}", self.script_catalog.to_safe_string_indented());
        let _ = writeln!(
            &mut result,
            "status log retention: {} days",
            self.status_log_retention_days
        );
        let _ = writeln!(&mut result, "media root: {}", self.media_root.display());
        result
    }
}

/// §4.1's periodic tick, plus the per-tick candidate cap (protects the
/// dispatcher pass from scanning an unbounded pending backlog in one go).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub tick_interval_ms: u64,
    pub batch_limit: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2_000,
            batch_limit: 100,
        }
    }
}

impl SafeDisplay for DispatchConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "tick interval: {}ms, batch limit: {}",
            self.tick_interval_ms, self.batch_limit
        )
    }
}

pub fn make_config_loader() -> taskmesh_common::config::ConfigLoader<ControlPlaneConfig> {
    taskmesh_common::config::ConfigLoader::new(&PathBuf::from("config/control-plane.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_config_file() {
        let loader = make_config_loader();
        let config = loader.load().expect("defaults should always load");
        assert_eq!(config.http_port, 8090);
    }
}
