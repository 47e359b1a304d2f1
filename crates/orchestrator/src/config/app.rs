//! Application configuration for the sqlgate orchestrator.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::Instance;

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `SQLGATE_`:
/// - `SQLGATE_HOST`: Server bind address (default: "0.0.0.0")
/// - `SQLGATE_PORT`: Server port (default: 10000)
/// - `SQLGATE_QUEUE_CAPACITY`: Action queue capacity (default: 1024)
/// - `SQLGATE_ENQUEUE_TIMEOUT_MS`: How long enqueue waits on a full queue (default: 5000)
/// - `SQLGATE_DRIVERS`: Driver backends, `db_type=url` pairs separated by commas
/// - `SQLGATE_DRIVER_TIMEOUT_SECS`: Connect timeout towards backends, and call
///   timeout for everything but `Exec`, `Tx` and `GenRollbackSQL` (default: 30)
/// - `SQLGATE_STORE`: `memory` or `postgres` (default: "memory")
/// - `SQLGATE_INSTANCES`: JSON list of instances registered in the memory store
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,

    #[serde(default)]
    pub drivers: Option<String>,

    #[serde(default = "default_driver_timeout_secs")]
    pub driver_timeout_secs: u64,

    #[serde(default = "default_store")]
    pub store: String,

    #[serde(default)]
    pub instances: Option<String>,
}

/// One entry of `SQLGATE_INSTANCES`.
#[derive(Debug, Deserialize)]
struct InstanceSetting {
    name: String,
    db_type: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    port: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    password: String,
}

impl From<InstanceSetting> for Instance {
    fn from(setting: InstanceSetting) -> Self {
        Instance {
            id: 0,
            name: setting.name,
            db_type: setting.db_type,
            host: setting.host,
            port: setting.port,
            user: setting.user,
            password: setting.password,
        }
    }
}

/// Task store backend selected by `SQLGATE_STORE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Postgres,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    10000
}

fn default_server_name() -> String {
    "sqlgated".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_enqueue_timeout_ms() -> u64 {
    5000
}

fn default_driver_timeout_secs() -> u64 {
    30
}

fn default_store() -> String {
    "memory".to_string()
}

impl AppConfig {
    /// Load configuration from `SQLGATE_*` environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("SQLGATE_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_secs(self.driver_timeout_secs)
    }

    pub fn store_kind(&self) -> OrchestratorResult<StoreKind> {
        match self.store.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreKind::Memory),
            "postgres" | "postgresql" => Ok(StoreKind::Postgres),
            other => Err(OrchestratorError::Config(format!(
                "Unknown task store: {}",
                other
            ))),
        }
    }

    /// Parse `SQLGATE_DRIVERS` into `(db_type, url)` pairs.
    pub fn driver_endpoints(&self) -> OrchestratorResult<Vec<(String, String)>> {
        let Some(drivers) = &self.drivers else {
            return Ok(Vec::new());
        };

        drivers
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (db_type, url) = entry.split_once('=').ok_or_else(|| {
                    OrchestratorError::Config(format!(
                        "Invalid driver entry '{}', expected db_type=url",
                        entry
                    ))
                })?;
                let (db_type, url) = (db_type.trim(), url.trim());
                if db_type.is_empty() || url.is_empty() {
                    return Err(OrchestratorError::Config(format!(
                        "Invalid driver entry '{}', expected db_type=url",
                        entry
                    )));
                }
                Ok((db_type.to_string(), url.to_string()))
            })
            .collect()
    }

    /// Parse `SQLGATE_INSTANCES`, e.g.
    /// `[{"name":"orders","db_type":"mysql","host":"10.0.0.5","port":"3306","user":"root","password":"x"}]`.
    pub fn instances(&self) -> OrchestratorResult<Vec<Instance>> {
        let Some(raw) = self.instances.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(Vec::new());
        };

        let settings: Vec<InstanceSetting> = serde_json::from_str(raw)
            .map_err(|e| OrchestratorError::Config(format!("Invalid SQLGATE_INSTANCES: {}", e)))?;
        if let Some(unnamed) = settings.iter().find(|s| s.name.trim().is_empty() || s.db_type.trim().is_empty()) {
            return Err(OrchestratorError::Config(format!(
                "Instance entry needs a name and a db_type: {:?}",
                unnamed.name
            )));
        }
        Ok(settings.into_iter().map(Instance::from).collect())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_name: default_server_name(),
            queue_capacity: default_queue_capacity(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            drivers: None,
            driver_timeout_secs: default_driver_timeout_secs(),
            store: default_store(),
            instances: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:10000");
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.enqueue_timeout(), Duration::from_secs(5));
        assert_eq!(config.store_kind().unwrap(), StoreKind::Memory);
    }

    #[test]
    fn test_driver_endpoints() {
        let config = AppConfig {
            drivers: Some("mysql=http://mysql-driver:10001, memory = http://localhost:10002,".to_string()),
            ..Default::default()
        };
        let endpoints = config.driver_endpoints().unwrap();
        assert_eq!(
            endpoints,
            vec![
                ("mysql".to_string(), "http://mysql-driver:10001".to_string()),
                ("memory".to_string(), "http://localhost:10002".to_string()),
            ]
        );
    }

    #[test]
    fn test_invalid_driver_entry() {
        let config = AppConfig {
            drivers: Some("mysql".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.driver_endpoints(),
            Err(OrchestratorError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_store() {
        let config = AppConfig {
            store: "redis".to_string(),
            ..Default::default()
        };
        assert!(config.store_kind().is_err());
    }

    #[test]
    fn test_instances() {
        let config = AppConfig {
            instances: Some(
                r#"[{"name":"orders","db_type":"mysql","host":"10.0.0.5","port":"3306","user":"root","password":"x"},
                    {"name":"scratch","db_type":"memory"}]"#
                    .to_string(),
            ),
            ..Default::default()
        };
        let instances = config.instances().unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].host, "10.0.0.5");
        assert_eq!(instances[0].password, "x");
        assert_eq!(instances[1].db_type, "memory");
        assert!(instances[1].host.is_empty());

        assert!(AppConfig::default().instances().unwrap().is_empty());

        let config = AppConfig {
            instances: Some(r#"[{"name":"","db_type":"mysql"}]"#.to_string()),
            ..Default::default()
        };
        assert!(matches!(config.instances(), Err(OrchestratorError::Config(_))));
    }
}
