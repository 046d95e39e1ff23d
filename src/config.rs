//! Binary configuration: server, monitored services and library settings.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use vigil_monitor::{
    AlertsConfig, ConfigLoader, MonitorConfig, MonitorError, RecoveryConfig, ServiceType,
    StrategyKind,
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Start the poll loop together with the server.
    #[serde(default = "default_true")]
    pub start_monitoring: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            start_monitoring: true,
        }
    }
}

/// One monitored dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    #[serde(rename = "type", default = "default_service_type")]
    pub service_type: ServiceType,

    pub probe: ProbeConfig,

    /// Recovery hooks, tried in priority order.
    #[serde(default)]
    pub recovery: Vec<RecoveryHookConfig>,
}

fn default_service_type() -> ServiceType {
    ServiceType::Other
}

/// How a service is probed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeConfig {
    /// Healthy when a TCP connection can be opened.
    Tcp {
        address: String,
        #[serde(default = "default_probe_timeout")]
        timeout_secs: u64,
    },
    /// Healthy when a GET answers with a success status (or `expected_status`).
    Http {
        url: String,
        #[serde(default = "default_probe_timeout")]
        timeout_secs: u64,
        #[serde(default)]
        expected_status: Option<u16>,
    },
}

fn default_probe_timeout() -> u64 {
    5
}

/// HTTP method used by a recovery hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HookMethod {
    Get,
    #[default]
    Post,
    Put,
}

/// A recovery action that calls an HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryHookConfig {
    pub strategy: StrategyKind,

    #[serde(default)]
    pub priority: i32,

    pub url: String,

    #[serde(default)]
    pub method: HookMethod,

    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,
}

fn default_hook_timeout() -> u64 {
    30
}

impl VigilConfig {
    /// Load from `path`, falling back to defaults when the file is missing.
    pub fn load(path: &Path) -> Result<Self, MonitorError> {
        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let config: Self = ConfigLoader::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), MonitorError> {
        self.monitor.validate()?;
        self.recovery.validate()?;
        self.alerts.validate()?;

        let mut names = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(MonitorError::InvalidConfig(
                    "service name must not be empty".to_string(),
                ));
            }
            if !names.insert(service.name.as_str()) {
                return Err(MonitorError::InvalidConfig(format!(
                    "duplicate service: {}",
                    service.name
                )));
            }
            let probe_timeout = match &service.probe {
                ProbeConfig::Tcp { timeout_secs, .. } | ProbeConfig::Http { timeout_secs, .. } => {
                    *timeout_secs
                }
            };
            if probe_timeout == 0 {
                return Err(MonitorError::InvalidConfig(format!(
                    "service {}: probe timeout_secs must be > 0",
                    service.name
                )));
            }
            if service.recovery.iter().any(|hook| hook.timeout_secs == 0) {
                return Err(MonitorError::InvalidConfig(format!(
                    "service {}: recovery hook timeout_secs must be > 0",
                    service.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[server]
port = 9100

[monitor]
check_interval_secs = 15

[recovery]
cooldown_secs = 120

[[alerts.webhooks]]
name = "ops"
url = "https://hooks.example.com/ops"
min_severity = "high"

[[services]]
name = "db"
type = "database"
probe = { kind = "tcp", address = "127.0.0.1:5432" }

[[services.recovery]]
strategy = "restart_connection"
priority = 1
url = "http://127.0.0.1:9000/db/reconnect"

[[services]]
name = "search"
type = "external_api"
probe = { kind = "http", url = "http://127.0.0.1:9200/_cluster/health", expected_status = 200 }
"#;

    #[test]
    fn test_parse_sample() {
        let config: VigilConfig = ConfigLoader::load_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.monitor.check_interval_secs, 15);
        assert_eq!(config.monitor.notification_cooldown_secs, 300);
        assert_eq!(config.recovery.cooldown_secs, 120);
        assert_eq!(config.alerts.webhooks.len(), 1);
        assert_eq!(config.services.len(), 2);

        let db = &config.services[0];
        assert_eq!(db.service_type, ServiceType::Database);
        assert!(matches!(&db.probe, ProbeConfig::Tcp { timeout_secs: 5, .. }));
        assert_eq!(db.recovery[0].strategy, StrategyKind::RestartConnection);
        assert_eq!(db.recovery[0].method, HookMethod::Post);

        assert!(matches!(
            &config.services[1].probe,
            ProbeConfig::Http { expected_status: Some(200), .. }
        ));
    }

    #[test]
    fn test_shipped_default_config_is_valid() {
        let config: VigilConfig =
            ConfigLoader::load_str(include_str!("../config/default.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].recovery.len(), 2);
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let content = r#"
[[services]]
name = "db"
probe = { kind = "tcp", address = "127.0.0.1:5432" }

[[services]]
name = "db"
probe = { kind = "tcp", address = "127.0.0.1:5433" }
"#;
        let config: VigilConfig = ConfigLoader::load_str(content).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate service"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = VigilConfig::load(Path::new("/nonexistent/vigil.toml")).unwrap();
        assert_eq!(config.server.port, 8090);
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = VigilConfig::load(file.path()).unwrap();
        assert_eq!(config.services[0].name, "db");
    }

    #[test]
    fn test_invalid_monitor_section_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[monitor]\ncheck_interval_secs = 0\n").unwrap();

        assert!(VigilConfig::load(file.path()).is_err());
    }
}
