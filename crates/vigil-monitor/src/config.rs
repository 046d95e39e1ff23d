//! Monitor, recovery and alerting configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::alerts::AlertSeverity;
use crate::error::MonitorError;

/// Health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval between polling passes (in seconds).
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Minimum time between two notifications of the same kind for one service (in seconds).
    #[serde(default = "default_notification_cooldown")]
    pub notification_cooldown_secs: u64,

    /// Check records kept per service.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// How long `stop_monitoring` waits for the loop to exit (in seconds).
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Upper bound on a single probe call (in seconds).
    /// Probes are expected to time out sooner on their own.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Consecutive failures at which a service becomes Unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

fn default_check_interval() -> u64 {
    30
}

fn default_notification_cooldown() -> u64 {
    300
}

fn default_history_capacity() -> usize {
    100
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    30
}

fn default_unhealthy_threshold() -> u32 {
    3
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            notification_cooldown_secs: default_notification_cooldown(),
            history_capacity: default_history_capacity(),
            stop_timeout_secs: default_stop_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn notification_cooldown(&self) -> Duration {
        Duration::from_secs(self.notification_cooldown_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.check_interval_secs == 0 {
            return Err(MonitorError::InvalidConfig(
                "check_interval_secs must be > 0".to_string(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(MonitorError::InvalidConfig(
                "history_capacity must be > 0".to_string(),
            ));
        }
        if self.probe_timeout_secs == 0 {
            return Err(MonitorError::InvalidConfig(
                "probe_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.unhealthy_threshold == 0 {
            return Err(MonitorError::InvalidConfig(
                "unhealthy_threshold must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default circuit breaker settings for recovery-enabled services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failed recoveries before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open breaker waits before a trial attempt (in seconds).
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,

    /// Trial attempts admitted while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_half_open_max_calls() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Recovery manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Minimum time between two recovery attempts for one service (in seconds).
    #[serde(default = "default_recovery_cooldown")]
    pub cooldown_secs: u64,

    /// Highest escalation level.
    #[serde(default = "default_max_escalation_level")]
    pub max_escalation_level: u32,

    /// Strategy executions kept per service.
    #[serde(default = "default_attempt_history_capacity")]
    pub attempt_history_capacity: usize,

    /// Attempts included in a recovery status snapshot.
    #[serde(default = "default_status_attempt_limit")]
    pub status_attempt_limit: usize,

    /// Upper bound on a single recovery action (in seconds).
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,

    /// Whether a breaker is created automatically for every registered service.
    #[serde(default = "default_auto_circuit_breaker")]
    pub auto_circuit_breaker: bool,

    /// Breaker settings used by `auto_circuit_breaker`.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_recovery_cooldown() -> u64 {
    300
}

fn default_max_escalation_level() -> u32 {
    3
}

fn default_attempt_history_capacity() -> usize {
    100
}

fn default_status_attempt_limit() -> usize {
    10
}

fn default_action_timeout() -> u64 {
    60
}

fn default_auto_circuit_breaker() -> bool {
    true
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_recovery_cooldown(),
            max_escalation_level: default_max_escalation_level(),
            attempt_history_capacity: default_attempt_history_capacity(),
            status_attempt_limit: default_status_attempt_limit(),
            action_timeout_secs: default_action_timeout(),
            auto_circuit_breaker: default_auto_circuit_breaker(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl RecoveryConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.action_timeout_secs == 0 {
            return Err(MonitorError::InvalidConfig(
                "action_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.attempt_history_capacity == 0 {
            return Err(MonitorError::InvalidConfig(
                "attempt_history_capacity must be > 0".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(MonitorError::InvalidConfig(
                "circuit_breaker.failure_threshold must be > 0".to_string(),
            ));
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            return Err(MonitorError::InvalidConfig(
                "circuit_breaker.half_open_max_calls must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Alert dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Alerts kept in history.
    #[serde(default = "default_alert_history_capacity")]
    pub history_capacity: usize,

    /// Per-channel send timeout (in seconds).
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Whether to log every alert through tracing.
    #[serde(default = "default_log_channel")]
    pub log_channel: bool,

    /// Minimum severity for the log channel.
    #[serde(default = "default_log_min_severity")]
    pub log_min_severity: AlertSeverity,

    /// Generic webhook channels.
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
}

fn default_alert_history_capacity() -> usize {
    1000
}

fn default_send_timeout() -> u64 {
    10
}

fn default_log_channel() -> bool {
    true
}

fn default_log_min_severity() -> AlertSeverity {
    AlertSeverity::Low
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_alert_history_capacity(),
            send_timeout_secs: default_send_timeout(),
            log_channel: default_log_channel(),
            log_min_severity: default_log_min_severity(),
            webhooks: Vec::new(),
        }
    }
}

impl AlertsConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.history_capacity == 0 {
            return Err(MonitorError::InvalidConfig(
                "history_capacity must be > 0".to_string(),
            ));
        }
        if self.send_timeout_secs == 0 {
            return Err(MonitorError::InvalidConfig(
                "send_timeout_secs must be > 0".to_string(),
            ));
        }
        for webhook in &self.webhooks {
            if webhook.url.is_empty() {
                return Err(MonitorError::InvalidConfig(format!(
                    "webhook '{}' has an empty url",
                    webhook.name
                )));
            }
        }
        Ok(())
    }
}

/// Webhook channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Channel name.
    pub name: String,
    /// Endpoint receiving a JSON POST per alert.
    pub url: String,
    /// Lowest severity delivered.
    #[serde(default = "default_log_min_severity")]
    pub min_severity: AlertSeverity,
    /// Labels an alert must carry (all must match).
    #[serde(default)]
    pub labels: std::collections::HashMap<String, String>,
    /// Whether the channel is enabled.
    #[serde(default = "default_log_channel")]
    pub enabled: bool,
}

/// TOML loader with `${VAR}` environment substitution.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load a TOML file.
    pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T, MonitorError> {
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load from a string.
    pub fn load_str<T: DeserializeOwned>(content: &str) -> Result<T, MonitorError> {
        let expanded = Self::expand_env_vars(content)?;
        Ok(toml::from_str(&expanded)?)
    }

    fn expand_env_vars(content: &str) -> Result<String, MonitorError> {
        let re = regex::Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| MonitorError::Custom(e.to_string()))?;
        let mut result = content.to_string();

        for cap in re.captures_iter(content) {
            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| MonitorError::EnvVarNotSet(var_name.to_string()))?;
            result = result.replace(&cap[0], &value);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default)]
        monitor: MonitorConfig,
        #[serde(default)]
        recovery: RecoveryConfig,
        #[serde(default)]
        alerts: AlertsConfig,
    }

    #[test]
    fn test_defaults() {
        let monitor = MonitorConfig::default();
        assert_eq!(monitor.check_interval(), Duration::from_secs(30));
        assert_eq!(monitor.notification_cooldown(), Duration::from_secs(300));
        assert_eq!(monitor.history_capacity, 100);
        assert_eq!(monitor.stop_timeout(), Duration::from_secs(10));
        assert_eq!(monitor.unhealthy_threshold, 3);

        let recovery = RecoveryConfig::default();
        assert_eq!(recovery.cooldown(), Duration::from_secs(300));
        assert_eq!(recovery.max_escalation_level, 3);
        assert_eq!(recovery.circuit_breaker.failure_threshold, 3);

        let alerts = AlertsConfig::default();
        assert_eq!(alerts.history_capacity, 1000);
        assert_eq!(alerts.send_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_validate_defaults() {
        assert!(MonitorConfig::default().validate().is_ok());
        assert!(RecoveryConfig::default().validate().is_ok());
        assert!(AlertsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_interval() {
        let config = MonitorConfig {
            check_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_threshold() {
        let mut config = RecoveryConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_webhook_url() {
        let config = AlertsConfig {
            webhooks: vec![WebhookConfig {
                name: "ops".to_string(),
                url: String::new(),
                min_severity: AlertSeverity::High,
                labels: Default::default(),
                enabled: true,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_empty() {
        let sample: Sample = ConfigLoader::load_str("").unwrap();
        assert_eq!(sample.monitor.check_interval_secs, 30);
        assert!(sample.alerts.log_channel);
    }

    #[test]
    fn test_load_sections() {
        let content = r#"
            [monitor]
            check_interval_secs = 5
            unhealthy_threshold = 5

            [recovery]
            cooldown_secs = 0

            [recovery.circuit_breaker]
            failure_threshold = 2

            [[alerts.webhooks]]
            name = "ops"
            url = "https://hooks.example.com/ops"
            min_severity = "high"
        "#;
        let sample: Sample = ConfigLoader::load_str(content).unwrap();
        assert_eq!(sample.monitor.check_interval_secs, 5);
        assert_eq!(sample.monitor.unhealthy_threshold, 5);
        assert_eq!(sample.monitor.history_capacity, 100);
        assert_eq!(sample.recovery.cooldown_secs, 0);
        assert_eq!(sample.recovery.circuit_breaker.failure_threshold, 2);
        assert_eq!(sample.recovery.circuit_breaker.recovery_timeout_secs, 60);
        assert_eq!(sample.alerts.webhooks.len(), 1);
        assert_eq!(sample.alerts.webhooks[0].min_severity, AlertSeverity::High);
        assert!(sample.alerts.webhooks[0].enabled);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[monitor]").unwrap();
        writeln!(file, "stop_timeout_secs = 3").unwrap();

        let sample: Sample = ConfigLoader::load(file.path()).unwrap();
        assert_eq!(sample.monitor.stop_timeout_secs, 3);
    }

    #[test]
    fn test_load_invalid_toml() {
        let result: Result<Sample, _> = ConfigLoader::load_str("monitor = [unclosed");
        assert!(matches!(result, Err(MonitorError::TomlParse(_))));
    }

    #[test]
    fn test_env_var_not_set() {
        let content = "[[alerts.webhooks]]\nname = \"x\"\nurl = \"${VIGIL_TEST_UNSET_VAR_98765}\"";
        let result: Result<Sample, _> = ConfigLoader::load_str(content);
        assert!(matches!(result, Err(MonitorError::EnvVarNotSet(_))));
    }

    #[test]
    fn test_env_var_expanded() {
        // SAFETY: test-only variable with a unique name
        unsafe {
            std::env::set_var("VIGIL_TEST_WEBHOOK_URL", "https://hooks.example.com/x");
        }
        let content = "[[alerts.webhooks]]\nname = \"x\"\nurl = \"${VIGIL_TEST_WEBHOOK_URL}\"";
        let sample: Sample = ConfigLoader::load_str(content).unwrap();
        assert_eq!(sample.alerts.webhooks[0].url, "https://hooks.example.com/x");
        unsafe {
            std::env::remove_var("VIGIL_TEST_WEBHOOK_URL");
        }
    }
}
