//! Monitor errors.

use std::time::Duration;

use thiserror::Error;

use crate::service::ServiceId;

/// Monitor error types.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Operation invoked against a service that was never registered.
    #[error("Service not registered: {0}")]
    ServiceNotRegistered(ServiceId),

    /// No active or historical alert with this id.
    #[error("Alert not found: {0}")]
    AlertNotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Environment variable referenced by the config is not set.
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    /// A notification channel rejected the alert.
    #[error("Alert delivery via {channel} failed: {reason}")]
    ChannelDelivery { channel: String, reason: String },

    /// A notification channel did not answer in time.
    #[error("Alert delivery via {channel} timed out after {timeout:?}")]
    ChannelTimeout { channel: String, timeout: Duration },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Generic error.
    #[error("{0}")]
    Custom(String),
}

/// Error returned by a health probe.
///
/// The monitor never propagates these; they become failed checks.
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("Health check timed out after {0:?}")]
    Timeout(Duration),

    #[error("Health check failed: {0}")]
    Failed(String),
}

/// Text of a panicked or cancelled task, used when a collaborator task dies.
pub(crate) fn join_error_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "task cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}
