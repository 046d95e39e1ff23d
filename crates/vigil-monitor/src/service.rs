//! Service identity and health status types.

use serde::{Deserialize, Serialize};

/// Unique name of a monitored dependency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// Create a service id.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ServiceId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Kind of dependency being monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// SQL or document database.
    Database,
    /// Cache server.
    Cache,
    /// Message broker or queue.
    Queue,
    /// Object or file storage.
    Storage,
    /// Third-party HTTP API.
    ExternalApi,
    /// Anything else.
    Other,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::Database => write!(f, "database"),
            ServiceType::Cache => write!(f, "cache"),
            ServiceType::Queue => write!(f, "queue"),
            ServiceType::Storage => write!(f, "storage"),
            ServiceType::ExternalApi => write!(f, "external_api"),
            ServiceType::Other => write!(f, "other"),
        }
    }
}

/// Health status of a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Not checked yet.
    #[default]
    Unknown,
    /// Last check succeeded.
    Healthy,
    /// One or a few consecutive failures.
    Degraded,
    /// Failure threshold reached.
    Unhealthy,
    /// First success after a run of failures.
    Recovering,
}

impl HealthStatus {
    /// Whether this status should trigger recovery.
    pub fn is_failing(&self) -> bool {
        matches!(self, HealthStatus::Degraded | HealthStatus::Unhealthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Recovering => write!(f, "recovering"),
        }
    }
}

/// Worst-of aggregation: any Unhealthy wins, then any Degraded, else Healthy.
pub fn aggregate_status<'a>(statuses: impl IntoIterator<Item = &'a HealthStatus>) -> HealthStatus {
    let mut overall = HealthStatus::Healthy;
    for status in statuses {
        match status {
            HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
            HealthStatus::Degraded => overall = HealthStatus::Degraded,
            _ => {}
        }
    }
    overall
}
