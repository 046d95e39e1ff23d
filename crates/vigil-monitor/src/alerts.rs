//! Alert types and the notification channel contract.

#[cfg(test)]
#[path = "alerts_tests.rs"]
mod tests;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::MonitorError;

/// Alert severity level. Ordered: Low < Medium < High < Critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Low => write!(f, "LOW"),
            AlertSeverity::Medium => write!(f, "MEDIUM"),
            AlertSeverity::High => write!(f, "HIGH"),
            AlertSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl AlertSeverity {
    /// Get emoji for severity.
    pub fn emoji(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "\u{2139}\u{fe0f}",
            AlertSeverity::Medium => "\u{26a0}\u{fe0f}",
            AlertSeverity::High => "\u{274c}",
            AlertSeverity::Critical => "\u{1f6a8}",
        }
    }

    /// Get color for chat attachments.
    pub fn color(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "#36a64f",      // green
            AlertSeverity::Medium => "#f0ad4e",   // yellow
            AlertSeverity::High => "#d9534f",     // red
            AlertSeverity::Critical => "#800000", // dark red
        }
    }
}

/// Alert lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Suppressed,
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertStatus::Active => write!(f, "active"),
            AlertStatus::Acknowledged => write!(f, "acknowledged"),
            AlertStatus::Resolved => write!(f, "resolved"),
            AlertStatus::Suppressed => write!(f, "suppressed"),
        }
    }
}

/// A notifiable event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    /// Short machine-friendly name, e.g. `service_unhealthy`.
    pub name: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub message: String,
    pub description: String,
    /// Component that raised the alert.
    pub source: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_by: Option<String>,
}

impl Alert {
    /// Create a new active alert with a fresh id.
    pub fn new(name: impl Into<String>, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            severity,
            status: AlertStatus::Active,
            message: message.into(),
            description: String::new(),
            source: String::new(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            starts_at: Utc::now(),
            ends_at: None,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_by: None,
        }
    }

    /// Set description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add an annotation.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Whether every `(key, value)` pair is present in the labels.
    pub fn labels_match(&self, required: &HashMap<String, String>) -> bool {
        required
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|actual| actual == v))
    }

    /// Format for text output.
    pub fn format_text(&self) -> String {
        let mut text = format!(
            "[{}] {} - {}\n{}",
            self.severity,
            self.starts_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.name,
            self.message
        );

        if !self.description.is_empty() {
            text.push_str(&format!("\n{}", self.description));
        }
        if !self.source.is_empty() {
            text.push_str(&format!("\nSource: {}", self.source));
        }

        text
    }

    /// Format for Markdown output.
    pub fn format_markdown(&self) -> String {
        let mut text = format!(
            "{} **{}** - {}\n\n{}",
            self.severity.emoji(),
            self.name,
            self.starts_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.message
        );

        if !self.source.is_empty() {
            text.push_str(&format!("\n\n_Source: {}_", self.source));
        }

        text
    }
}

/// Severity floor plus required labels shared by channel implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelFilter {
    pub min_severity: AlertSeverity,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl ChannelFilter {
    /// Accept everything at or above `min_severity`.
    pub fn new(min_severity: AlertSeverity) -> Self {
        Self {
            min_severity,
            labels: HashMap::new(),
        }
    }

    /// Require a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Severity at or above the floor and all labels present.
    pub fn matches(&self, alert: &Alert) -> bool {
        alert.severity >= self.min_severity && alert.labels_match(&self.labels)
    }
}

impl Default for ChannelFilter {
    fn default() -> Self {
        Self::new(AlertSeverity::Low)
    }
}

/// Notification channel.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name.
    fn name(&self) -> &str;

    /// Disabled channels are skipped by the dispatcher.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Whether this channel wants the alert.
    fn should_send(&self, alert: &Alert) -> bool;

    /// Deliver an alert.
    async fn send(&self, alert: &Alert) -> Result<(), MonitorError>;
}

/// Log channel (writes to tracing).
pub struct LogChannel {
    filter: ChannelFilter,
}

impl LogChannel {
    /// Log every alert.
    pub fn new() -> Self {
        Self {
            filter: ChannelFilter::default(),
        }
    }

    /// Log alerts accepted by `filter`.
    pub fn with_filter(filter: ChannelFilter) -> Self {
        Self { filter }
    }
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    fn should_send(&self, alert: &Alert) -> bool {
        self.filter.matches(alert)
    }

    async fn send(&self, alert: &Alert) -> Result<(), MonitorError> {
        match alert.severity {
            AlertSeverity::Low => info!("[ALERT] {}: {}", alert.name, alert.message),
            AlertSeverity::Medium => warn!("[ALERT] {}: {}", alert.name, alert.message),
            AlertSeverity::High | AlertSeverity::Critical => {
                error!("[ALERT] {}: {}", alert.name, alert.message)
            }
        }
        Ok(())
    }
}
