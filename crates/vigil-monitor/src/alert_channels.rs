//! Webhook notification channel.

use async_trait::async_trait;
use tracing::debug;

use crate::config::WebhookConfig;
use crate::error::MonitorError;

use super::alerts::{Alert, AlertSeverity, ChannelFilter, NotificationChannel};

/// Posts every accepted alert as JSON to a fixed URL.
///
/// The body carries the full alert plus a chat-style `attachments` block so
/// the same endpoint can be a generic receiver or a chat incoming webhook.
pub struct WebhookChannel {
    name: String,
    url: String,
    filter: ChannelFilter,
    enabled: bool,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Create a channel accepting every alert.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            filter: ChannelFilter::new(AlertSeverity::Low),
            enabled: true,
            client: reqwest::Client::new(),
        }
    }

    /// Create from config.
    pub fn from_config(config: &WebhookConfig) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            filter: ChannelFilter {
                min_severity: config.min_severity,
                labels: config.labels.clone(),
            },
            enabled: config.enabled,
            client: reqwest::Client::new(),
        }
    }

    /// Replace the filter.
    pub fn with_filter(mut self, filter: ChannelFilter) -> Self {
        self.filter = filter;
        self
    }

    fn payload(alert: &Alert) -> serde_json::Value {
        let footer = if alert.source.is_empty() {
            "vigil"
        } else {
            alert.source.as_str()
        };
        serde_json::json!({
            "alert": alert,
            "text": alert.format_text(),
            "attachments": [{
                "color": alert.severity.color(),
                "title": format!("{} {}", alert.severity.emoji(), alert.name),
                "text": alert.message,
                "footer": footer,
                "ts": alert.starts_at.timestamp(),
                "fields": alert.labels.iter().map(|(k, v)| {
                    serde_json::json!({ "title": k, "value": v, "short": true })
                }).collect::<Vec<_>>()
            }]
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn should_send(&self, alert: &Alert) -> bool {
        self.filter.matches(alert)
    }

    async fn send(&self, alert: &Alert) -> Result<(), MonitorError> {
        let response = self
            .client
            .post(&self.url)
            .json(&Self::payload(alert))
            .send()
            .await
            .map_err(|e| MonitorError::ChannelDelivery {
                channel: self.name.clone(),
                reason: format!("request failed: {}", e),
            })?;

        if response.status().is_success() {
            debug!("Webhook {} accepted alert {}", self.name, alert.id);
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(MonitorError::ChannelDelivery {
                channel: self.name.clone(),
                reason: format!("webhook returned {}: {}", status, body),
            })
        }
    }
}
