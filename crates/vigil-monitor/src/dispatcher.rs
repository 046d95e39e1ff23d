//! Alert dispatch: rule evaluation, suppression, per-rule cooldown and
//! severity/label routing to notification channels.

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::alert_channels::WebhookChannel;
use crate::alerts::{Alert, AlertSeverity, AlertStatus, ChannelFilter, LogChannel, NotificationChannel};
use crate::config::AlertsConfig;
use crate::error::{join_error_message, MonitorError};
use crate::history::BoundedHistory;

/// Condition evaluated by [`AlertDispatchEngine::check_rules`].
pub type AlertCondition = Arc<dyn Fn() -> bool + Send + Sync>;

/// A named condition that raises an alert when true.
#[derive(Clone)]
pub struct AlertRule {
    pub name: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub description: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// Minimum time between two firings of this rule.
    pub cooldown: Duration,
    pub enabled: bool,
    condition: AlertCondition,
}

impl AlertRule {
    /// Create an enabled rule with a five minute cooldown.
    pub fn new(
        name: impl Into<String>,
        severity: AlertSeverity,
        message: impl Into<String>,
        condition: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            severity,
            message: message.into(),
            description: String::new(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            cooldown: Duration::from_secs(300),
            enabled: true,
            condition: Arc::new(condition),
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Evaluate the condition.
    pub fn evaluate(&self) -> bool {
        (self.condition)()
    }

    fn build_alert(&self) -> Alert {
        let mut alert = Alert::new(&self.name, self.severity, &self.message)
            .with_description(&self.description)
            .with_source("alert_rule");
        alert.labels = self.labels.clone();
        alert.annotations = self.annotations.clone();
        alert
    }
}

impl std::fmt::Debug for AlertRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertRule")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .field("cooldown", &self.cooldown)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Blocks delivery of alerts matching all of its predicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionRule {
    pub name: String,
    /// Labels the alert must carry.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Severities covered; empty means any.
    #[serde(default)]
    pub severities: Vec<AlertSeverity>,
    /// After this instant the rule no longer matches.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SuppressionRule {
    /// Suppress everything until more predicates are added.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: HashMap::new(),
            severities: Vec::new(),
            expires_at: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_severity(mut self, severity: AlertSeverity) -> Self {
        self.severities.push(severity);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Whether the rule covers this alert at `now`.
    pub fn matches(&self, alert: &Alert, now: DateTime<Utc>) -> bool {
        if self.expires_at.is_some_and(|at| now >= at) {
            return false;
        }
        let severity_ok = self.severities.is_empty() || self.severities.contains(&alert.severity);
        severity_ok && alert.labels_match(&self.labels)
    }
}

/// What happened to a fired alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchReport {
    /// Dropped by a suppression rule; not stored, not delivered.
    Suppressed { rule: String },
    /// Stored and offered to channels.
    Dispatched {
        alert_id: String,
        delivered: Vec<String>,
        failed: Vec<String>,
    },
}

impl DispatchReport {
    pub fn is_suppressed(&self) -> bool {
        matches!(self, DispatchReport::Suppressed { .. })
    }

    /// Channels that accepted the alert.
    pub fn delivered(&self) -> &[String] {
        match self {
            DispatchReport::Dispatched { delivered, .. } => delivered,
            DispatchReport::Suppressed { .. } => &[],
        }
    }
}

struct RuleEntry {
    rule: Arc<AlertRule>,
    last_fired: Option<Instant>,
}

/// Alert dispatch engine.
pub struct AlertDispatchEngine {
    send_timeout: Duration,
    rules: Mutex<Vec<RuleEntry>>,
    channels: RwLock<Vec<Arc<dyn NotificationChannel>>>,
    suppressions: RwLock<Vec<SuppressionRule>>,
    active: RwLock<HashMap<String, Alert>>,
    history: RwLock<BoundedHistory<Alert>>,
}

impl AlertDispatchEngine {
    /// Create an engine with no channels.
    pub fn new(config: &AlertsConfig) -> Self {
        Self {
            send_timeout: config.send_timeout(),
            rules: Mutex::new(Vec::new()),
            channels: RwLock::new(Vec::new()),
            suppressions: RwLock::new(Vec::new()),
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(BoundedHistory::new(config.history_capacity)),
        }
    }

    /// Create an engine with the channels described by the config.
    pub fn from_config(config: &AlertsConfig) -> Self {
        let engine = Self::new(config);

        if config.log_channel {
            engine.add_channel(Arc::new(LogChannel::with_filter(ChannelFilter::new(
                config.log_min_severity,
            ))));
        }

        for webhook in &config.webhooks {
            info!("Adding webhook alert channel: {}", webhook.name);
            engine.add_channel(Arc::new(WebhookChannel::from_config(webhook)));
        }

        engine
    }

    /// Register a rule.
    pub fn add_rule(&self, rule: AlertRule) {
        debug!("Adding alert rule: {}", rule.name);
        self.rules.lock().push(RuleEntry {
            rule: Arc::new(rule),
            last_fired: None,
        });
    }

    /// Register a channel.
    pub fn add_channel(&self, channel: Arc<dyn NotificationChannel>) {
        self.channels.write().push(channel);
    }

    /// Remove channels by name. Returns whether any was removed.
    pub fn remove_channel(&self, name: &str) -> bool {
        let mut channels = self.channels.write();
        let before = channels.len();
        channels.retain(|c| c.name() != name);
        channels.len() != before
    }

    /// Registered channel names.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.read().iter().map(|c| c.name().to_string()).collect()
    }

    /// Register a suppression rule.
    pub fn add_suppression_rule(&self, rule: SuppressionRule) {
        debug!("Adding suppression rule: {}", rule.name);
        self.suppressions.write().push(rule);
    }

    /// Evaluate every rule outside its cooldown and fire those whose condition holds.
    pub async fn check_rules(&self) -> Vec<DispatchReport> {
        let now = Instant::now();
        let due: Vec<Arc<AlertRule>> = self
            .rules
            .lock()
            .iter()
            .filter(|entry| entry.rule.enabled)
            .filter(|entry| {
                entry
                    .last_fired
                    .is_none_or(|t| now.saturating_duration_since(t) >= entry.rule.cooldown)
            })
            .map(|entry| entry.rule.clone())
            .collect();

        // Conditions run unlocked; they may call back into the engine.
        let fired: Vec<Arc<AlertRule>> = due.into_iter().filter(|rule| rule.evaluate()).collect();

        {
            let mut rules = self.rules.lock();
            for entry in rules.iter_mut() {
                if fired.iter().any(|rule| Arc::ptr_eq(rule, &entry.rule)) {
                    entry.last_fired = Some(now);
                }
            }
        }

        let to_fire: Vec<Alert> = fired.iter().map(|rule| rule.build_alert()).collect();

        let mut reports = Vec::with_capacity(to_fire.len());
        for alert in to_fire {
            reports.push(self.fire_alert(alert).await);
        }
        reports
    }

    /// Store an alert and deliver it to every interested channel.
    pub async fn fire_alert(&self, alert: Alert) -> DispatchReport {
        let now = Utc::now();
        let suppressed_by = self
            .suppressions
            .read()
            .iter()
            .find(|rule| rule.matches(&alert, now))
            .map(|rule| rule.name.clone());
        if let Some(rule) = suppressed_by {
            debug!("Alert {} suppressed by rule {}", alert.name, rule);
            return DispatchReport::Suppressed { rule };
        }

        self.active.write().insert(alert.id.clone(), alert.clone());
        self.history.write().push(alert.clone());

        let targets: Vec<Arc<dyn NotificationChannel>> = self
            .channels
            .read()
            .iter()
            .filter(|c| c.is_enabled() && c.should_send(&alert))
            .cloned()
            .collect();

        let results = join_all(targets.iter().map(|channel| self.send_one(channel.clone(), &alert))).await;

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for (channel, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered.push(channel.name().to_string()),
                Err(e) => {
                    error!("Failed to send alert via {}: {}", channel.name(), e);
                    failed.push(channel.name().to_string());
                }
            }
        }

        DispatchReport::Dispatched {
            alert_id: alert.id,
            delivered,
            failed,
        }
    }

    async fn send_one(
        &self,
        channel: Arc<dyn NotificationChannel>,
        alert: &Alert,
    ) -> Result<(), MonitorError> {
        let name = channel.name().to_string();
        let alert = alert.clone();
        let handle = tokio::spawn(async move { channel.send(&alert).await });
        let abort = handle.abort_handle();

        match tokio::time::timeout(self.send_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(MonitorError::ChannelDelivery {
                channel: name,
                reason: join_error_message(e),
            }),
            Err(_) => {
                abort.abort();
                Err(MonitorError::ChannelTimeout {
                    channel: name,
                    timeout: self.send_timeout,
                })
            }
        }
    }

    /// Mark an active alert acknowledged.
    pub fn acknowledge_alert(&self, id: &str, by: &str) -> Result<Alert, MonitorError> {
        let updated = {
            let mut active = self.active.write();
            let alert = active
                .get_mut(id)
                .ok_or_else(|| MonitorError::AlertNotFound(id.to_string()))?;
            alert.status = AlertStatus::Acknowledged;
            alert.acknowledged_at = Some(Utc::now());
            alert.acknowledged_by = Some(by.to_string());
            alert.clone()
        };
        info!("Alert {} acknowledged by {}", id, by);
        self.update_history(&updated);
        Ok(updated)
    }

    /// Resolve an active alert; it leaves the active set but stays in history.
    pub fn resolve_alert(&self, id: &str, by: &str) -> Result<Alert, MonitorError> {
        let mut alert = self
            .active
            .write()
            .remove(id)
            .ok_or_else(|| MonitorError::AlertNotFound(id.to_string()))?;
        Self::mark_resolved(&mut alert, by);
        info!("Alert {} resolved by {}", id, by);
        self.update_history(&alert);
        Ok(alert)
    }

    /// Resolve every active alert carrying all of `labels`. Returns how many.
    pub fn resolve_matching(&self, labels: &HashMap<String, String>, by: &str) -> usize {
        let resolved: Vec<Alert> = {
            let mut active = self.active.write();
            let ids: Vec<String> = active
                .values()
                .filter(|a| a.labels_match(labels))
                .map(|a| a.id.clone())
                .collect();
            let removed: Vec<Alert> = ids
                .iter()
                .filter_map(|id| active.remove(id))
                .map(|mut alert| {
                    Self::mark_resolved(&mut alert, by);
                    alert
                })
                .collect();
            removed
        };
        for alert in &resolved {
            self.update_history(alert);
        }
        resolved.len()
    }

    fn mark_resolved(alert: &mut Alert, by: &str) {
        alert.status = AlertStatus::Resolved;
        alert.ends_at = Some(Utc::now());
        alert.resolved_by = Some(by.to_string());
    }

    fn update_history(&self, updated: &Alert) {
        let mut history = self.history.write();
        match history.iter_mut().rev().find(|a| a.id == updated.id) {
            Some(entry) => *entry = updated.clone(),
            None => warn!("Alert {} already evicted from history", updated.id),
        }
    }

    /// Look up an alert, active first, then history.
    pub fn get_alert(&self, id: &str) -> Option<Alert> {
        if let Some(alert) = self.active.read().get(id) {
            return Some(alert.clone());
        }
        self.history.read().iter().rev().find(|a| a.id == id).cloned()
    }

    /// Active alerts, newest first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.active.read().values().cloned().collect();
        alerts.sort_by(|a, b| b.starts_at.cmp(&a.starts_at));
        alerts
    }

    /// Last `limit` alerts from history, most recent last.
    pub fn alert_history(&self, limit: usize) -> Vec<Alert> {
        self.history.read().last_n(limit)
    }
}
