//! Health monitor: probe polling, status transitions, notifications.
//!
//! Checks run either from the background poll loop or on demand. Both paths
//! go through [`ServiceHealthMonitor::check_service_health`], which runs the
//! probe without holding any lock and then applies the result under the
//! service's own lock, so interleaved callers never lose counter updates.

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::alerts::{Alert, AlertSeverity};
use crate::config::MonitorConfig;
use crate::dispatcher::AlertDispatchEngine;
use crate::error::{join_error_message, MonitorError, ProbeError};
use crate::history::BoundedHistory;
use crate::metrics::{CheckResult, ServiceHealthMetrics};
use crate::probe::HealthProbe;
use crate::recovery::ServiceRecoveryManager;
use crate::service::{aggregate_status, HealthStatus, ServiceId, ServiceType};

/// One entry of a service's check history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

/// Status of every registered service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    /// Worst status across services.
    pub overall: HealthStatus,
    pub services: Vec<ServiceHealthMetrics>,
    /// Whether the poll loop is running.
    pub monitoring: bool,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NotificationKind {
    Degraded,
    Unhealthy,
    Recovered,
}

impl NotificationKind {
    fn for_status(status: HealthStatus) -> Option<Self> {
        match status {
            HealthStatus::Degraded => Some(Self::Degraded),
            HealthStatus::Unhealthy => Some(Self::Unhealthy),
            HealthStatus::Recovering => Some(Self::Recovered),
            _ => None,
        }
    }
}

struct ServiceState {
    metrics: ServiceHealthMetrics,
    history: BoundedHistory<HealthRecord>,
    last_notified: HashMap<NotificationKind, Instant>,
}

struct ServiceEntry {
    probe: Arc<dyn HealthProbe>,
    state: Mutex<ServiceState>,
}

struct PollLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// What a single check decided while holding the service lock.
struct CheckOutcome {
    metrics: ServiceHealthMetrics,
    previous: HealthStatus,
    recover: bool,
    notify: Option<NotificationKind>,
}

/// Health monitor.
pub struct ServiceHealthMonitor {
    config: MonitorConfig,
    services: RwLock<HashMap<ServiceId, Arc<ServiceEntry>>>,
    recovery: Option<Arc<ServiceRecoveryManager>>,
    dispatcher: Option<Arc<AlertDispatchEngine>>,
    poll: Mutex<Option<PollLoop>>,
}

impl ServiceHealthMonitor {
    /// Create a monitor with no recovery manager and no alerting.
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            services: RwLock::new(HashMap::new()),
            recovery: None,
            dispatcher: None,
            poll: Mutex::new(None),
        }
    }

    /// Trigger recovery through `recovery` when a service starts failing.
    pub fn with_recovery(mut self, recovery: Arc<ServiceRecoveryManager>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Raise status alerts through `dispatcher`.
    pub fn with_dispatcher(mut self, dispatcher: Arc<AlertDispatchEngine>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Register a service.
    ///
    /// Registering a name again replaces its probe and starts its metrics
    /// and history over.
    pub fn register_service(
        &self,
        name: impl Into<ServiceId>,
        service_type: ServiceType,
        probe: Arc<dyn HealthProbe>,
    ) {
        let name = name.into();
        let entry = Arc::new(ServiceEntry {
            probe,
            state: Mutex::new(ServiceState {
                metrics: ServiceHealthMetrics::new(name.clone(), service_type),
                history: BoundedHistory::new(self.config.history_capacity),
                last_notified: HashMap::new(),
            }),
        });

        if self.services.write().insert(name.clone(), entry).is_some() {
            info!("Re-registered service {} ({})", name, service_type);
        } else {
            info!("Registered service {} ({})", name, service_type);
        }

        if let Some(recovery) = &self.recovery {
            recovery.register_service(&name);
        }
    }

    /// Stop monitoring a service and drop its recovery state. Returns whether
    /// it was registered.
    pub fn unregister_service(&self, name: &ServiceId) -> bool {
        let removed = self.services.write().remove(name).is_some();
        if removed {
            info!("Unregistered service {}", name);
            if let Some(recovery) = &self.recovery {
                recovery.unregister_service(name);
            }
        }
        removed
    }

    /// Registered service names, sorted.
    pub fn registered_services(&self) -> Vec<ServiceId> {
        let mut names: Vec<ServiceId> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn entry(&self, name: &ServiceId) -> Result<Arc<ServiceEntry>, MonitorError> {
        self.services
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MonitorError::ServiceNotRegistered(name.clone()))
    }

    /// Run the service's probe once and apply the result.
    ///
    /// Probe errors, panics and timeouts become failed checks. When the
    /// service is failing afterwards, recovery is started in the background.
    pub async fn check_service_health(
        &self,
        name: &ServiceId,
    ) -> Result<ServiceHealthMetrics, MonitorError> {
        let entry = self.entry(name)?;
        let result = self.run_probe(entry.probe.clone()).await;

        let outcome = {
            let mut state = entry.state.lock();
            let state = &mut *state;
            let previous = state.metrics.record(&result, self.config.unhealthy_threshold);
            let status = state.metrics.status;

            state.history.push(HealthRecord {
                timestamp: result.checked_at,
                status,
                response_time_ms: result.response_time_ms,
                error: result.error.clone(),
            });

            let recover = status.is_failing() && self.recovery.is_some();
            if recover {
                state.metrics.record_recovery_request(Utc::now());
            }

            let now = Instant::now();
            let cooldown = self.config.notification_cooldown();
            let notify = NotificationKind::for_status(status).filter(|kind| {
                let ready = state
                    .last_notified
                    .get(kind)
                    .is_none_or(|last| now.saturating_duration_since(*last) >= cooldown);
                if ready {
                    state.last_notified.insert(*kind, now);
                }
                ready
            });

            CheckOutcome {
                metrics: state.metrics.clone(),
                previous,
                recover,
                notify,
            }
        };

        let metrics = outcome.metrics;
        if metrics.status != outcome.previous {
            match metrics.status {
                HealthStatus::Degraded | HealthStatus::Unhealthy => warn!(
                    "Service {} is {} ({} consecutive failures): {}",
                    name,
                    metrics.status,
                    metrics.consecutive_failures,
                    metrics.error_message.as_deref().unwrap_or("unknown error")
                ),
                _ => info!("Service {} is {}", name, metrics.status),
            }
        }

        if outcome.recover {
            self.spawn_recovery(name, metrics.status);
        }

        if metrics.status == HealthStatus::Recovering {
            self.resolve_service_alerts(name);
        }

        if let Some(kind) = outcome.notify {
            self.notify(kind, &metrics).await;
        } else if metrics.status.is_failing() {
            debug!("Notification for {} suppressed by cooldown", name);
        }

        Ok(metrics)
    }

    async fn run_probe(&self, probe: Arc<dyn HealthProbe>) -> CheckResult {
        let timeout = self.config.probe_timeout();
        let started = Instant::now();
        let handle = tokio::spawn(async move { probe.check().await });
        let abort = handle.abort_handle();

        let outcome = tokio::time::timeout(timeout, handle).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(Ok(result))) => {
                let response_time_ms = result.response_time_ms.unwrap_or(elapsed_ms);
                if result.is_healthy() {
                    CheckResult::success(response_time_ms)
                } else {
                    let error = result
                        .error
                        .unwrap_or_else(|| "probe reported unhealthy".to_string());
                    CheckResult::failure(response_time_ms, error)
                }
            }
            Ok(Ok(Err(e))) => CheckResult::failure(elapsed_ms, e.to_string()),
            Ok(Err(e)) => CheckResult::failure(elapsed_ms, join_error_message(e)),
            Err(_) => {
                abort.abort();
                CheckResult::failure(elapsed_ms, ProbeError::Timeout(timeout).to_string())
            }
        }
    }

    fn spawn_recovery(&self, name: &ServiceId, status: HealthStatus) {
        let Some(recovery) = self.recovery.clone() else {
            return;
        };
        let name = name.clone();
        tokio::spawn(async move {
            match recovery.attempt_recovery(&name, status).await {
                Ok(true) => info!("Automatic recovery of {} succeeded", name),
                Ok(false) => debug!("Automatic recovery of {} did not succeed", name),
                Err(e) => error!("Automatic recovery of {} failed: {}", name, e),
            }
        });
    }

    fn resolve_service_alerts(&self, name: &ServiceId) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        let labels = HashMap::from([("service".to_string(), name.to_string())]);
        let resolved = dispatcher.resolve_matching(&labels, "health_monitor");
        if resolved > 0 {
            debug!("Resolved {} alerts for recovered service {}", resolved, name);
        }
    }

    async fn notify(&self, kind: NotificationKind, metrics: &ServiceHealthMetrics) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        let service = &metrics.service;
        let error = metrics.error_message.as_deref().unwrap_or("unknown error");

        let alert = match kind {
            NotificationKind::Degraded => Alert::new(
                "service_degraded",
                AlertSeverity::Medium,
                format!("Service {} is degraded: {}", service, error),
            ),
            NotificationKind::Unhealthy => Alert::new(
                "service_unhealthy",
                AlertSeverity::High,
                format!(
                    "Service {} is unhealthy after {} consecutive failures: {}",
                    service, metrics.consecutive_failures, error
                ),
            ),
            NotificationKind::Recovered => Alert::new(
                "service_recovered",
                AlertSeverity::Low,
                format!("Service {} has recovered", service),
            ),
        }
        .with_source("health_monitor")
        .with_label("service", service.as_str())
        .with_label("service_type", metrics.service_type.to_string())
        .with_annotation("uptime_percentage", format!("{:.2}", metrics.uptime_percentage))
        .with_annotation("response_time_ms", metrics.response_time_ms.to_string());

        dispatcher.fire_alert(alert).await;
    }

    /// Current metrics of one service.
    pub fn get_service_status(&self, name: &ServiceId) -> Result<ServiceHealthMetrics, MonitorError> {
        Ok(self.entry(name)?.state.lock().metrics.clone())
    }

    /// Metrics of every service plus the aggregated status.
    pub fn get_all_services_status(&self) -> MonitorSnapshot {
        let entries: Vec<Arc<ServiceEntry>> = self.services.read().values().cloned().collect();
        let mut services: Vec<ServiceHealthMetrics> = entries
            .iter()
            .map(|entry| entry.state.lock().metrics.clone())
            .collect();
        services.sort_by(|a, b| a.service.cmp(&b.service));

        MonitorSnapshot {
            overall: aggregate_status(services.iter().map(|m| &m.status)),
            services,
            monitoring: self.is_monitoring(),
            checked_at: Utc::now(),
        }
    }

    /// The last `limit` check records, most recent last.
    pub fn get_service_history(
        &self,
        name: &ServiceId,
        limit: usize,
    ) -> Result<Vec<HealthRecord>, MonitorError> {
        Ok(self.entry(name)?.state.lock().history.last_n(limit))
    }

    /// Check every registered service once, concurrently.
    pub async fn check_all(&self) {
        let names = self.registered_services();
        let results = join_all(names.iter().map(|name| self.check_service_health(name))).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                debug!("Skipped check of {}: {}", name, e);
            }
        }
    }

    /// Start the background poll loop. Returns false if it is already running.
    pub fn start_monitoring(self: &Arc<Self>) -> bool {
        let mut poll = self.poll.lock();
        if poll.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let monitor = Arc::downgrade(self);
        let interval = self.config.check_interval();
        let span = tracing::info_span!("health_poll", interval_secs = interval.as_secs());
        let handle = tokio::spawn(poll_loop(monitor, interval, cancel.clone()).instrument(span));

        info!("Health monitoring started (interval {:?})", interval);
        *poll = Some(PollLoop { cancel, handle });
        true
    }

    /// Signal the poll loop to stop and wait for it, bounded by the stop
    /// timeout. Returns false if it was not running.
    pub async fn stop_monitoring(&self) -> bool {
        let Some(poll) = self.poll.lock().take() else {
            return false;
        };
        poll.cancel.cancel();

        let timeout = self.config.stop_timeout();
        match tokio::time::timeout(timeout, poll.handle).await {
            Ok(Ok(())) => info!("Health monitoring stopped"),
            Ok(Err(e)) => error!("Health poll loop ended abnormally: {}", join_error_message(e)),
            Err(_) => warn!(
                "Health poll loop did not stop within {:?}, leaving it to finish its pass",
                timeout
            ),
        }
        true
    }

    /// Whether the poll loop is running.
    pub fn is_monitoring(&self) -> bool {
        self.poll
            .lock()
            .as_ref()
            .is_some_and(|p| !p.cancel.is_cancelled() && !p.handle.is_finished())
    }
}

impl Drop for ServiceHealthMonitor {
    fn drop(&mut self) {
        if let Some(poll) = self.poll.get_mut().take() {
            poll.cancel.cancel();
        }
    }
}

async fn poll_loop(
    monitor: Weak<ServiceHealthMonitor>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(monitor) = monitor.upgrade() else {
            break;
        };
        debug!("Running health checks");
        monitor.check_all().await;
    }

    debug!("Health poll loop exited");
}
