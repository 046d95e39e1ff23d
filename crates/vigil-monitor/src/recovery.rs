//! Automated recovery with escalation and circuit breaking.
//!
//! Each service owns a priority-ordered list of strategies. An attempt runs
//! the strategies allowed by the current escalation level, stopping at the
//! first success. Failed attempts raise the level so the next attempt tries
//! more strategies; a success drops it back to zero.
//!
//! Attempts are guarded, in order, by a per-service in-flight flag, a
//! cooldown since the last attempt, and the service's circuit breaker.

#[cfg(test)]
#[path = "recovery_tests.rs"]
mod tests;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertSeverity};
use crate::circuit_breaker::{CircuitBreakerSnapshot, CircuitBreakerState};
use crate::config::RecoveryConfig;
use crate::dispatcher::AlertDispatchEngine;
use crate::error::{join_error_message, MonitorError};
use crate::history::BoundedHistory;
use crate::service::{HealthStatus, ServiceId};

/// Kind of automated repair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RestartConnection,
    ResetConnectionPool,
    ClearCache,
    Failover,
    RestartService,
    Custom(String),
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::RestartConnection => write!(f, "restart-connection"),
            StrategyKind::ResetConnectionPool => write!(f, "reset-connection-pool"),
            StrategyKind::ClearCache => write!(f, "clear-cache"),
            StrategyKind::Failover => write!(f, "failover"),
            StrategyKind::RestartService => write!(f, "restart-service"),
            StrategyKind::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// Result of running a recovery action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub message: String,
}

impl RecoveryOutcome {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// An automated repair step.
///
/// Actions report failure through the outcome; a panicking or hung action
/// is recorded as a failure by the manager.
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    async fn execute(&self) -> RecoveryOutcome;
}

/// Recovery action backed by an async closure.
pub struct FnAction<F> {
    f: F,
}

impl<F, Fut> FnAction<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = RecoveryOutcome> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> RecoveryAction for FnAction<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = RecoveryOutcome> + Send,
{
    async fn execute(&self) -> RecoveryOutcome {
        (self.f)().await
    }
}

/// A registered strategy with its win/loss counters.
pub struct RecoveryStrategyEntry {
    pub kind: StrategyKind,
    /// Lower runs first.
    pub priority: i32,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    id: u64,
    action: Arc<dyn RecoveryAction>,
}

/// Serializable strategy counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub kind: StrategyKind,
    pub priority: i32,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl From<&RecoveryStrategyEntry> for StrategyStats {
    fn from(entry: &RecoveryStrategyEntry) -> Self {
        Self {
            kind: entry.kind.clone(),
            priority: entry.priority,
            success_count: entry.success_count,
            failure_count: entry.failure_count,
            last_used: entry.last_used,
        }
    }
}

/// One strategy execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub service: ServiceId,
    pub strategy: StrategyKind,
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub escalation_level: u32,
    pub attempted_at: DateTime<Utc>,
}

/// Read-only recovery view for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStatus {
    pub service: ServiceId,
    pub escalation_level: u32,
    pub max_escalation_level: u32,
    pub in_progress: bool,
    /// Seconds until the cooldown admits another attempt.
    pub cooldown_remaining_secs: Option<u64>,
    pub circuit_breaker: Option<CircuitBreakerSnapshot>,
    pub strategies: Vec<StrategyStats>,
    pub recent_attempts: Vec<RecoveryAttempt>,
}

struct RecoveryState {
    strategies: Vec<RecoveryStrategyEntry>,
    next_strategy_id: u64,
    breaker: Option<CircuitBreakerState>,
    escalation_level: u32,
    last_attempt: Option<Instant>,
    attempts: BoundedHistory<RecoveryAttempt>,
}

struct ServiceRecovery {
    in_flight: AtomicBool,
    state: Mutex<RecoveryState>,
}

/// Clears the in-flight flag however the attempt ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Settles an attempt that is dropped before it records its result: the
/// running action is aborted and the breaker sees a failure.
struct AttemptGuard<'a> {
    service: &'a ServiceId,
    entry: &'a ServiceRecovery,
    running: Option<AbortHandle>,
    settled: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(running) = self.running.take() {
            running.abort();
        }
        warn!("Recovery attempt for {} cancelled, counting it as failed", self.service);
        if let Some(breaker) = self.entry.state.lock().breaker.as_mut() {
            breaker.record_failure(Instant::now());
        }
    }
}

/// Recovery manager.
pub struct ServiceRecoveryManager {
    config: RecoveryConfig,
    services: RwLock<HashMap<ServiceId, Arc<ServiceRecovery>>>,
    dispatcher: Option<Arc<AlertDispatchEngine>>,
}

impl ServiceRecoveryManager {
    /// Create a manager that does not raise alerts.
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            services: RwLock::new(HashMap::new()),
            dispatcher: None,
        }
    }

    /// Raise recovery and escalation alerts through `dispatcher`.
    pub fn with_dispatcher(mut self, dispatcher: Arc<AlertDispatchEngine>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Make a service recovery-enabled. Idempotent.
    pub fn register_service(&self, service: &ServiceId) {
        self.ensure_service(service);
    }

    fn ensure_service(&self, service: &ServiceId) -> Arc<ServiceRecovery> {
        if let Some(entry) = self.services.read().get(service) {
            return entry.clone();
        }

        let mut services = self.services.write();
        services
            .entry(service.clone())
            .or_insert_with(|| {
                debug!("Recovery enabled for service {}", service);
                let breaker = self.config.auto_circuit_breaker.then(|| {
                    let cb = &self.config.circuit_breaker;
                    CircuitBreakerState::new(
                        cb.failure_threshold,
                        cb.recovery_timeout(),
                        cb.half_open_max_calls,
                    )
                });
                Arc::new(ServiceRecovery {
                    in_flight: AtomicBool::new(false),
                    state: Mutex::new(RecoveryState {
                        strategies: Vec::new(),
                        next_strategy_id: 0,
                        breaker,
                        escalation_level: 0,
                        last_attempt: None,
                        attempts: BoundedHistory::new(self.config.attempt_history_capacity),
                    }),
                })
            })
            .clone()
    }

    fn entry(&self, service: &ServiceId) -> Result<Arc<ServiceRecovery>, MonitorError> {
        self.services
            .read()
            .get(service)
            .cloned()
            .ok_or_else(|| MonitorError::ServiceNotRegistered(service.clone()))
    }

    /// Add a strategy. The list stays sorted by priority; ties keep
    /// registration order.
    pub fn register_strategy(
        &self,
        service: &ServiceId,
        kind: StrategyKind,
        action: Arc<dyn RecoveryAction>,
        priority: i32,
    ) {
        let entry = self.ensure_service(service);
        let mut state = entry.state.lock();
        info!(
            "Registered recovery strategy {} for {} (priority {})",
            kind, service, priority
        );
        let id = state.next_strategy_id;
        state.next_strategy_id += 1;
        state.strategies.push(RecoveryStrategyEntry {
            kind,
            priority,
            success_count: 0,
            failure_count: 0,
            last_used: None,
            id,
            action,
        });
        state.strategies.sort_by_key(|s| s.priority);
    }

    /// Install (or replace) the service's circuit breaker, starting Closed.
    pub fn init_circuit_breaker(
        &self,
        service: &ServiceId,
        failure_threshold: u32,
        recovery_timeout: Duration,
        half_open_max_calls: u32,
    ) {
        let entry = self.ensure_service(service);
        entry.state.lock().breaker = Some(CircuitBreakerState::new(
            failure_threshold,
            recovery_timeout,
            half_open_max_calls,
        ));
    }

    /// Drop the service's strategies, breaker and history. Returns whether it
    /// was registered. An attempt already running finishes on its own.
    pub fn unregister_service(&self, service: &ServiceId) -> bool {
        let removed = self.services.write().remove(service).is_some();
        if removed {
            info!("Recovery disabled for service {}", service);
        }
        removed
    }

    /// Force the service's breaker back to Closed.
    pub fn reset_circuit_breaker(&self, service: &ServiceId) -> Result<(), MonitorError> {
        let entry = self.entry(service)?;
        if let Some(breaker) = entry.state.lock().breaker.as_mut() {
            breaker.reset();
            info!("Circuit breaker for {} reset", service);
        }
        Ok(())
    }

    /// Current escalation level.
    pub fn escalation_level(&self, service: &ServiceId) -> Result<u32, MonitorError> {
        Ok(self.entry(service)?.state.lock().escalation_level)
    }

    /// Try to recover a service.
    ///
    /// Returns `Ok(false)` without side effects when another attempt for the
    /// same service is in flight, the cooldown has not elapsed, or the
    /// circuit breaker denies the attempt. Otherwise runs the strategies
    /// allowed by the escalation level and returns whether one succeeded.
    pub async fn attempt_recovery(
        &self,
        service: &ServiceId,
        current_status: HealthStatus,
    ) -> Result<bool, MonitorError> {
        let entry = self.entry(service)?;

        if entry
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Recovery for {} already in progress", service);
            return Ok(false);
        }
        let _in_flight = InFlightGuard(&entry.in_flight);

        let (level, plan) = {
            let mut state = entry.state.lock();
            let now = Instant::now();

            if let Some(last) = state.last_attempt {
                if now.saturating_duration_since(last) < self.config.cooldown() {
                    debug!("Recovery for {} cooling down", service);
                    return Ok(false);
                }
            }

            if let Some(breaker) = state.breaker.as_mut() {
                if !breaker.try_acquire(now) {
                    warn!("Circuit breaker for {} is open, skipping recovery", service);
                    return Ok(false);
                }
            }

            state.last_attempt = Some(now);
            let level = state.escalation_level;
            let plan: Vec<(u64, StrategyKind, Arc<dyn RecoveryAction>)> = state
                .strategies
                .iter()
                .take(level as usize + 1)
                .map(|s| (s.id, s.kind.clone(), s.action.clone()))
                .collect();
            (level, plan)
        };

        info!(
            "Attempting recovery for {} (status: {}, escalation level {}, {} strategies)",
            service,
            current_status,
            level,
            plan.len()
        );

        let mut guard = AttemptGuard {
            service,
            entry: &entry,
            running: None,
            settled: false,
        };

        let mut executed = Vec::with_capacity(plan.len());
        let mut winner = None;
        for (strategy_id, kind, action) in plan {
            let attempted_at = Utc::now();
            let started = Instant::now();
            let outcome = self.run_action(action, &mut guard).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            if outcome.success {
                info!("Recovery strategy {} succeeded for {}: {}", kind, service, outcome.message);
            } else {
                warn!("Recovery strategy {} failed for {}: {}", kind, service, outcome.message);
            }

            let success = outcome.success;
            executed.push((
                strategy_id,
                RecoveryAttempt {
                    service: service.clone(),
                    strategy: kind.clone(),
                    success,
                    error: (!success).then(|| outcome.message.clone()),
                    message: outcome.message,
                    duration_ms,
                    escalation_level: level,
                    attempted_at,
                },
            ));

            if success {
                winner = Some(kind);
                break;
            }
        }

        let new_level = {
            let mut state = entry.state.lock();
            let state = &mut *state;
            let now = Instant::now();

            for (strategy_id, attempt) in executed.iter() {
                if let Some(strategy) = state.strategies.iter_mut().find(|s| s.id == *strategy_id) {
                    if attempt.success {
                        strategy.success_count += 1;
                    } else {
                        strategy.failure_count += 1;
                    }
                    strategy.last_used = Some(attempt.attempted_at);
                }
                state.attempts.push(attempt.clone());
            }

            if winner.is_some() {
                state.escalation_level = 0;
                if let Some(breaker) = state.breaker.as_mut() {
                    breaker.record_success(now);
                }
            } else {
                state.escalation_level =
                    (state.escalation_level + 1).min(self.config.max_escalation_level);
                if let Some(breaker) = state.breaker.as_mut() {
                    breaker.record_failure(now);
                }
            }
            state.escalation_level
        };
        guard.settled = true;

        match winner {
            Some(kind) => {
                info!("Service {} recovered using {}", service, kind);
                self.notify(
                    Alert::new(
                        "recovery_succeeded",
                        AlertSeverity::Low,
                        format!("Service {} recovered using {}", service, kind),
                    )
                    .with_source("recovery_manager")
                    .with_label("service", service.as_str())
                    .with_label("strategy", kind.to_string()),
                )
                .await;
                Ok(true)
            }
            None => {
                let at_max = new_level >= self.config.max_escalation_level;
                let severity = if at_max {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::High
                };
                error!(
                    "Recovery failed for {} after {} strategies, escalation level now {}",
                    service,
                    executed.len(),
                    new_level
                );

                let mut alert = Alert::new(
                    "recovery_escalated",
                    severity,
                    format!(
                        "Recovery failed for {}, escalation level {}",
                        service, new_level
                    ),
                )
                .with_description(format!(
                    "{} of {} strategies tried while {}",
                    executed.len(),
                    level + 1,
                    current_status
                ))
                .with_source("recovery_manager")
                .with_label("service", service.as_str())
                .with_annotation("escalation_level", new_level.to_string());
                if at_max {
                    alert = alert.with_annotation("requires_manual_intervention", "true");
                }
                self.notify(alert).await;
                Ok(false)
            }
        }
    }

    async fn run_action(
        &self,
        action: Arc<dyn RecoveryAction>,
        guard: &mut AttemptGuard<'_>,
    ) -> RecoveryOutcome {
        let timeout = self.config.action_timeout();
        let handle = tokio::spawn(async move { action.execute().await });
        let abort = handle.abort_handle();
        guard.running = Some(handle.abort_handle());

        let outcome = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => RecoveryOutcome::failed(join_error_message(e)),
            Err(_) => {
                abort.abort();
                RecoveryOutcome::failed(format!("timed out after {:?}", timeout))
            }
        };
        guard.running = None;
        outcome
    }

    async fn notify(&self, alert: Alert) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.fire_alert(alert).await;
        }
    }

    /// Snapshot of the service's recovery state.
    pub fn get_recovery_status(&self, service: &ServiceId) -> Result<RecoveryStatus, MonitorError> {
        let entry = self.entry(service)?;
        let state = entry.state.lock();
        let now = Instant::now();
        let cooldown = self.config.cooldown();

        Ok(RecoveryStatus {
            service: service.clone(),
            escalation_level: state.escalation_level,
            max_escalation_level: self.config.max_escalation_level,
            in_progress: entry.in_flight.load(Ordering::SeqCst),
            cooldown_remaining_secs: state
                .last_attempt
                .map(|t| cooldown.saturating_sub(now.saturating_duration_since(t)))
                .filter(|d| !d.is_zero())
                .map(|d| d.as_secs()),
            circuit_breaker: state.breaker.as_ref().map(|b| b.snapshot(now)),
            strategies: state.strategies.iter().map(StrategyStats::from).collect(),
            recent_attempts: state.attempts.last_n(self.config.status_attempt_limit),
        })
    }

    /// Services with recovery enabled.
    pub fn services(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.services.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
