//! Per-service health counters and the status state machine.
//!
//! Nothing here performs I/O; the monitor feeds [`CheckResult`]s in and
//! reads the resulting status back out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::service::{HealthStatus, ServiceId, ServiceType};

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;

/// Default number of consecutive failures before a service is Unhealthy.
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

/// Outcome of one health check, as fed into the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Whether the dependency answered healthy.
    pub success: bool,
    /// Observed or reported response time.
    pub response_time_ms: u64,
    /// Failure reason.
    pub error: Option<String>,
    /// When the check finished.
    pub checked_at: DateTime<Utc>,
}

impl CheckResult {
    /// A successful check.
    pub fn success(response_time_ms: u64) -> Self {
        Self {
            success: true,
            response_time_ms,
            error: None,
            checked_at: Utc::now(),
        }
    }

    /// A failed check.
    pub fn failure(response_time_ms: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            response_time_ms,
            error: Some(error.into()),
            checked_at: Utc::now(),
        }
    }
}

/// Health metrics for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealthMetrics {
    pub service: ServiceId,
    pub service_type: ServiceType,
    pub status: HealthStatus,
    /// Response time of the last check in milliseconds.
    pub response_time_ms: u64,
    /// Failed checks as a percentage of all checks (0-100).
    pub error_rate: f64,
    /// Successful checks as a percentage of all checks (0-100).
    pub uptime_percentage: f64,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_checks: u64,
    pub total_failures: u64,
    pub error_message: Option<String>,
    /// Recovery attempts requested for this service.
    pub recovery_attempts: u32,
    pub last_recovery_attempt: Option<DateTime<Utc>>,
}

impl ServiceHealthMetrics {
    /// Fresh metrics: status Unknown, uptime 100, all counters zero.
    pub fn new(service: ServiceId, service_type: ServiceType) -> Self {
        Self {
            service,
            service_type,
            status: HealthStatus::Unknown,
            response_time_ms: 0,
            error_rate: 0.0,
            uptime_percentage: 100.0,
            last_check: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_checks: 0,
            total_failures: 0,
            error_message: None,
            recovery_attempts: 0,
            last_recovery_attempt: None,
        }
    }

    /// Apply one check result and return the status it replaced.
    ///
    /// `unhealthy_threshold` is the number of consecutive failures at which
    /// the service becomes Unhealthy; fewer failures leave it Degraded.
    pub fn record(&mut self, result: &CheckResult, unhealthy_threshold: u32) -> HealthStatus {
        let previous = self.status;
        self.total_checks += 1;
        self.response_time_ms = result.response_time_ms;
        self.last_check = Some(result.checked_at);

        if result.success {
            let was_failing = self.consecutive_failures > 0;
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;
            self.error_message = None;
            self.status = if was_failing {
                HealthStatus::Recovering
            } else {
                HealthStatus::Healthy
            };
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;
            self.total_failures += 1;
            self.error_message = result.error.clone();
            self.status = if self.consecutive_failures >= unhealthy_threshold.max(1) {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Degraded
            };
        }

        self.error_rate = percentage(self.total_failures, self.total_checks);
        self.uptime_percentage = self.computed_uptime();
        previous
    }

    /// Note that recovery was requested for this service.
    pub fn record_recovery_request(&mut self, at: DateTime<Utc>) {
        self.recovery_attempts += 1;
        self.last_recovery_attempt = Some(at);
    }

    /// Uptime derived from the counters; 100 before the first check.
    pub fn computed_uptime(&self) -> f64 {
        if self.total_checks == 0 {
            return 100.0;
        }
        percentage(self.total_checks - self.total_failures, self.total_checks)
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

/// Render metrics in Prometheus text exposition format.
pub fn export_prometheus<'a>(metrics: impl IntoIterator<Item = &'a ServiceHealthMetrics>) -> String {
    let metrics: Vec<&ServiceHealthMetrics> = metrics.into_iter().collect();
    let mut output = String::new();

    let families: [(&str, &str, &str, fn(&ServiceHealthMetrics) -> String); 6] = [
        ("vigil_service_up", "gauge", "1 if the last check succeeded", |m| {
            u8::from(m.consecutive_failures == 0 && m.total_checks > 0).to_string()
        }),
        ("vigil_service_response_time_ms", "gauge", "Response time of the last check", |m| {
            m.response_time_ms.to_string()
        }),
        ("vigil_service_uptime_percent", "gauge", "Successful checks percentage", |m| {
            format!("{:.2}", m.uptime_percentage)
        }),
        ("vigil_service_checks_total", "counter", "Health checks performed", |m| {
            m.total_checks.to_string()
        }),
        ("vigil_service_failures_total", "counter", "Failed health checks", |m| {
            m.total_failures.to_string()
        }),
        ("vigil_service_recovery_attempts_total", "counter", "Recovery attempts requested", |m| {
            m.recovery_attempts.to_string()
        }),
    ];

    for (name, kind, help, value) in families {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} {}\n", name, kind));
        for m in &metrics {
            output.push_str(&format!(
                "{}{{service=\"{}\",type=\"{}\"}} {}\n",
                name,
                m.service,
                m.service_type,
                value(m)
            ));
        }
    }

    output
}
