//! # Vigil Monitor
//!
//! Dependency health monitoring with automated recovery and alerting.
//!
//! ## Features
//!
//! - Probe polling with a per-service health state machine
//! - Priority-ordered recovery strategies with escalation and circuit breaking
//! - Alert rules, suppression and severity-based channel routing
//! - Prometheus text export of service metrics

pub mod alert_channels;
pub mod alerts;
pub mod circuit_breaker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod metrics;
pub mod monitor;
pub mod probe;
pub mod recovery;
pub mod service;

pub use alert_channels::WebhookChannel;
pub use alerts::{
    Alert, AlertSeverity, AlertStatus, ChannelFilter, LogChannel, NotificationChannel,
};
pub use circuit_breaker::{BreakerState, CircuitBreakerSnapshot, CircuitBreakerState};
pub use config::{
    AlertsConfig, CircuitBreakerConfig, ConfigLoader, MonitorConfig, RecoveryConfig,
    WebhookConfig,
};
pub use dispatcher::{AlertDispatchEngine, AlertRule, DispatchReport, SuppressionRule};
pub use error::{MonitorError, ProbeError};
pub use history::BoundedHistory;
pub use metrics::{export_prometheus, CheckResult, ServiceHealthMetrics};
pub use monitor::{HealthRecord, MonitorSnapshot, ServiceHealthMonitor};
pub use probe::{FnProbe, HealthProbe, ProbeResult, ProbeStatus};
pub use recovery::{
    FnAction, RecoveryAction, RecoveryAttempt, RecoveryOutcome, RecoveryStatus,
    ServiceRecoveryManager, StrategyKind, StrategyStats,
};
pub use service::{aggregate_status, HealthStatus, ServiceId, ServiceType};
