//! Health probe contract.

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProbeError;

/// Probe verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Healthy,
    Unhealthy,
}

/// Result reported by a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub status: ProbeStatus,
    /// Response time measured by the probe itself, if it measures one.
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

impl ProbeResult {
    /// Healthy result.
    pub fn healthy() -> Self {
        Self {
            status: ProbeStatus::Healthy,
            response_time_ms: None,
            error: None,
        }
    }

    /// Unhealthy result with a reason.
    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Unhealthy,
            response_time_ms: None,
            error: Some(error.into()),
        }
    }

    /// Attach a measured response time.
    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    /// Whether the probe reported healthy.
    pub fn is_healthy(&self) -> bool {
        self.status == ProbeStatus::Healthy
    }
}

/// One health check for one dependency.
///
/// Implementations must enforce their own timeout and report failure
/// instead of blocking. Errors are recorded as failed checks.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Perform the check.
    async fn check(&self) -> Result<ProbeResult, ProbeError>;
}

/// Probe backed by an async closure.
pub struct FnProbe<F> {
    f: F,
}

impl<F, Fut> FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProbeResult, ProbeError>> + Send,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProbeResult, ProbeError>> + Send,
{
    async fn check(&self) -> Result<ProbeResult, ProbeError> {
        (self.f)().await
    }
}
