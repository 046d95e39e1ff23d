//! Network probes and HTTP recovery hooks built from configuration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use vigil_monitor::{HealthProbe, ProbeError, ProbeResult, RecoveryAction, RecoveryOutcome};

use crate::config::{HookMethod, ProbeConfig, RecoveryHookConfig};

/// Healthy when a TCP connection to `address` opens within the timeout.
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self) -> Result<ProbeResult, ProbeError> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_stream)) => {
                Ok(ProbeResult::healthy().with_response_time(started.elapsed().as_millis() as u64))
            }
            Ok(Err(e)) => Ok(ProbeResult::unhealthy(format!("connect to {} failed: {}", self.address, e))
                .with_response_time(started.elapsed().as_millis() as u64)),
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }
}

/// Healthy when a GET to `url` answers with the expected status
/// (any 2xx when none is configured).
pub struct HttpProbe {
    url: String,
    expected_status: Option<u16>,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration, expected_status: Option<u16>) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Failed(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            expected_status,
            client,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self) -> Result<ProbeResult, ProbeError> {
        let started = Instant::now();
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Failed(format!("GET {} timed out", self.url))
            } else {
                ProbeError::Failed(format!("GET {} failed: {}", self.url, e))
            }
        })?;
        let elapsed = started.elapsed().as_millis() as u64;

        let status = response.status();
        let healthy = match self.expected_status {
            Some(expected) => status.as_u16() == expected,
            None => status.is_success(),
        };
        debug!("GET {} answered {} in {}ms", self.url, status, elapsed);

        if healthy {
            Ok(ProbeResult::healthy().with_response_time(elapsed))
        } else {
            Ok(ProbeResult::unhealthy(format!("GET {} returned {}", self.url, status)).with_response_time(elapsed))
        }
    }
}

/// Recovery action that calls an HTTP endpoint and succeeds on a 2xx answer.
pub struct HttpHookAction {
    url: String,
    method: HookMethod,
    client: reqwest::Client,
}

impl HttpHookAction {
    pub fn new(url: impl Into<String>, method: HookMethod, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            method,
            client,
        })
    }
}

#[async_trait]
impl RecoveryAction for HttpHookAction {
    async fn execute(&self) -> RecoveryOutcome {
        let request = match self.method {
            HookMethod::Get => self.client.get(&self.url),
            HookMethod::Post => self.client.post(&self.url),
            HookMethod::Put => self.client.put(&self.url),
        };

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                RecoveryOutcome::succeeded(format!("{} answered {}", self.url, response.status()))
            }
            Ok(response) => {
                RecoveryOutcome::failed(format!("{} answered {}", self.url, response.status()))
            }
            Err(e) => RecoveryOutcome::failed(format!("{} unreachable: {}", self.url, e)),
        }
    }
}

/// Build the probe described by `config`.
pub fn build_probe(config: &ProbeConfig) -> Result<Arc<dyn HealthProbe>, ProbeError> {
    let probe: Arc<dyn HealthProbe> = match config {
        ProbeConfig::Tcp { address, timeout_secs } => {
            Arc::new(TcpProbe::new(address.clone(), Duration::from_secs(*timeout_secs)))
        }
        ProbeConfig::Http {
            url,
            timeout_secs,
            expected_status,
        } => Arc::new(HttpProbe::new(
            url.clone(),
            Duration::from_secs(*timeout_secs),
            *expected_status,
        )?),
    };
    Ok(probe)
}

/// Build the recovery action described by `config`.
pub fn build_action(config: &RecoveryHookConfig) -> Result<Arc<dyn RecoveryAction>, reqwest::Error> {
    Ok(Arc::new(HttpHookAction::new(
        config.url.clone(),
        config.method,
        Duration::from_secs(config.timeout_secs),
    )?))
}
