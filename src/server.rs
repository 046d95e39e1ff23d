//! HTTP read/admin surface over the monitor, recovery manager and dispatcher.
//!
//! ```text
//! GET  /health                          - Aggregated status
//! GET  /metrics                         - Prometheus metrics
//! GET  /services                        - Status of every service
//! GET  /services/{name}                 - Status of one service
//! GET  /services/{name}/history?limit=  - Recent checks
//! POST /services/{name}/check           - Check now
//! GET  /services/{name}/recovery        - Recovery status
//! POST /monitoring/start                - Start the poll loop
//! POST /monitoring/stop                 - Stop the poll loop
//! GET  /alerts                          - Active alerts
//! GET  /alerts/history?limit=           - Alert history
//! POST /alerts/{id}/acknowledge?by=     - Acknowledge an alert
//! POST /alerts/{id}/resolve?by=         - Resolve an alert
//! ```

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use vigil_monitor::{
    export_prometheus, Alert, AlertDispatchEngine, HealthRecord, HealthStatus, MonitorError,
    MonitorSnapshot, RecoveryStatus, ServiceHealthMetrics, ServiceHealthMonitor, ServiceId,
    ServiceRecoveryManager,
};

/// Shared handler state.
pub struct AppState {
    pub monitor: Arc<ServiceHealthMonitor>,
    pub recovery: Arc<ServiceRecoveryManager>,
    pub dispatcher: Arc<AlertDispatchEngine>,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        monitor: Arc<ServiceHealthMonitor>,
        recovery: Arc<ServiceRecoveryManager>,
        dispatcher: Arc<AlertDispatchEngine>,
    ) -> Self {
        Self {
            monitor,
            recovery,
            dispatcher,
            started_at: Instant::now(),
        }
    }
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(err: MonitorError) -> ApiError {
    let (status, code) = match &err {
        MonitorError::ServiceNotRegistered(_) => (StatusCode::NOT_FOUND, "service_not_found"),
        MonitorError::AlertNotFound(_) => (StatusCode::NOT_FOUND, "alert_not_found"),
        MonitorError::InvalidConfig(_) => (StatusCode::BAD_REQUEST, "invalid_config"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub monitoring: bool,
    pub services: usize,
    pub active_alerts: usize,
}

/// Prometheus metrics response (text format).
pub struct PrometheusMetrics(String);

impl IntoResponse for PrometheusMetrics {
    fn into_response(self) -> axum::response::Response {
        (
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            self.0,
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Deserialize)]
pub struct ActorQuery {
    #[serde(default = "default_actor")]
    pub by: String,
}

fn default_actor() -> String {
    "api".to_string()
}

#[derive(Debug, Serialize)]
pub struct MonitoringResponse {
    pub monitoring: bool,
    /// Whether this request changed the loop's state.
    pub changed: bool,
}

/// Build the router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let service_routes = Router::new()
        .route("/", get(list_services))
        .route("/{name}", get(get_service))
        .route("/{name}/history", get(service_history))
        .route("/{name}/check", post(check_service))
        .route("/{name}/recovery", get(recovery_status));

    let monitoring_routes = Router::new()
        .route("/start", post(start_monitoring))
        .route("/stop", post(stop_monitoring));

    let alert_routes = Router::new()
        .route("/", get(list_alerts))
        .route("/history", get(alert_history))
        .route("/{id}/acknowledge", post(acknowledge_alert))
        .route("/{id}/resolve", post(resolve_alert));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .nest("/services", service_routes)
        .nest("/monitoring", monitoring_routes)
        .nest("/alerts", alert_routes)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let snapshot = state.monitor.get_all_services_status();
    Json(HealthResponse {
        status: snapshot.overall,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        monitoring: snapshot.monitoring,
        services: snapshot.services.len(),
        active_alerts: state.dispatcher.active_alerts().len(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> PrometheusMetrics {
    let snapshot = state.monitor.get_all_services_status();
    PrometheusMetrics(export_prometheus(&snapshot.services))
}

async fn list_services(State(state): State<Arc<AppState>>) -> Json<MonitorSnapshot> {
    Json(state.monitor.get_all_services_status())
}

async fn get_service(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<ServiceHealthMetrics> {
    state
        .monitor
        .get_service_status(&ServiceId::new(name))
        .map(Json)
        .map_err(api_error)
}

async fn service_history(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<HealthRecord>> {
    state
        .monitor
        .get_service_history(&ServiceId::new(name), query.limit)
        .map(Json)
        .map_err(api_error)
}

async fn check_service(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<ServiceHealthMetrics> {
    let name = ServiceId::new(name);
    info!("On-demand health check of {}", name);
    state
        .monitor
        .check_service_health(&name)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn recovery_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<RecoveryStatus> {
    state
        .recovery
        .get_recovery_status(&ServiceId::new(name))
        .map(Json)
        .map_err(api_error)
}

async fn start_monitoring(State(state): State<Arc<AppState>>) -> Json<MonitoringResponse> {
    let changed = state.monitor.start_monitoring();
    Json(MonitoringResponse {
        monitoring: state.monitor.is_monitoring(),
        changed,
    })
}

async fn stop_monitoring(State(state): State<Arc<AppState>>) -> Json<MonitoringResponse> {
    let changed = state.monitor.stop_monitoring().await;
    Json(MonitoringResponse {
        monitoring: state.monitor.is_monitoring(),
        changed,
    })
}

async fn list_alerts(State(state): State<Arc<AppState>>) -> Json<Vec<Alert>> {
    Json(state.dispatcher.active_alerts())
}

async fn alert_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<Alert>> {
    Json(state.dispatcher.alert_history(query.limit))
}

async fn acknowledge_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(actor): Query<ActorQuery>,
) -> ApiResult<Alert> {
    state
        .dispatcher
        .acknowledge_alert(&id, &actor.by)
        .map(Json)
        .map_err(api_error)
}

async fn resolve_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(actor): Query<ActorQuery>,
) -> ApiResult<Alert> {
    state
        .dispatcher
        .resolve_alert(&id, &actor.by)
        .map(Json)
        .map_err(api_error)
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
