//! Admin routes

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::coordinator::{Coordinator, CoordinatorError};
use crate::events::{EventRecorder, RecordedEvent};
use crate::master::{MasterError, MasterSnapshot, Organization};
use crate::observability::{FleetMetrics, MetricsSnapshot};
use crate::scheduler::BackendStatus;

// ==================
// Shared State
// ==================

/// State shared across handlers
#[derive(Clone)]
pub struct AdminState {
    pub coordinator: Arc<Coordinator>,
    pub metrics: Arc<FleetMetrics>,
    pub recorder: Arc<EventRecorder>,
}

// ==================
// Request/Response Types
// ==================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub masters: usize,
    pub connected: usize,
}

#[derive(Debug, Deserialize)]
pub struct CreateMasterRequest {
    pub organization: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MastersResponse {
    pub masters: Vec<MasterSnapshot>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangeResponse {
    pub organization: String,
    /// `false` when the request was already in effect
    pub changed: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct TerminateParams {
    #[serde(default)]
    pub forced: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
    pub connected_masters: usize,
    pub reconciliation_passes: u64,
    pub listener_failures: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: CoordinatorError) -> ApiError {
    let code = err.status_code();
    (
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(ErrorResponse {
            error: err.to_string(),
            code,
        }),
    )
}

fn organization(name: String) -> Result<Organization, ApiError> {
    Organization::new(name).map_err(|e: MasterError| api_error(e.into()))
}

// ==================
// Router
// ==================

/// Create the admin routes
pub fn admin_routes(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/masters", get(list_masters_handler).post(create_master_handler))
        .route("/masters/:organization", get(get_master_handler))
        .route("/masters/:organization/provision", post(provision_handler))
        .route("/masters/:organization/terminate", post(terminate_handler))
        .route("/backends", get(backends_handler))
        .route("/metrics", get(metrics_handler))
        .route("/events", get(events_handler))
        .with_state(state)
}

// ==================
// Handlers
// ==================

async fn health_handler(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        masters: state.coordinator.registry().len(),
        connected: state.coordinator.connected_masters(),
    })
}

async fn list_masters_handler(
    State(state): State<AdminState>,
) -> Result<Json<MastersResponse>, ApiError> {
    let masters = state.coordinator.masters().map_err(api_error)?;
    Ok(Json(MastersResponse {
        total: masters.len(),
        masters,
    }))
}

async fn create_master_handler(
    State(state): State<AdminState>,
    Json(request): Json<CreateMasterRequest>,
) -> Result<(StatusCode, Json<MasterSnapshot>), ApiError> {
    let organization = organization(request.organization)?;
    let snapshot = state
        .coordinator
        .create_master(organization)
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_master_handler(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<MasterSnapshot>, ApiError> {
    let organization = organization(name)?;
    state
        .coordinator
        .master(&organization)
        .map(Json)
        .map_err(api_error)
}

async fn provision_handler(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<ChangeResponse>), ApiError> {
    let organization = organization(name)?;
    let changed = state
        .coordinator
        .provision_master(&organization)
        .map_err(api_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ChangeResponse {
            organization: organization.to_string(),
            changed,
        }),
    ))
}

async fn terminate_handler(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Query(params): Query<TerminateParams>,
) -> Result<(StatusCode, Json<ChangeResponse>), ApiError> {
    let organization = organization(name)?;
    let changed = state
        .coordinator
        .terminate(&organization, params.forced)
        .map_err(api_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ChangeResponse {
            organization: organization.to_string(),
            changed,
        }),
    ))
}

async fn backends_handler(State(state): State<AdminState>) -> Json<Vec<BackendStatus>> {
    Json(state.coordinator.backend_status())
}

async fn metrics_handler(State(state): State<AdminState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        counters: state.metrics.snapshot(),
        connected_masters: state.coordinator.connected_masters(),
        reconciliation_passes: state.coordinator.provisioner().passes(),
        listener_failures: state.coordinator.events().failures(),
    })
}

async fn events_handler(
    State(state): State<AdminState>,
    Query(params): Query<EventsParams>,
) -> Json<Vec<RecordedEvent>> {
    let mut events = state.recorder.events();
    if let Some(limit) = params.limit {
        let skip = events.len().saturating_sub(limit);
        events.drain(..skip);
    }
    Json(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PooledBackend, ProvisioningBackend, SimulatedProvisioningService};
    use crate::coordinator::CoordinatorSettings;
    use crate::events::{EventListener, ListenerRegistry};
    use crate::observability::MetricsListener;
    use crate::protocol::{IdentityIssuer, TlsConfig};
    use crate::scheduler::{Cadence, SchedulerSettings};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> AdminState {
        let issuer = IdentityIssuer::generate("test-ca").unwrap();
        let org = Organization::new("coordinator").unwrap();
        let identity = issuer.issue_coordinator("coordinator.local", &org).unwrap();
        let tls = TlsConfig::builder()
            .ca_cert_pem(issuer.ca_cert_pem())
            .cert_pem(identity.cert_pem)
            .key_pem(identity.key_pem)
            .build()
            .unwrap();

        let metrics = Arc::new(FleetMetrics::new());
        let recorder = Arc::new(EventRecorder::default());
        let listeners: Vec<Arc<dyn EventListener>> = vec![
            Arc::new(MetricsListener::new(metrics.clone())),
            recorder.clone(),
        ];
        let events = Arc::new(ListenerRegistry::new(listeners));
        let service = Arc::new(SimulatedProvisioningService::new(Duration::ZERO));
        let mut settings = CoordinatorSettings::new(org);
        settings.scheduler = SchedulerSettings {
            cadence: Cadence::new(Duration::from_millis(10), Duration::from_millis(10)).unwrap(),
            ..SchedulerSettings::default()
        };
        let backends: Vec<Arc<dyn ProvisioningBackend>> =
            vec![Arc::new(PooledBackend::cloud("pool", 2, service))];
        let coordinator = Coordinator::start(
            settings,
            tls,
            backends,
            events,
            None,
        )
        .unwrap();

        AdminState {
            coordinator: Arc::new(coordinator),
            metrics,
            recorder,
        }
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let router = admin_routes(state());
        let (status, body) = call(&router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["masters"], 0);
    }

    #[tokio::test]
    async fn test_master_lifecycle_over_http() {
        let router = admin_routes(state());

        let (status, body) =
            call(&router, "POST", "/masters", Some(r#"{"organization":"org0"}"#)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["state"], "Created");

        let (status, _) =
            call(&router, "POST", "/masters", Some(r#"{"organization":"org0"}"#)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(&router, "POST", "/masters/org0/provision", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["changed"], true);

        let mut state = String::new();
        for _ in 0..200 {
            let (_, body) = call(&router, "GET", "/masters/org0", None).await;
            state = body["state"].as_str().unwrap_or_default().to_string();
            if state == "Provisioned" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, "Provisioned");

        let (status, _) = call(&router, "POST", "/masters/org0/terminate?forced=true", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (_, body) = call(&router, "GET", "/events?limit=2", None).await;
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let router = admin_routes(state());
        let (status, body) = call(&router, "GET", "/masters/nobody", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);

        let (status, _) = call(&router, "GET", "/masters/bad%20org", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_backends_and_metrics() {
        let router = admin_routes(state());
        let (status, body) = call(&router, "GET", "/backends", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "pool");
        assert_eq!(body[0]["capacity"], 2);

        call(&router, "POST", "/masters", Some(r#"{"organization":"org1"}"#)).await;
        let (status, body) = call(&router, "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["masters_created"], 1);
    }
}
