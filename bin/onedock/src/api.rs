//! Management API
//!
//! Thin translation layer from HTTP to orchestrator calls; no business
//! logic lives here.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use onedock_core::{OrchestratorError, ServiceOrchestrator};
use onedock_proxy::{FleetStats, ProxyError};
use onedock_runtime::RuntimeError;
use onedock_spec::{Service, ServiceSpec, ServiceStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            ApiError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match &err {
            OrchestratorError::Validation(_) => ApiError::Validation(err.to_string()),
            OrchestratorError::Runtime(RuntimeError::ServiceNotFound { .. }) => {
                ApiError::NotFound(err.to_string())
            }
            OrchestratorError::Proxy(ProxyError::NoBackends { .. }) => {
                ApiError::ServiceUnavailable(err.to_string())
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

/// Scale request body
#[derive(Debug, Serialize, Deserialize)]
pub struct ScaleRequest {
    /// Target replica count
    pub replicas: u32,
}

/// Build the management router
pub fn router(orchestrator: Arc<ServiceOrchestrator>) -> Router {
    Router::new()
        .route(
            "/api/v1/services",
            post(deploy_or_update).get(list_services),
        )
        .route(
            "/api/v1/services/{name}",
            get(get_service).delete(delete_service),
        )
        .route("/api/v1/services/{name}/status", get(service_status))
        .route("/api/v1/services/{name}/scale", post(scale_service))
        .route("/api/v1/proxy/stats", get(proxy_stats))
        .with_state(orchestrator)
}

async fn deploy_or_update(
    State(orchestrator): State<Arc<ServiceOrchestrator>>,
    Json(spec): Json<ServiceSpec>,
) -> Result<Json<Service>> {
    let service = orchestrator.deploy_or_update(spec).await?;
    Ok(Json(service))
}

async fn list_services(
    State(orchestrator): State<Arc<ServiceOrchestrator>>,
) -> Result<Json<Vec<Service>>> {
    Ok(Json(orchestrator.list().await?))
}

async fn get_service(
    State(orchestrator): State<Arc<ServiceOrchestrator>>,
    Path(name): Path<String>,
) -> Result<Json<Service>> {
    orchestrator
        .get(&name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("service '{}' not found", name)))
}

async fn service_status(
    State(orchestrator): State<Arc<ServiceOrchestrator>>,
    Path(name): Path<String>,
) -> Result<Json<ServiceStatus>> {
    Ok(Json(orchestrator.status(&name).await?))
}

async fn scale_service(
    State(orchestrator): State<Arc<ServiceOrchestrator>>,
    Path(name): Path<String>,
    Json(request): Json<ScaleRequest>,
) -> Result<Json<serde_json::Value>> {
    orchestrator.scale(&name, request.replicas).await?;
    Ok(Json(serde_json::json!({
        "service": name,
        "replicas": request.replicas,
    })))
}

async fn delete_service(
    State(orchestrator): State<Arc<ServiceOrchestrator>>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    orchestrator.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn proxy_stats(
    State(orchestrator): State<Arc<ServiceOrchestrator>>,
) -> Result<Json<FleetStats>> {
    Ok(Json(orchestrator.proxy_stats().await))
}
