//! HTTP surface: reverse geocoding, job status polling and health.

use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::PublicAppConfig;
use crate::coords::Coordinate;
use crate::errors::AppError;
use crate::jobs::GeocodeJob;
use crate::AppState;

/// Error responder; the body is `{error, message?}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    message: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: None,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    fn from_resolution(err: AppError) -> Self {
        match err {
            AppError::InvalidCoordinate(reason) => Self::new(StatusCode::BAD_REQUEST, reason),
            AppError::AddressNotResolved { .. } => Self::new(
                StatusCode::NOT_FOUND,
                "Address not found for these coordinates",
            ),
            other => {
                error!(target: "api", err = ?other, "error getting address from coordinates");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to get address from coordinates",
                )
                .with_message(other.to_string())
            }
        }
    }

    fn from_query_rejection(rejection: QueryRejection) -> Self {
        debug!(target: "api", reason = %rejection.body_text(), "rejected query string");
        Self::new(StatusCode::BAD_REQUEST, "Invalid query string")
            .with_message(rejection.body_text())
    }

    fn from_status_lookup(err: AppError) -> Self {
        match err {
            AppError::JobNotFound(_) => Self::new(StatusCode::NOT_FOUND, "Job not found"),
            other => {
                error!(target: "api", err = ?other, "error getting geocoding status");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to get geocoding status",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.error,
            message: self.message.as_deref(),
        };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct ReverseQuery {
    lat: Option<String>,
    lng: Option<String>,
    queue: Option<String>,
}

impl ReverseQuery {
    fn use_queue(&self) -> bool {
        self.queue.as_deref().map(str::trim) != Some("false")
    }
}

#[derive(Debug, Serialize)]
pub struct ReverseAddressResponse {
    success: bool,
    address: String,
    lat: f64,
    lng: f64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    cached: bool,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    success: bool,
    #[serde(flatten)]
    job: GeocodeJob,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    broker: &'static str,
    broker_available: bool,
    config: PublicAppConfig,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/geocoding/reverse-address", get(reverse_address))
        .route("/geocoding/status", get(missing_job_id))
        .route("/geocoding/status/", get(missing_job_id))
        .route("/geocoding/status/{job_id}", get(job_status))
        .with_state(state)
}

async fn reverse_address(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ReverseQuery>, QueryRejection>,
) -> ApiResult<ReverseAddressResponse> {
    let Query(query) = query.map_err(ApiError::from_query_rejection)?;
    let coordinate = Coordinate::parse(query.lat.as_deref(), query.lng.as_deref())
        .map_err(ApiError::from_resolution)?;
    let resolution = state
        .orchestrator()
        .resolve(coordinate.lat, coordinate.lng, query.use_queue())
        .await
        .map_err(ApiError::from_resolution)?;
    Ok(Json(ReverseAddressResponse {
        success: true,
        address: resolution.address,
        lat: resolution.lat,
        lng: resolution.lng,
        cached: resolution.cached,
    }))
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<JobStatusResponse> {
    let job_id = job_id.trim();
    if job_id.is_empty() {
        return Err(missing_job_id().await);
    }
    let job = state
        .jobs()
        .require(job_id)
        .map_err(ApiError::from_status_lookup)?;
    if job.status.is_active() {
        debug!(target: "api", job_id, status = %job.status, "status check");
    }
    Ok(Json(JobStatusResponse { success: true, job }))
}

async fn missing_job_id() -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "Job ID is required")
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let probe = state.orchestrator().probe();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        broker: probe.broker_name(),
        broker_available: probe.is_available().await,
        config: state.config().public_profile(),
    })
}
