use std::io;

use thiserror::Error;

use crate::jobs::JobStatus;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidCoordinate(String),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("message broker unavailable")]
    BrokerUnavailable,
    #[error("job dispatch failed: {0}")]
    DispatchFailed(String),
    #[error("no address resolved for {lat}, {lng}")]
    AddressNotResolved { lat: f64, lng: f64 },
    #[error("geocoding provider error: {0}")]
    Provider(String),
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("key/value store error: {0}")]
    Store(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Config(String),
}

impl AppError {
    /// Broker-side failures that the resolution path absorbs by falling back
    /// to the direct resolver.
    pub fn is_queue_failure(&self) -> bool {
        matches!(
            self,
            AppError::BrokerUnavailable | AppError::DispatchFailed(_)
        )
    }
}
