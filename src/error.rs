use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::admission::AdmissionDenied;
use crate::decision::DecisionError;
use crate::pipeline::PipelineError;
use crate::receiver::ReceiverError;
use crate::web::problem::Problem;

/// Application-wide error type
///
/// Every variant maps to a stable RFC 7807 problem. Handlers bubble these up
/// with `?`; the `IntoResponse` impl is the single place errors become HTTP.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Recording not found: {0}")]
    VodNotFound(String),

    #[error("Gone: {0}")]
    Gone(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Lease busy for {service_key}")]
    LeaseBusy { service_key: String },

    #[error("Admission denied: {}", .0.code)]
    Admission(AdmissionDenied),

    #[error(transparent)]
    Decision(#[from] DecisionError),

    #[error("Receiver error: {0}")]
    Receiver(#[from] ReceiverError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AppError {
    /// Build the canonical problem body for this error
    pub fn to_problem(&self) -> Problem {
        match self {
            Self::BadRequest(detail) => {
                Problem::new("request/bad", "Bad Request", 400, "R_BAD_REQUEST").detail(detail.as_str())
            }
            Self::NotFound(detail) => {
                Problem::new("request/not-found", "Not Found", 404, "R_NOT_FOUND").detail(detail.as_str())
            }
            Self::VodNotFound(detail) => {
                Problem::new("vod/not-found", "Recording Not Found", 404, "R_NOT_FOUND")
                    .detail(detail.as_str())
            }
            Self::Gone(detail) => Problem::new("lease/gone", "Gone", 410, "R_GONE").detail(detail.as_str()),
            Self::Forbidden(detail) => {
                Problem::new("auth/forbidden", "Forbidden", 403, "AUTH_FORBIDDEN").detail(detail.as_str())
            }
            Self::LeaseBusy { service_key } => {
                Problem::new("lease/busy", "Lease Busy", 409, "R_LEASE_BUSY")
                    .detail(format!("another worker owns {service_key}"))
                    .retry_after(2)
            }
            Self::Admission(denied) => denied.to_problem(),
            Self::Decision(err) => err.to_problem(),
            Self::Receiver(err) => Problem::new(
                "system/receiver",
                "Receiver Unavailable",
                503,
                err.reason_code(),
            )
            .detail(err.to_string())
            .retry_after(5),
            Self::Pipeline(err) => {
                Problem::new("system/pipeline", "Pipeline Error", 503, err.reason_code())
                    .detail(err.to_string())
            }
            Self::Invariant(detail) => Problem::new(
                "system/internal",
                "Invariant Violation",
                500,
                "R_INVARIANT_VIOLATION",
            )
            .detail(detail.as_str()),
            Self::Database(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Config(_)
            | Self::Internal(_) => {
                Problem::new("system/internal", "Internal Server Error", 500, "R_INTERNAL")
                    .detail(self.to_string())
            }
            Self::ServiceUnavailable(detail) => Problem::new(
                "system/unavailable",
                "Service Unavailable",
                503,
                "R_UNAVAILABLE",
            )
            .detail(detail.as_str())
            .retry_after(5),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let problem = self.to_problem();

        if problem.status >= 500 {
            tracing::error!(
                code = problem.code.as_str(),
                error_message = %self,
                "Request failed"
            );
        } else {
            tracing::debug!(
                code = problem.code.as_str(),
                error_message = %self,
                "Request rejected"
            );
        }

        problem.into_response()
    }
}

/// Result type alias for handlers and store operations
pub type Result<T> = std::result::Result<T, AppError>;
