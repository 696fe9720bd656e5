use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Capture handle for a camera could not be opened
    #[error("Video source unavailable [{source_ref}]: {reason}")]
    SourceUnavailable { source_ref: String, reason: String },

    /// Offer could not be applied or answer could not be produced
    #[error("Negotiation failed: {0}")]
    NegotiationError(String),

    /// Answer not produced within the caller's deadline
    #[error("Negotiation timed out after {0} ms")]
    NegotiationTimeout(u64),

    /// Frame requested from a track that was already closed
    #[error("Track closed")]
    TrackClosed,

    /// Gateway pipeline rejected or failed the stream request
    #[error("Remote stream error [{gateway}]: {reason}")]
    RemoteStreamError { gateway: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Video error: {0}")]
    VideoError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AppError {
    pub fn source_unavailable(source_ref: impl Into<String>, reason: impl ToString) -> Self {
        Self::SourceUnavailable {
            source_ref: source_ref.into(),
            reason: reason.to_string(),
        }
    }

    pub fn remote(gateway: impl Into<String>, reason: impl ToString) -> Self {
        Self::RemoteStreamError {
            gateway: gateway.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable kind, used in logs and error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::SourceUnavailable { .. } => "source_unavailable",
            AppError::NegotiationError(_) => "negotiation_error",
            AppError::NegotiationTimeout(_) => "negotiation_timeout",
            AppError::TrackClosed => "track_closed",
            AppError::RemoteStreamError { .. } => "remote_stream_error",
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::Internal(_) => "internal",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serialization(_) => "serialization",
            AppError::VideoError(_) => "video",
            AppError::ServiceUnavailable(_) => "service_unavailable",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::NegotiationError(_) => StatusCode::BAD_REQUEST,
            AppError::SourceUnavailable { .. } | AppError::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::NegotiationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::RemoteStreamError { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body, shaped like a failed stream response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub kind: &'static str,
    pub error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            status: "error",
            kind: self.kind(),
            error: self.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error_kind = body.kind, error_message = %body.error, "Request failed");
        } else {
            tracing::warn!(error_kind = body.kind, error_message = %body.error, "Request rejected");
        }

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
