//! HTTP error envelope.
//!
//! Owners raise [`TidepoolError`] kinds; this module maps them onto status
//! codes and the shared `{error, kind, details?}` body shape.

use crate::core::error::{ErrorKind, TidepoolError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, warn};

/// Wrapper giving every handler `Result<_, ApiError>` with `?` on owner
/// calls.
pub struct ApiError(pub TidepoolError);

impl From<TidepoolError> for ApiError {
    fn from(err: TidepoolError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::StateConflict | ErrorKind::Immutable | ErrorKind::AlreadyExists => {
            StatusCode::CONFLICT
        }
        ErrorKind::VerificationFailed => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::DependencyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        // A cancelled task surfaces through its record with a 200; reaching
        // this mapping means cancellation interrupted a synchronous call.
        ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::IntegrityError | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        match kind {
            ErrorKind::IntegrityError | ErrorKind::Internal => {
                error!(kind = kind.as_str(), error = %self.0, "request failed");
            }
            _ => {
                warn!(kind = kind.as_str(), error = %self.0, "request rejected");
            }
        }
        let body = json!({
            "error": self.0.to_string(),
            "kind": kind.as_str(),
        });
        (status, Json(body)).into_response()
    }
}
