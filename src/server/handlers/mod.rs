pub mod health;
pub mod metrics;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::SiftError;

/// Wrapper that converts `SiftError` into an HTTP response.
///
/// Bulk errors render as 207 with every failed document listed under
/// `failures`, for handlers that index records on behalf of callers.
pub struct ApiError(pub SiftError);

impl From<SiftError> for ApiError {
    fn from(e: SiftError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let mut body = json!({
            "error": self.0.to_string(),
            "status": status,
            "retryable": self.0.is_retryable(),
        });
        if let SiftError::Bulk(bulk) = &self.0 {
            body["failures"] = json!(bulk.failures);
        }
        (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            axum::Json(body),
        )
            .into_response()
    }
}
