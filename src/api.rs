//! Uniform JSON error responses shared by the HTTP controllers and the
//! client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// An error as returned by the API. The code field always matches the HTTP
/// status code of the response carrying it.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct ApiError {
    /// The error message.
    pub message: String,
    /// The HTTP status code.
    pub code: u16,
}

impl ApiError {
    /// Create an error with an explicit status code.
    pub fn new(message: impl Into<String>, code: StatusCode) -> Self {
        Self {
            message: message.into(),
            code: code.as_u16(),
        }
    }

    /// A 400 response for invalid client input.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(message, StatusCode::BAD_REQUEST)
    }

    /// A 404 response for a missing resource.
    pub fn not_found() -> Self {
        Self::new("Not Found", StatusCode::NOT_FOUND)
    }

    /// A 500 response. The underlying error is logged before being returned
    /// to the caller.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        let message = err.to_string();
        tracing::error!(error = %message, "request failed");
        Self::new(message, StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code() {
        let err = ApiError::bad_request("invalid app name");
        assert_eq!(err.to_string(), "invalid app name (400)");
    }

    #[test]
    fn test_wire_format() {
        let err = ApiError::not_found();
        let encoded = serde_json::to_string(&err).expect("should encode");
        assert_eq!(encoded, r#"{"message":"Not Found","code":404}"#);

        let decoded: ApiError = serde_json::from_str(&encoded).expect("should decode");
        assert_eq!(decoded.code, 404);
        assert_eq!(decoded.message, "Not Found");
    }
}
