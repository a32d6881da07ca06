//! # Error Handling
//!
//! HTTP-facing error type. Domain modules return their own `thiserror`
//! enums; handlers convert them into [`AppError`] with `?`.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "too_many_requests",
//!     "message": "request limit reached (10 per 3600s), retry in 1200s",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

use crate::pipeline::SubmitError;

#[derive(Debug)]
pub enum AppError {
    /// Server-side failures (500)
    Internal(String),

    /// Malformed request (400)
    BadRequest(String),

    /// Unknown task, preset or file (404)
    NotFound(String),

    /// Configuration problems (500)
    ConfigError(String),

    /// Upload failed validation: size, duration, decodability (400)
    ValidationError(String),

    /// Per-user admission limit hit (429)
    TooManyRequests(String),

    /// Queue full or worker not running (503)
    ServiceUnavailable(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.as_str()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.as_str()),
            AppError::TooManyRequests(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, "too_many_requests", msg.as_str())
            }
            AppError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg.as_str())
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::TooManyRequests(msg) => write!(f, "Too many requests: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Validation failures are the client's fault, capacity failures are not.
impl From<SubmitError> for AppError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Empty
            | SubmitError::TooLarge { .. }
            | SubmitError::TooShort { .. }
            | SubmitError::TooLong { .. }
            | SubmitError::Unreadable => AppError::ValidationError(err.to_string()),
            SubmitError::RateLimited(rejection) => AppError::TooManyRequests(rejection.to_string()),
            SubmitError::QueueFull => AppError::ServiceUnavailable(err.to_string()),
            SubmitError::Io(e) => AppError::Internal(format!("Failed to stage upload: {}", e)),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitRejection;
    use actix_web::body::to_bytes;

    #[test]
    fn test_submit_errors_map_to_statuses() {
        let cases = [
            (SubmitError::TooShort { duration: 2.0, min: 5.0 }, StatusCode::BAD_REQUEST),
            (SubmitError::Unreadable, StatusCode::BAD_REQUEST),
            (
                SubmitError::RateLimited(RateLimitRejection::TooManyConcurrent { active: 2, limit: 2 }),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (SubmitError::QueueFull, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status_code(), status);
        }
    }

    #[actix_web::test]
    async fn test_error_body_shape() {
        let response = AppError::NotFound("task abc".into()).error_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "not_found");
        assert_eq!(json["error"]["message"], "task abc");
        assert!(json["error"]["timestamp"].is_string());
    }
}
