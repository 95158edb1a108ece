// HTTP route modules
//
// Thin adapters between the wire and the core services. Unhandled errors
// become a generic message with an 8-character correlation id; the real
// cause goes to the log.

pub mod auth;
pub mod tasks;

use axum::http::StatusCode;
use axum::Json;
use rand::Rng;
use serde_json::{json, Value};
use tracing::error;

/// Replace an internal error with a correlation id the user can report
pub fn internal_error(context: &str, error: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    let correlation_id: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();

    error!(
        correlation_id = %correlation_id,
        context = %context,
        error = %error,
        "Internal error"
    );

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "detail": format!("Internal error (ref: {})", correlation_id),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_error_has_reference() {
        let (status, body) = internal_error("test", "boom");
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let detail = body.0["detail"].as_str().unwrap().to_string();
        assert!(detail.starts_with("Internal error (ref: "));
        // Generic message, no cause leakage
        assert!(!detail.contains("boom"));
    }
}
