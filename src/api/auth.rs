// =============================================================================
// Admin token authentication -- X-Admin-Token header extractor
// =============================================================================
//
// Admin endpoints (POST /config, DELETE /events/{symbol}) require the
// `X-Admin-Token` header to match the configured `ADMIN_TOKEN`. Comparison is
// performed in constant time to prevent timing side-channels.
//
// Usage as an Axum extractor:
//
//   async fn handler(_admin: AdminToken, ...) { ... }
//
// If the token is missing or invalid, the extractor short-circuits the
// request with a 401 response before the handler body executes.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::AppState;

/// Header carrying the admin token.
const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. The comparison examines every
/// byte of both slices even when a mismatch is found early.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        // A length mismatch already leaks that lengths differ, which is
        // acceptable for token authentication (the attacker does not control
        // the expected token length).
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// =============================================================================
// Extractor
// =============================================================================

/// Axum extractor that validates the `X-Admin-Token` header against the
/// configured admin token.
pub struct AdminToken;

/// Rejection returned when authentication fails.
pub struct AdminRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AdminRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "detail": self.message,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait::async_trait]
impl FromRequestParts<Arc<AppState>> for AdminToken {
    type Rejection = AdminRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let expected = state.settings.admin_token.as_str();

        if expected.is_empty() {
            warn!("admin token is not configured, all admin requests will be rejected");
            return Err(AdminRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "Server authentication not configured",
            });
        }

        let token = parts
            .headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(AdminRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "Invalid admin token",
            });
        }

        Ok(AdminToken)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn constant_time_eq_empty() {
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn constant_time_eq_single_bit_diff() {
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }
}
