use anyhow::Result;
use rama::http::{Body, Response, StatusCode};
use serde_json::json;

use super::response::respond_json;
use crate::credentials::CredentialCache;

/// Handles health check requests.
///
/// Always 200 so a stale-but-serving instance stays in rotation. Refresh
/// failures and an empty credential cache are reported as `degraded`.
pub fn handle_health(cache: &CredentialCache) -> Result<Response<Body>> {
    let status = cache.status();
    let ready = cache.is_ready();

    let body = if ready && status.is_healthy() {
        json!({ "status": "ok" })
    } else {
        json!({
            "status": "degraded",
            "ready": ready,
            "consecutive_failures": status.consecutive_failures,
            "last_success": status.last_success,
            "last_failure": status.last_failure,
            "last_error": status.last_error,
        })
    };

    respond_json(StatusCode::OK, &body.to_string())
}
