use actix_web::HttpRequest;
use chaintx::security::{bearer_token, matches_any_key};

use crate::error::ApiError;
use crate::metrics;
use crate::state::AppState;

/// Header carrying the caller or operator identity.
pub const HEADER_PRINCIPAL_ID: &str = "X-Principal-ID";

/// Trimmed `X-Principal-ID`, empty when absent.
pub fn principal_id(req: &HttpRequest) -> String {
    req.headers()
        .get(HEADER_PRINCIPAL_ID)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

/// Webhook-outbox routes are open until admin keys are configured.
pub fn require_ops_key(req: &HttpRequest, state: &AppState) -> Result<(), ApiError> {
    if state.ops_admin_keys.is_empty() {
        return Ok(());
    }
    let Some(header) = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
    else {
        metrics::AUTH_FAILURES
            .with_label_values(&["webhook_ops", "missing"])
            .inc();
        return Err(ApiError::Unauthorized("bearer token required".into()));
    };
    match bearer_token(header) {
        Some(token) if matches_any_key(token, &state.ops_admin_keys) => Ok(()),
        _ => {
            tracing::warn!(path = req.path(), "webhook ops request rejected");
            metrics::AUTH_FAILURES
                .with_label_values(&["webhook_ops", "invalid"])
                .inc();
            Err(ApiError::Unauthorized("invalid bearer token".into()))
        }
    }
}
