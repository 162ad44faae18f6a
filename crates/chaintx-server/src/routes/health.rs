use actix_web::{web, HttpRequest, HttpResponse};
use chaintx::security::{bearer_token, constant_time_eq};

use crate::error::ApiError;
use crate::metrics;
use crate::state::AppState;

/// GET /healthz
pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

/// GET /metrics - Prometheus text, bearer-gated when METRICS_TOKEN is set
pub async fn metrics_endpoint(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    if let Some(expected) = &state.metrics_token {
        let authorized = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .map(|token| constant_time_eq(token.as_bytes(), expected.as_bytes()))
            .unwrap_or(false);
        if !authorized {
            metrics::AUTH_FAILURES
                .with_label_values(&["metrics", "invalid"])
                .inc();
            return Err(ApiError::Unauthorized(
                "valid bearer token required for /metrics".into(),
            ));
        }
    }
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output()))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(healthz))
        .route("/metrics", web::get().to(metrics_endpoint));
}
