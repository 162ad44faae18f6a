use actix_web::{web, HttpRequest, HttpResponse};
use chaintx::AppError;
use serde::Deserialize;

use crate::auth::{principal_id, require_ops_key};
use crate::error::ApiError;
use crate::metrics;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

/// An empty body means no reason.
fn parse_cancel_body(body: &[u8]) -> Result<CancelBody, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(CancelBody::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        ApiError::App(
            AppError::validation("invalid_request", "request body must be valid JSON")
                .with("error", e.to_string()),
        )
    })
}

fn record<T>(operation: &str, result: &Result<T, AppError>) {
    let label = match result {
        Ok(_) => "ok",
        Err(e) => e.kind.as_str(),
    };
    metrics::OUTBOX_OPS
        .with_label_values(&[operation, label])
        .inc();
}

/// GET /v1/webhook-outbox/overview
pub async fn overview(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    require_ops_key(&req, &state)?;
    Ok(HttpResponse::Ok().json(state.outbox_ops.overview().await?))
}

/// GET /v1/webhook-outbox/dlq?limit=
pub async fn list_dlq(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<DlqQuery>,
) -> Result<HttpResponse, ApiError> {
    require_ops_key(&req, &state)?;
    let result = state.outbox_ops.list_dlq(query.limit).await;
    record("list_dlq", &result);
    Ok(HttpResponse::Ok().json(result?))
}

/// POST /v1/webhook-outbox/dlq/{event_id}/requeue
pub async fn requeue(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    require_ops_key(&req, &state)?;
    let result = state
        .outbox_ops
        .requeue(&path.into_inner(), &principal_id(&req))
        .await;
    record("requeue", &result);
    Ok(HttpResponse::Ok().json(result?))
}

/// POST /v1/webhook-outbox/events/{event_id}/cancel
pub async fn cancel(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    require_ops_key(&req, &state)?;
    let body = parse_cancel_body(&body)?;
    let result = state
        .outbox_ops
        .cancel(&path.into_inner(), body.reason.as_deref(), &principal_id(&req))
        .await;
    record("cancel", &result);
    Ok(HttpResponse::Ok().json(result?))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/v1/webhook-outbox")
            .route("/overview", web::get().to(overview))
            .route("/dlq", web::get().to(list_dlq))
            .route("/dlq/{event_id}/requeue", web::post().to(requeue))
            .route("/events/{event_id}/cancel", web::post().to(cancel)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_body_forms() {
        assert!(parse_cancel_body(b"").unwrap().reason.is_none());
        assert!(parse_cancel_body(b"  \n").unwrap().reason.is_none());
        assert_eq!(
            parse_cancel_body(br#"{"reason":"merchant gone"}"#)
                .unwrap()
                .reason
                .as_deref(),
            Some("merchant gone")
        );
        assert!(parse_cancel_body(br#"{"why":"x"}"#).is_err());
        assert!(parse_cancel_body(b"{").is_err());
    }
}
