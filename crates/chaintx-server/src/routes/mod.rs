//! HTTP routes. Each module exposes a `configure` for `App::configure`.

pub mod health;
pub mod payment_requests;
pub mod swagger;
pub mod webhook_outbox;

use actix_web::web;

use crate::error::ApiError;

/// Every route plus the extractor error handlers that keep failures in the
/// JSON error envelope.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::QueryConfig::default().error_handler(|err, _| {
        ApiError::validation("invalid_request", err.to_string()).into()
    }))
    .app_data(web::PathConfig::default().error_handler(|err, _| {
        ApiError::validation("invalid_request", err.to_string()).into()
    }))
    .configure(health::configure)
    .configure(payment_requests::configure)
    .configure(webhook_outbox::configure)
    .configure(swagger::configure);
}
