use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use chaintx::{AppError, ErrorKind};
use serde::Serialize;
use serde_json::{Map, Value};

/// Errors rendered as `{type, code, message, metadata?}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    App(#[from] AppError),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a Map<String, Value>>,
}

impl ApiError {
    pub fn validation(code: &str, message: impl Into<String>) -> Self {
        ApiError::App(AppError::validation(code, message))
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::App(e) => match e.kind {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let envelope = match self {
            ApiError::App(e) if e.kind == ErrorKind::Internal => {
                tracing::error!(
                    code = %e.code,
                    metadata = %serde_json::Value::Object(e.metadata.clone()),
                    "{}",
                    e.message
                );
                Envelope {
                    kind: e.kind.as_str(),
                    code: &e.code,
                    message: "an internal error occurred",
                    metadata: None,
                }
            }
            ApiError::App(e) => Envelope {
                kind: e.kind.as_str(),
                code: &e.code,
                message: &e.message,
                metadata: (!e.metadata.is_empty()).then_some(&e.metadata),
            },
            ApiError::Unauthorized(message) => Envelope {
                kind: "unauthorized",
                code: "unauthorized",
                message,
                metadata: None,
            },
            ApiError::Unavailable(message) => Envelope {
                kind: "unavailable",
                code: "service_unavailable",
                message,
                metadata: None,
            },
        };
        HttpResponse::build(self.status_code()).json(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    async fn render(err: ApiError) -> (StatusCode, Value) {
        let resp = err.error_response();
        let status = resp.status();
        let body = to_bytes(resp.into_body()).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[actix_rt::test]
    async fn validation_keeps_metadata() {
        let err = AppError::validation("invalid_request", "chain is invalid").with("field", "chain");
        let (status, body) = render(err.into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "validation");
        assert_eq!(body["code"], "invalid_request");
        assert_eq!(body["metadata"]["field"], "chain");
    }

    #[actix_rt::test]
    async fn internal_details_are_not_leaked() {
        let err = AppError::internal("wallet_account_not_found", "wallet wa_1 missing")
            .with("wallet_account_id", "wa_1");
        let (status, body) = render(err.into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "wallet_account_not_found");
        assert_eq!(body["message"], "an internal error occurred");
        assert!(body.get("metadata").is_none());
    }

    #[actix_rt::test]
    async fn unauthorized_maps_to_401() {
        let (status, body) = render(ApiError::Unauthorized("bearer token required".into())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["type"], "unauthorized");
    }
}
