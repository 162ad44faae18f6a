use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Category of an [`AppError`]. Drives HTTP status mapping and worker retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by chaintx operations.
///
/// Every error carries a stable machine `code`, a human message and a
/// metadata bag that is surfaced to callers for non-internal kinds.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} error {code}: {message}")]
pub struct AppError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub metadata: Map<String, Value>,
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            metadata: Map::new(),
        }
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, code, message)
    }

    /// Attach one metadata entry.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::internal("serialization_failed", "failed to encode or decode JSON")
            .with("error", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_code() {
        let err = AppError::conflict("idempotency_key_conflict", "reused key");
        assert_eq!(
            err.to_string(),
            "conflict error idempotency_key_conflict: reused key"
        );
    }

    #[test]
    fn metadata_builder_accumulates() {
        let err = AppError::validation("invalid_request", "bad")
            .with("field", "chain")
            .with("limit", 200);
        assert_eq!(err.metadata["field"], "chain");
        assert_eq!(err.metadata["limit"], 200);
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
