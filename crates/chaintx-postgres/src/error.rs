use chaintx::AppError;
use thiserror::Error;

/// PostgreSQL SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid value in column {column}: {value}")]
    InvalidColumn { column: &'static str, value: String },
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        self.constraint_violated().is_some()
    }

    /// Name of the unique constraint that was violated, if any.
    pub fn constraint_violated(&self) -> Option<&str> {
        match self {
            StoreError::Database(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                Some(db.constraint().unwrap_or_default())
            }
            _ => None,
        }
    }
}

/// Tags a failed query with the operation it belonged to.
pub(crate) trait QueryContext<T> {
    fn context(self, code: &'static str, message: &'static str) -> Result<T, AppError>;
}

impl<T, E: Into<StoreError>> QueryContext<T> for Result<T, E> {
    fn context(self, code: &'static str, message: &'static str) -> Result<T, AppError> {
        self.map_err(|e| {
            let e: StoreError = e.into();
            tracing::error!(code, error = %e, "{message}");
            AppError::internal(code, message).with("error", e.to_string())
        })
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::internal("database_error", "database operation failed").with("error", e.to_string())
    }
}
