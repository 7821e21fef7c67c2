use axum::{http::StatusCode, response::IntoResponse, Json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Malformed notification: {0}")]
    Malformed(String),

    #[error("Throttled by upstream: {0}")]
    Throttled(String),

    #[error("Upstream authentication failed: {0}")]
    Auth(String),

    #[error("Upstream quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Skipped after job abort")]
    Aborted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Upstream asked us to slow down; worth retrying after a backoff.
    pub fn is_transient_throttle(&self) -> bool {
        matches!(self, AppError::Throttled(_))
    }

    /// Store-level hiccups that usually clear on their own (SQLite busy/locked,
    /// pool exhaustion, I/O).
    pub fn is_transient_infra(&self) -> bool {
        match self {
            AppError::Database(sqlx::Error::PoolTimedOut)
            | AppError::Database(sqlx::Error::Io(_))
            | AppError::Io(_) => true,
            AppError::Database(sqlx::Error::Database(db)) => {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
                db.code()
                    .and_then(|c| c.parse::<i32>().ok())
                    .map(|c| matches!(c & 0xff, 5 | 6))
                    .unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Errors that make every remaining item of a scan pointless.
    pub fn is_job_fatal(&self) -> bool {
        matches!(self, AppError::Auth(_) | AppError::QuotaExhausted(_))
    }

    /// Short machine-readable kind, stored as `error_type` on dead letters.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Http(_) => "http",
            AppError::Json(_) => "json",
            AppError::Database(_) => "database",
            AppError::Migration(_) => "migration",
            AppError::Malformed(_) => "malformed",
            AppError::Throttled(_) => "throttled",
            AppError::Auth(_) => "auth",
            AppError::QuotaExhausted(_) => "quota_exhausted",
            AppError::Upstream { .. } => "upstream",
            AppError::Timeout(_) => "timeout",
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::ChannelSend(_) => "channel_send",
            AppError::Aborted => "aborted",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::Malformed(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.to_string(), "kind": self.kind() });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_throttle_is_transient_throttle() {
        assert!(AppError::Throttled("429".into()).is_transient_throttle());
        assert!(!AppError::NotFound("x".into()).is_transient_throttle());
        assert!(!AppError::Timeout(10).is_transient_throttle());
    }

    #[test]
    fn pool_timeout_is_transient_infra() {
        assert!(AppError::Database(sqlx::Error::PoolTimedOut).is_transient_infra());
        assert!(!AppError::Database(sqlx::Error::RowNotFound).is_transient_infra());
        assert!(!AppError::Malformed("bad".into()).is_transient_infra());
    }

    #[test]
    fn auth_and_quota_are_job_fatal() {
        assert!(AppError::Auth("401".into()).is_job_fatal());
        assert!(AppError::QuotaExhausted("daily".into()).is_job_fatal());
        assert!(!AppError::Throttled("429".into()).is_job_fatal());
    }
}
