//! Service errors and their HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::cache::CacheError;
use crate::models::{ParseServerError, ParseSourceCategoryError};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("a valid PenguinID is required for personal results")]
    Unauthorized,

    #[error("admin key required")]
    AdminUnauthorized,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Unauthorized | AppError::AdminUnauthorized => "UNAUTHORIZED",
            AppError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            AppError::Database(_) | AppError::Cache(_) | AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized | AppError::AdminUnauthorized => StatusCode::UNAUTHORIZED,
            AppError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Database(_) | AppError::Cache(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        AppError::InvalidRequest(message.into())
    }

    /// Prefix the message with one line of context, keeping the kind.
    pub fn context(self, context: &str) -> Self {
        match self {
            AppError::InvalidRequest(m) => AppError::InvalidRequest(m),
            AppError::NotFound(m) => AppError::NotFound(m),
            AppError::Unauthorized => AppError::Unauthorized,
            AppError::AdminUnauthorized => AppError::AdminUnauthorized,
            AppError::UpstreamUnavailable(m) => AppError::UpstreamUnavailable(format!("{}: {}", context, m)),
            AppError::Database(e) => AppError::Internal(anyhow::Error::new(e).context(context.to_string())),
            AppError::Cache(e) => AppError::Internal(anyhow::Error::new(e).context(context.to_string())),
            AppError::Internal(e) => AppError::Internal(e.context(context.to_string())),
        }
    }
}

/// Lost connections and an exhausted pool are outages, not query bugs.
impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                AppError::UpstreamUnavailable(format!("postgres: {}", e))
            }
            e => AppError::Database(e),
        }
    }
}

impl From<ParseServerError> for AppError {
    fn from(e: ParseServerError) -> Self {
        AppError::InvalidRequest(e.to_string())
    }
}

impl From<ParseSourceCategoryError> for AppError {
    fn from(e: ParseSourceCategoryError) -> Self {
        AppError::InvalidRequest(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            AppError::InvalidRequest(_) | AppError::NotFound(_) | AppError::Unauthorized | AppError::AdminUnauthorized => {
                debug!(code = self.code(), "Request rejected: {}", self)
            }
            AppError::UpstreamUnavailable(_) => warn!("Upstream unavailable: {}", self),
            _ => error!("Request failed: {}", self),
        }
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_stable_codes() {
        let invalid = AppError::invalid("interval length must be greater than 1 hour");
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert_eq!(invalid.code(), "INVALID_REQUEST");

        assert_eq!(AppError::NotFound("stage".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::UpstreamUnavailable("redis".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let parse: AppError = "EU".parse::<crate::models::Server>().unwrap_err().into();
        assert_eq!(parse.code(), "INVALID_REQUEST");
    }

    #[test]
    fn database_outages_are_upstream_unavailable() {
        let timed_out = AppError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(timed_out.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(timed_out.code(), "UPSTREAM_UNAVAILABLE");

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        let io = AppError::from(sqlx::Error::Io(refused)).context("drop matrix");
        assert_eq!(io.code(), "UPSTREAM_UNAVAILABLE");
        assert!(io.to_string().starts_with("upstream unavailable: drop matrix: postgres:"));

        let missing = AppError::from(sqlx::Error::RowNotFound);
        assert_eq!(missing.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(missing.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn context_keeps_client_errors_verbatim() {
        let e = AppError::invalid("bad").context("query trend");
        assert_eq!(e.to_string(), "bad");
        let e = AppError::Internal(anyhow::anyhow!("boom")).context("query trend");
        assert_eq!(e.to_string(), "query trend: boom");
    }
}
