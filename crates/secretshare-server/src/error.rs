use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::store::{crypto::CodecError, StoreError};

/// Every failure the lifecycle engine and the HTTP boundary can report.
///
/// Missing, expired, burned and foreign-owned secrets all collapse into
/// [`SecretError::NotFound`] so callers cannot probe for existence.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret not found")]
    NotFound,

    #[error("authentication required")]
    Unauthorized,

    #[error("password required")]
    PasswordRequired,

    #[error("invalid password")]
    InvalidPassword,

    #[error("{0}")]
    Validation(String),

    #[error("secret could not be decrypted")]
    Decryption,

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited {
        retry_after_secs: u64,
        limit: u32,
        remaining: u32,
        reset_at: DateTime<Utc>,
    },

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl SecretError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized | Self::PasswordRequired => StatusCode::UNAUTHORIZED,
            Self::InvalidPassword => StatusCode::FORBIDDEN,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Decryption | Self::Storage(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<StoreError> for SecretError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate(id) => {
                Self::Storage(anyhow::anyhow!("duplicate secret id {id}"))
            }
            StoreError::Backend(e) => Self::Storage(e),
        }
    }
}

impl From<CodecError> for SecretError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Encryption => Self::Internal(anyhow::anyhow!(e)),
            _ => Self::Decryption,
        }
    }
}

impl IntoResponse for SecretError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::Storage(ref e) | Self::Internal(ref e) => {
                error!(error = %format!("{e:#}"), "internal error");
                (status, Json(json!({"error": "internal server error"}))).into_response()
            }
            Self::Decryption => {
                (status, Json(json!({"error": "secret could not be decrypted"}))).into_response()
            }
            Self::RateLimited {
                retry_after_secs,
                limit,
                remaining,
                reset_at,
            } => {
                let body = Json(json!({
                    "error": "too many requests, please try again later",
                    "retry_after": retry_after_secs,
                }));
                let mut response = (status, body).into_response();
                let headers = response.headers_mut();
                headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
                if let Ok(v) = HeaderValue::from_str(&reset_at.to_rfc3339()) {
                    headers.insert("x-ratelimit-reset", v);
                }
                response
            }
            other => (status, Json(json!({"error": other.to_string()}))).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_causes_share_one_message() {
        assert_eq!(SecretError::NotFound.to_string(), "secret not found");
        assert_eq!(SecretError::NotFound.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn password_errors_are_distinct() {
        assert_eq!(SecretError::PasswordRequired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(SecretError::InvalidPassword.status(), StatusCode::FORBIDDEN);
        assert_ne!(
            SecretError::PasswordRequired.to_string(),
            SecretError::InvalidPassword.to_string()
        );
    }

    #[test]
    fn rate_limited_carries_retry_headers() {
        let resp = SecretError::RateLimited {
            retry_after_secs: 42,
            limit: 5,
            remaining: 0,
            reset_at: Utc::now(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "42");
        assert_eq!(resp.headers()["x-ratelimit-limit"], "5");
        assert_eq!(resp.headers()["x-ratelimit-remaining"], "0");
        assert!(resp.headers().contains_key("x-ratelimit-reset"));
    }

    #[test]
    fn duplicate_store_error_is_storage() {
        let err: SecretError = StoreError::Duplicate("abc".into()).into();
        assert!(matches!(err, SecretError::Storage(_)));
    }
}
