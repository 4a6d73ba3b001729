use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use constant_time_eq::constant_time_eq;
use tracing::warn;

use crate::engine::Identity;
use crate::error::SecretError;
use crate::ratelimit::{client_key, OperationClass};
use crate::AppState;

pub const OWNER_ID_HEADER: &str = "x-owner-id";
pub const OWNER_EMAIL_HEADER: &str = "x-owner-email";

/// Axum middleware guarding owner routes with `Authorization: Bearer <key>`.
///
/// A no-op when no API key is configured. Failed attempts count against the
/// auth rate limit; a client over that limit is refused before its token is
/// even compared.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    let client = client_key(request.headers());
    if state.limiter.is_blocked(OperationClass::Auth, &client).await {
        let admission = state
            .limiter
            .check_admission(OperationClass::Auth, &client)
            .await;
        return match admission.into_result() {
            Ok(_) => SecretError::Unauthorized.into_response(),
            Err(e) => e.into_response(),
        };
    }

    let token = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(t) if constant_time_eq(t.as_bytes(), expected.as_bytes()) => {
            state.limiter.reset(OperationClass::Auth, &client).await;
            next.run(request).await
        }
        _ => {
            warn!(client = %client, "rejected request with missing or invalid API key");
            let admission = state
                .limiter
                .check_admission(OperationClass::Auth, &client)
                .await;
            match admission.into_result() {
                Ok(_) => SecretError::Unauthorized.into_response(),
                Err(e) => e.into_response(),
            }
        }
    }
}

/// Caller identity as asserted by the upstream identity provider.
pub fn identity(headers: &HeaderMap) -> Option<Identity> {
    let owner_id = headers
        .get(OWNER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())?;
    let email = headers
        .get(OWNER_EMAIL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let mut identity = Identity::new(owner_id);
    identity.email = email.map(str::to_owned);
    Some(identity)
}
