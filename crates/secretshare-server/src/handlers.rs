use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    auth,
    engine::{Identity, NewSecret},
    error::SecretError,
    ratelimit::{client_key, OperationClass, UNKNOWN_CLIENT},
    AppState,
};

/// Count the request against `class` for this client; fail with 429 when over budget.
async fn admit(state: &AppState, headers: &HeaderMap, class: OperationClass) -> Result<String, SecretError> {
    let client = client_key(headers);
    state
        .limiter
        .check_admission(class, &client)
        .await
        .into_result()?;
    Ok(client)
}

/// Per-user budget for authenticated mutations.
async fn admit_user(state: &AppState, identity: &Identity, action: &str) -> Result<(), SecretError> {
    let policy = state.limiter.policies().user;
    state
        .limiter
        .check_user_rate_limit(&identity.owner_id, action, policy)
        .await
        .into_result()?;
    Ok(())
}

fn require_identity(headers: &HeaderMap) -> Result<Identity, SecretError> {
    auth::identity(headers).ok_or(SecretError::Unauthorized)
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> Response {
    let store_ok = state.service.health().await.is_ok();
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if store_ok { "ok" } else { "degraded" },
            "store": if store_ok { "ok" } else { "unavailable" },
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": state.started_at.elapsed().as_secs(),
        })),
    )
        .into_response()
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRequest {
    pub text: String,
    pub password: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Relative alternative to `expires_at`.
    pub expires_in_secs: Option<u64>,
    pub one_time_access: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateResponse {
    pub id: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

pub async fn create_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRequest>,
) -> Result<(StatusCode, Json<CreateResponse>), SecretError> {
    admit(&state, &headers, OperationClass::CreateSecret).await?;
    let identity = require_identity(&headers)?;
    admit_user(&state, &identity, "create").await?;

    let expires_at = match (body.expires_at, body.expires_in_secs) {
        (Some(_), Some(_)) => {
            return Err(SecretError::validation(
                "set either expires_at or expires_in_secs, not both",
            ))
        }
        (Some(at), None) => Some(at),
        (None, Some(secs)) => {
            let secs = i64::try_from(secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .ok_or_else(|| SecretError::validation("expires_in_secs is too large"))?;
            Some(
                state
                    .service
                    .now()
                    .checked_add_signed(secs)
                    .ok_or_else(|| SecretError::validation("expires_in_secs is too large"))?,
            )
        }
        (None, None) => None,
    };

    let created = state
        .service
        .create(
            Some(&identity),
            NewSecret {
                text: body.text,
                password: body.password,
                expires_at,
                one_time_access: body.one_time_access.unwrap_or(true),
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateResponse {
            url: format!("/secret/{}", created.id),
            id: created.id,
            created_at: created.created_at,
        }),
    ))
}

// ── Reveal ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct RevealRequest {
    password: Option<String>,
}

/// The body is optional; an empty body means no password was supplied.
pub async fn reveal_secret(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, SecretError> {
    let client = admit(&state, &headers, OperationClass::AccessSecret).await?;

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RevealRequest::default()
    } else {
        serde_json::from_slice::<RevealRequest>(&body)
            .map_err(|e| SecretError::validation(format!("invalid request body: {e}")))?
    };

    let viewer_ip = (client != UNKNOWN_CLIENT).then_some(client.as_str());
    let revealed = state
        .service
        .get(&id, request.password.as_deref(), viewer_ip)
        .await?;
    Ok(Json(revealed).into_response())
}

// ── Info ──────────────────────────────────────────────────────────────────────

pub async fn secret_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, SecretError> {
    admit(&state, &headers, OperationClass::AccessSecret).await?;
    let info = state.service.get_info(&id).await?;
    Ok(Json(info).into_response())
}

// ── List / Search ─────────────────────────────────────────────────────────────

pub async fn list_secrets(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, SecretError> {
    admit(&state, &headers, OperationClass::Api).await?;
    let identity = require_identity(&headers)?;
    let secrets = state.service.list(Some(&identity)).await?;
    Ok(Json(json!({ "secrets": secrets })).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
}

pub async fn search_secrets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> Result<Response, SecretError> {
    admit(&state, &headers, OperationClass::Api).await?;
    let identity = require_identity(&headers)?;
    let secrets = state.service.search(Some(&identity), &params.q).await?;
    Ok(Json(json!({ "secrets": secrets })).into_response())
}

// ── Delete ────────────────────────────────────────────────────────────────────

pub async fn delete_secret(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, SecretError> {
    admit(&state, &headers, OperationClass::Api).await?;
    let identity = require_identity(&headers)?;
    admit_user(&state, &identity, "delete").await?;
    state.service.delete(Some(&identity), &id).await?;
    Ok(Json(json!({ "success": true })).into_response())
}
