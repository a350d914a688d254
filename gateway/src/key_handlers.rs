use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use common_http_errors::{ApiResult, ErrorKind};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::completion_handlers::{parse_body, principal_and_tier};
use crate::context::RequestContext;
use crate::output_filter::SkipOutputFilter;
use crate::pipeline::identity_error;

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
}

/// The one response in which the cleartext secret ever appears.
#[derive(Serialize)]
pub struct CreatedKeyResponse {
    pub id: Uuid,
    pub name: String,
    pub key: String,
    pub tier: &'static str,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct KeyListing {
    pub data: Vec<KeyEntry>,
}

#[derive(Serialize)]
pub struct KeyEntry {
    pub id: Uuid,
    pub name: String,
    /// Display-only mask; the secret is unrecoverable after creation.
    pub display: String,
    pub tier: &'static str,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

/// POST /auth/api-keys — mint a key in the caller's tier.
pub async fn create_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(raw): Json<serde_json::Value>,
) -> ApiResult<Response> {
    let req: CreateKeyRequest = parse_body(&ctx, raw)?;
    let (principal, tier) = principal_and_tier(&state, &ctx)?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ctx
            .err(ErrorKind::InvalidArgument)
            .with_message("name must not be empty")
            .with_param("name"));
    }

    let created = state
        .identity
        .create_key(principal.id, name, tier.name)
        .await
        .map_err(|err| identity_error(&ctx, err))?;
    info!(
        request_id = %ctx.request_id,
        principal_id = %principal.id,
        key_id = %created.key.id,
        "API key created"
    );

    let mut response = (
        StatusCode::CREATED,
        Json(CreatedKeyResponse {
            id: created.key.id,
            name: created.key.name.clone(),
            key: created.cleartext,
            tier: created.key.tier.as_str(),
            created_at: created.key.created_at,
            expires_at: created.key.expires_at,
        }),
    )
        .into_response();
    // The one response that carries the cleartext; the output filter would
    // otherwise mask the `key` field into uselessness.
    response.extensions_mut().insert(SkipOutputFilter);
    Ok(response)
}

/// GET /auth/api-keys — masked listing for the caller.
pub async fn list_keys(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Json<KeyListing>> {
    let (principal, _) = principal_and_tier(&state, &ctx)?;
    let keys = state
        .identity
        .list_keys(principal.id)
        .await
        .map_err(|err| identity_error(&ctx, err))?;
    let data = keys
        .iter()
        .map(|key| KeyEntry {
            id: key.id,
            name: key.name.clone(),
            display: key.masked(),
            tier: key.tier.as_str(),
            active: key.active,
            created_at: key.created_at,
            expires_at: key.expires_at,
            last_used: key.last_used,
        })
        .collect();
    Ok(Json(KeyListing { data }))
}

/// DELETE /auth/api-keys/:id — idempotent revoke; history is preserved.
pub async fn revoke_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(key_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let (principal, _) = principal_and_tier(&state, &ctx)?;
    state
        .identity
        .revoke_key(principal.id, key_id)
        .await
        .map_err(|err| identity_error(&ctx, err))?;
    state.authn.cache().invalidate(key_id);
    info!(
        request_id = %ctx.request_id,
        principal_id = %principal.id,
        key_id = %key_id,
        "API key revoked"
    );
    Ok(StatusCode::NO_CONTENT)
}
