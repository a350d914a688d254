use std::time::Duration;

use axum::extract::{Extension, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use common_http_errors::{ApiError, ApiResult, ErrorKind};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::config::OAuthProviderConfig;
use crate::context::RequestContext;
use crate::output_filter::SkipOutputFilter;
use crate::pipeline::identity_error;

const STATE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
}

#[derive(Serialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub user: OAuthUser,
}

#[derive(Serialize)]
pub struct OAuthUser {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub tier: &'static str,
}

/// GET /auth/oauth/:provider — 302 to the provider with a single-use state
/// parked in the KV store.
pub async fn oauth_redirect(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(provider): Path<String>,
) -> ApiResult<Response> {
    let config = find_provider(&state, &ctx, &provider)?;

    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let state_token = hex::encode(bytes);

    state
        .kv
        .set(
            &format!("oauth:state:{state_token}"),
            &config.name,
            STATE_TTL,
        )
        .await
        .map_err(|err| {
            ctx.err(ErrorKind::Internal)
                .with_message(format!("failed to persist oauth state: {err}"))
        })?;

    let scope = config.scopes.join(" ");
    let location = format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
        config.auth_url,
        urlencoding::encode(&config.client_id),
        urlencoding::encode(&config.redirect_url),
        urlencoding::encode(&scope),
        state_token,
    );

    Ok((
        StatusCode::FOUND,
        [(header::LOCATION, location)],
    )
        .into_response())
}

/// GET /auth/oauth/:provider/callback — exchange the code, fetch the user,
/// upsert, and mint the access/refresh token pair.
pub async fn oauth_callback(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> ApiResult<Response> {
    let config = find_provider(&state, &ctx, &provider)?.clone();

    let state_key = format!("oauth:state:{}", query.state);
    let stored = state.kv.get(&state_key).await.map_err(|err| {
        ctx.err(ErrorKind::Internal)
            .with_message(format!("failed to read oauth state: {err}"))
    })?;
    // Single use regardless of outcome.
    let _ = state.kv.del(&state_key).await;
    if stored.as_deref() != Some(config.name.as_str()) {
        return Err(ctx
            .err(ErrorKind::InvalidArgument)
            .with_message("invalid or expired oauth state")
            .with_param("state"));
    }

    let token = exchange_code(&state, &ctx, &config, &query.code).await?;
    let (email, name) = fetch_user_info(&state, &ctx, &config, &token).await?;

    let user = state
        .identity
        .upsert_user_by_email(&email, &name)
        .await
        .map_err(|err| identity_error(&ctx, err))?;
    info!(
        request_id = %ctx.request_id,
        user_id = %user.id,
        provider = %config.name,
        "OAuth sign-in"
    );

    let signer = state.signer.as_ref().ok_or_else(|| {
        ctx.err(ErrorKind::Internal)
            .with_message("token signing is not configured")
    })?;
    let issued = signer.issue_tokens(&user).map_err(|err| {
        ctx.err(ErrorKind::Internal)
            .with_message(format!("failed to mint tokens: {err}"))
    })?;

    let mut response = Json(OAuthTokens {
        access_token: issued.access_token,
        refresh_token: issued.refresh_token,
        token_type: issued.token_type,
        expires_in: issued.access_expires_in,
        user: OAuthUser {
            id: user.id,
            email: user.email,
            name: user.name,
            tier: user.tier.as_str(),
        },
    })
    .into_response();
    // This response mints the tokens; the output filter must not mask them.
    response.extensions_mut().insert(SkipOutputFilter);
    Ok(response)
}

fn find_provider<'a>(
    state: &'a AppState,
    ctx: &RequestContext,
    provider: &str,
) -> Result<&'a OAuthProviderConfig, ApiError> {
    state
        .config
        .auth
        .oauth_providers
        .iter()
        .find(|candidate| candidate.name == provider)
        .ok_or_else(|| {
            ctx.err(ErrorKind::NotFound)
                .with_message(format!("unknown oauth provider '{provider}'"))
        })
}

async fn exchange_code(
    state: &AppState,
    ctx: &RequestContext,
    config: &OAuthProviderConfig,
    code: &str,
) -> ApiResult<String> {
    #[derive(Deserialize)]
    struct TokenResponse {
        access_token: Option<String>,
    }

    let response = state
        .http_client
        .post(&config.token_url)
        .header(header::ACCEPT, "application/json")
        .form(&[
            ("grant_type", "authorization_code"),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("redirect_uri", config.redirect_url.as_str()),
            ("code", code),
        ])
        .send()
        .await
        .map_err(|err| {
            warn!(?err, provider = %config.name, "OAuth token exchange failed");
            ctx.err(ErrorKind::UpstreamError)
                .with_message("token exchange failed")
        })?;

    if !response.status().is_success() {
        warn!(status = %response.status(), provider = %config.name, "OAuth token endpoint rejected exchange");
        return Err(ctx
            .err(ErrorKind::UpstreamError)
            .with_message("token exchange rejected"));
    }

    let body: TokenResponse = response.json().await.map_err(|err| {
        ctx.err(ErrorKind::UpstreamError)
            .with_message(format!("invalid token response: {err}"))
    })?;
    body.access_token.ok_or_else(|| {
        ctx.err(ErrorKind::UpstreamError)
            .with_message("token response missing access_token")
    })
}

async fn fetch_user_info(
    state: &AppState,
    ctx: &RequestContext,
    config: &OAuthProviderConfig,
    access_token: &str,
) -> ApiResult<(String, String)> {
    let response = state
        .http_client
        .get(&config.user_info_url)
        .bearer_auth(access_token)
        .header(header::USER_AGENT, "autogram-gateway")
        .send()
        .await
        .map_err(|err| {
            warn!(?err, provider = %config.name, "OAuth user info fetch failed");
            ctx.err(ErrorKind::UpstreamError)
                .with_message("user info fetch failed")
        })?;

    if !response.status().is_success() {
        return Err(ctx
            .err(ErrorKind::UpstreamError)
            .with_message("user info fetch rejected"));
    }

    let body: serde_json::Value = response.json().await.map_err(|err| {
        ctx.err(ErrorKind::UpstreamError)
            .with_message(format!("invalid user info response: {err}"))
    })?;

    let login = body
        .get("login")
        .and_then(|value| value.as_str())
        .unwrap_or("user");
    let email = body
        .get("email")
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{login}@users.noreply.{}.local", config.name));
    let name = body
        .get("name")
        .and_then(|value| value.as_str())
        .unwrap_or(login)
        .to_string();
    Ok((email, name))
}
