use axum::extract::{Extension, State};
use axum::Json;
use common_http_errors::{ApiResult, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::app_state::AppState;
use crate::context::{Principal, RequestContext, TokenUsage};
use crate::model_registry::ModelConfig;
use crate::pipeline::upstream_error;
use crate::tiers::TierConfig;
use crate::upstream::{
    estimate_tokens, validate_dispatch, ChatMessage, CompletionEnvelope, Correlation,
    UpstreamEndpoint, ValidationError,
};

const DEFAULT_MAX_TOKENS: u32 = 256;
const CHAT_ROLES: &[&str] = &["system", "user", "assistant"];

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Serialize)]
pub struct ModelListing {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

#[derive(Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub display_name: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub capabilities: Vec<String>,
}

/// GET /v1/models — the subset of configured models the caller's tier allows.
pub async fn list_models(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Json<ModelListing>> {
    let (_, tier) = principal_and_tier(&state, &ctx)?;
    let mut data: Vec<ModelEntry> = state
        .config
        .models
        .iter()
        .filter(|model| tier.allows_model(&model.id))
        .map(|model| ModelEntry {
            id: model.id.clone(),
            object: "model",
            display_name: model.display_name.clone(),
            context_window: model.context_window,
            max_output_tokens: model.max_output_tokens,
            capabilities: {
                let mut caps: Vec<String> = model.capabilities.iter().cloned().collect();
                caps.sort();
                caps
            },
        })
        .collect();
    data.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(Json(ModelListing {
        object: "list",
        data,
    }))
}

/// POST /v1/completions — legacy prompt-style completions.
pub async fn completions(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(raw): Json<serde_json::Value>,
) -> ApiResult<Json<CompletionEnvelope>> {
    let req: CompletionRequest = parse_body(&ctx, raw)?;
    let (principal, tier) = principal_and_tier(&state, &ctx)?;
    reject_streaming(&ctx, req.stream)?;
    if req.prompt.trim().is_empty() {
        return Err(ctx
            .err(ErrorKind::InvalidArgument)
            .with_message("prompt must not be empty")
            .with_param("prompt"));
    }

    let model_id = req
        .model
        .clone()
        .unwrap_or_else(|| state.config.models.default_model.clone());
    let max_tokens = req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    let estimated = estimate_tokens(&req.prompt);
    let model = resolve_and_validate(&state, &ctx, tier, &model_id, max_tokens, estimated)?;

    let payload = json!({
        "prompt": req.prompt,
        "max_tokens": max_tokens,
        "temperature": req.temperature.unwrap_or(1.0),
        "top_p": req.top_p.unwrap_or(1.0),
        "n": req.n.unwrap_or(1),
        "stop": req.stop,
    });

    let envelope = dispatch(
        &state,
        &ctx,
        &principal,
        model,
        UpstreamEndpoint::Completions,
        payload,
    )
    .await?;
    Ok(Json(envelope))
}

/// POST /v1/chat/completions — message-style completions.
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(raw): Json<serde_json::Value>,
) -> ApiResult<Json<CompletionEnvelope>> {
    let req: ChatCompletionRequest = parse_body(&ctx, raw)?;
    let (principal, tier) = principal_and_tier(&state, &ctx)?;
    reject_streaming(&ctx, req.stream)?;
    validate_messages(&ctx, &req.messages)?;

    let model_id = req
        .model
        .clone()
        .unwrap_or_else(|| state.config.models.default_model.clone());
    let max_tokens = req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    let estimated: u32 = req
        .messages
        .iter()
        .map(|message| estimate_tokens(&message.content))
        .sum();
    let model = resolve_and_validate(&state, &ctx, tier, &model_id, max_tokens, estimated)?;

    let payload = json!({
        "messages": req.messages,
        "max_tokens": max_tokens,
        "temperature": req.temperature.unwrap_or(1.0),
        "top_p": req.top_p.unwrap_or(1.0),
        "n": req.n.unwrap_or(1),
    });

    let envelope = dispatch(
        &state,
        &ctx,
        &principal,
        model,
        UpstreamEndpoint::ChatCompletions,
        payload,
    )
    .await?;
    Ok(Json(envelope))
}

// ---------------- Shared helpers ----------------

/// Deserialize a request body that already passed the input filter, keeping
/// shape errors inside the standard envelope.
pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(
    ctx: &RequestContext,
    raw: serde_json::Value,
) -> ApiResult<T> {
    serde_json::from_value(raw).map_err(|err| {
        ctx.record_error_kind("invalid-argument");
        ctx.err(ErrorKind::InvalidArgument)
            .with_message(err.to_string())
    })
}

pub(crate) fn principal_and_tier<'a>(
    state: &'a AppState,
    ctx: &RequestContext,
) -> ApiResult<(Principal, &'a TierConfig)> {
    let principal = ctx
        .principal()
        .ok_or_else(|| ctx.err(ErrorKind::CredentialsMissing))?;
    let tier = state.config.tiers.get(principal.tier).ok_or_else(|| {
        ctx.err(ErrorKind::Internal)
            .with_message("tier configuration missing")
    })?;
    Ok((principal, tier))
}

fn reject_streaming(ctx: &RequestContext, stream: Option<bool>) -> ApiResult<()> {
    if stream.unwrap_or(false) {
        return Err(ctx
            .err(ErrorKind::InvalidArgument)
            .with_message("streaming responses are not supported")
            .with_param("stream"));
    }
    Ok(())
}

fn validate_messages(ctx: &RequestContext, messages: &[ChatMessage]) -> ApiResult<()> {
    if messages.is_empty() {
        return Err(ctx
            .err(ErrorKind::InvalidArgument)
            .with_message("messages must not be empty")
            .with_param("messages"));
    }
    for message in messages {
        if !CHAT_ROLES.contains(&message.role.as_str()) {
            return Err(ctx
                .err(ErrorKind::InvalidArgument)
                .with_message(format!("unknown message role '{}'", message.role))
                .with_param("messages"));
        }
        if message.content.trim().is_empty() {
            return Err(ctx
                .err(ErrorKind::InvalidArgument)
                .with_message("message content must not be empty")
                .with_param("messages"));
        }
    }
    Ok(())
}

pub(crate) fn resolve_and_validate<'a>(
    state: &'a AppState,
    ctx: &RequestContext,
    tier: &TierConfig,
    model_id: &str,
    max_tokens: u32,
    estimated_input: u32,
) -> ApiResult<&'a ModelConfig> {
    let model = state.config.models.get(model_id).ok_or_else(|| {
        ctx.err(ErrorKind::InvalidArgument)
            .with_message(format!("unknown model '{model_id}'"))
            .with_param("model")
    })?;
    validate_dispatch(tier, model, max_tokens, estimated_input).map_err(|err| match err {
        ValidationError::ForbiddenModel(model) => {
            ctx.record_error_kind("forbidden-model");
            ctx.err(ErrorKind::ForbiddenModel).with_param(model)
        }
        ValidationError::TokenLimit { requested, cap } => {
            ctx.record_error_kind("tier-token-limit-exceeded");
            ctx.err(ErrorKind::TierTokenLimitExceeded)
                .with_message(format!("max_tokens {requested} exceeds cap {cap}"))
                .with_param("max_tokens")
        }
        ValidationError::ContextWindow { estimated, window } => {
            ctx.record_error_kind("tier-token-limit-exceeded");
            ctx.err(ErrorKind::TierTokenLimitExceeded)
                .with_message(format!(
                    "estimated context {estimated} exceeds window {window}"
                ))
        }
    })?;
    Ok(model)
}

/// Dispatch to the upstream and settle usage accounting. The upstream's
/// reported usage is authoritative; the estimate only gated admission.
pub(crate) async fn dispatch(
    state: &AppState,
    ctx: &RequestContext,
    principal: &Principal,
    model: &ModelConfig,
    endpoint: UpstreamEndpoint,
    payload: serde_json::Value,
) -> ApiResult<CompletionEnvelope> {
    let correlation = Correlation {
        request_id: ctx.request_id,
        principal_id: principal.id,
        tier: principal.tier.as_str(),
    };
    let (envelope, latency) = state
        .upstream
        .dispatch(
            &model.id,
            endpoint,
            &payload,
            &correlation,
            ctx.time_remaining(),
        )
        .await
        .map_err(|err| upstream_error(ctx, err))?;

    ctx.record_model(&model.id, latency);
    let usage = TokenUsage {
        prompt_tokens: envelope.usage.prompt_tokens,
        completion_tokens: envelope.usage.completion_tokens,
        total_tokens: envelope.usage.total_tokens,
    };
    let cost = f64::from(usage.prompt_tokens) * model.input_token_price
        + f64::from(usage.completion_tokens) * model.output_token_price;
    ctx.record_usage(usage, cost);

    if let Some(key_id) = principal.api_key_id {
        let identity = state.identity.clone();
        let cache = state.authn.cache();
        let input = u64::from(usage.prompt_tokens);
        let output = u64::from(usage.completion_tokens);
        tokio::spawn(async move {
            if let Err(err) = identity.bump_usage(key_id, 0, input, output, cost).await {
                warn!(?err, key_id = %key_id, "Failed to record token usage");
            }
            cache.apply_usage(key_id, 0, input, output, cost);
        });
    }

    Ok(envelope)
}
