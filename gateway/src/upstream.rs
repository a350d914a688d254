use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::config::GatewayConfig;
use crate::health::HealthMonitor;
use crate::model_registry::{ModelConfig, UpstreamAuth};
use crate::tiers::TierConfig;

const UPSTREAM_HARD_CAP: Duration = Duration::from_secs(120);

/// Cheap token estimate used only to gate admission; the upstream-reported
/// usage is the authoritative figure for tallies and cost.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("model '{0}' is not available to this tier")]
    ForbiddenModel(String),
    #[error("max_tokens {requested} exceeds cap {cap}")]
    TokenLimit { requested: u32, cap: u32 },
    #[error("estimated context {estimated} exceeds window {window}")]
    ContextWindow { estimated: u32, window: u32 },
}

/// Pre-dispatch validation: tier allows the model, the token ask fits both
/// the tier and the model, and the estimated context fits the smaller window.
pub fn validate_dispatch(
    tier: &TierConfig,
    model: &ModelConfig,
    max_tokens: u32,
    estimated_input_tokens: u32,
) -> Result<(), ValidationError> {
    if !tier.allows_model(&model.id) {
        return Err(ValidationError::ForbiddenModel(model.id.clone()));
    }
    let cap = tier.max_tokens_per_request.min(model.max_output_tokens);
    if max_tokens > cap {
        return Err(ValidationError::TokenLimit {
            requested: max_tokens,
            cap,
        });
    }
    let window = tier.max_context_window.min(model.context_window);
    let estimated = estimated_input_tokens.saturating_add(max_tokens);
    if estimated > window {
        return Err(ValidationError::ContextWindow { estimated, window });
    }
    Ok(())
}

// ---------------- Wire contract ----------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageBody {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl Choice {
    /// The choice's text regardless of completion flavour.
    pub fn content(&self) -> &str {
        self.text
            .as_deref()
            .or_else(|| self.message.as_ref().map(|message| message.content.as_str()))
            .unwrap_or("")
    }
}

/// Normalized completion envelope returned by every model dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEnvelope {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: UsageBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamEndpoint {
    Completions,
    ChatCompletions,
}

impl UpstreamEndpoint {
    fn path(&self) -> &'static str {
        match self {
            Self::Completions => "completions",
            Self::ChatCompletions => "chat/completions",
        }
    }

    fn object_name(&self) -> &'static str {
        match self {
            Self::Completions => "text_completion",
            Self::ChatCompletions => "chat.completion",
        }
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("model '{0}' is not configured")]
    UnknownModel(String),
    /// Circuit open or health probe red; no connection was opened.
    #[error("model temporarily unavailable")]
    Unavailable,
    #[error("upstream call timed out")]
    Timeout,
    /// 5xx or transport failure; counts toward the breaker.
    #[error("upstream failed: {message}")]
    Failed { status: Option<u16>, message: String },
    /// 4xx from the upstream; caller-caused, does not trip the breaker.
    #[error("upstream rejected the request: {message}")]
    Rejected { status: u16, message: String },
    #[error("upstream response violated the completion contract: {0}")]
    Contract(String),
}

/// Correlation headers forwarded to the upstream for log stitching.
pub struct Correlation<'a> {
    pub request_id: Uuid,
    pub principal_id: Uuid,
    pub tier: &'a str,
}

/// Per-model HTTP client with failure isolation. Owns the breaker map and
/// feeds success/failure observations into the health monitor.
pub struct UpstreamClient {
    client: reqwest::Client,
    config: Arc<GatewayConfig>,
    breakers: HashMap<String, CircuitBreaker>,
    health: Arc<HealthMonitor>,
}

impl UpstreamClient {
    pub fn new(config: Arc<GatewayConfig>, health: Arc<HealthMonitor>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_HARD_CAP)
            .build()
            .expect("failed to build upstream client");
        let breakers = config
            .models
            .ids()
            .map(|id| (id.to_string(), CircuitBreaker::new(BreakerConfig::default())))
            .collect();
        Self {
            client,
            config,
            breakers,
            health,
        }
    }

    /// Breaker configuration override; tests shrink the cooldown.
    pub fn with_breaker_config(mut self, breaker: BreakerConfig) -> Self {
        let ids: Vec<String> = self.config.models.ids().map(str::to_string).collect();
        for id in ids {
            self.breakers.insert(id, CircuitBreaker::new(breaker));
        }
        self
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn circuit_state(&self, model_id: &str) -> Option<CircuitState> {
        self.breakers.get(model_id).map(|breaker| breaker.state())
    }

    pub async fn dispatch(
        &self,
        model_id: &str,
        endpoint: UpstreamEndpoint,
        payload: &serde_json::Value,
        correlation: &Correlation<'_>,
        time_budget: Duration,
    ) -> Result<(CompletionEnvelope, Duration), UpstreamError> {
        let model = self
            .config
            .models
            .get(model_id)
            .ok_or_else(|| UpstreamError::UnknownModel(model_id.to_string()))?;

        if !self.health.is_healthy(model_id) {
            return Err(UpstreamError::Unavailable);
        }
        let breaker = self
            .breakers
            .get(model_id)
            .ok_or_else(|| UpstreamError::UnknownModel(model_id.to_string()))?;
        if breaker.try_acquire().is_none() {
            return Err(UpstreamError::Unavailable);
        }

        let url = format!("{}/v1/{}", model.base_url, endpoint.path());
        let mut request = self
            .client
            .post(&url)
            .timeout(time_budget.min(UPSTREAM_HARD_CAP))
            .header("X-Request-ID", correlation.request_id.to_string())
            .header("X-Principal-ID", correlation.principal_id.to_string())
            .header("X-Principal-Tier", correlation.tier)
            .json(payload);
        request = apply_auth(request, &model.auth);

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                breaker.record_failure();
                self.health.mark_failure(model_id);
                if err.is_timeout() {
                    return Err(UpstreamError::Timeout);
                }
                return Err(UpstreamError::Failed {
                    status: None,
                    message: err.to_string(),
                });
            }
        };
        let latency = started.elapsed();

        let status = response.status();
        if status.is_server_error() {
            breaker.record_failure();
            self.health.mark_failure(model_id);
            return Err(UpstreamError::Failed {
                status: Some(status.as_u16()),
                message: format!("upstream returned {status}"),
            });
        }
        if status.is_client_error() {
            // Caller-caused; the upstream answered, so the breaker treats it
            // as liveness (and a half-open probe slot is released).
            breaker.record_success();
            let message = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json::<serde_json::Value>().await.map_err(|err| {
            breaker.record_failure();
            self.health.mark_failure(model_id);
            UpstreamError::Failed {
                status: Some(status.as_u16()),
                message: format!("invalid upstream body: {err}"),
            }
        })?;

        let envelope = match normalize_envelope(body, model, endpoint) {
            Ok(envelope) => envelope,
            Err(err) => {
                breaker.record_failure();
                self.health.mark_failure(model_id);
                return Err(err);
            }
        };
        breaker.record_success();
        self.health.mark_success(model_id, latency);
        Ok((envelope, latency))
    }
}

fn apply_auth(
    request: reqwest::RequestBuilder,
    auth: &UpstreamAuth,
) -> reqwest::RequestBuilder {
    match auth {
        UpstreamAuth::ApiKey { header, key } if !key.is_empty() => request.header(header, key),
        UpstreamAuth::Bearer { token } if !token.is_empty() => request.bearer_auth(token),
        UpstreamAuth::Custom { header, value } if !value.is_empty() => {
            request.header(header, value)
        }
        _ => request,
    }
}

fn normalize_envelope(
    body: serde_json::Value,
    model: &ModelConfig,
    endpoint: UpstreamEndpoint,
) -> Result<CompletionEnvelope, UpstreamError> {
    let mut envelope: CompletionEnvelope = serde_json::from_value(body)
        .map_err(|err| UpstreamError::Contract(err.to_string()))?;
    if envelope.choices.is_empty() {
        warn!(model = %model.id, "Upstream response missing choices");
        return Err(UpstreamError::Contract("missing choices".to_string()));
    }
    if envelope.id.is_empty() {
        envelope.id = format!("cmpl-{}", Uuid::new_v4().simple());
    }
    if envelope.object.is_empty() {
        envelope.object = endpoint.object_name().to_string();
    }
    if envelope.created == 0 {
        envelope.created = chrono::Utc::now().timestamp();
    }
    if envelope.model.is_empty() {
        envelope.model = model.id.clone();
    }
    if envelope.usage.total_tokens == 0 {
        envelope.usage.total_tokens =
            envelope.usage.prompt_tokens + envelope.usage.completion_tokens;
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiers::{TierName, TierTable};

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn validation_enforces_tier_and_model_caps() {
        let tiers = TierTable::default();
        let free = tiers.get(TierName::Free).unwrap();
        let registry = crate::model_registry::ModelRegistry::from_env();
        let model = registry.get("qwen3_42b").unwrap();

        assert!(validate_dispatch(free, model, 32, 100).is_ok());
        assert!(matches!(
            validate_dispatch(free, model, 99_999, 100),
            Err(ValidationError::TokenLimit { cap: 1_024, .. })
        ));

        let moe = registry.get("qwen3_moe").unwrap();
        assert!(matches!(
            validate_dispatch(free, moe, 32, 100),
            Err(ValidationError::ForbiddenModel(_))
        ));
    }

    #[test]
    fn validation_enforces_context_window() {
        let tiers = TierTable::default();
        let free = tiers.get(TierName::Free).unwrap();
        let registry = crate::model_registry::ModelRegistry::from_env();
        let model = registry.get("qwen3_42b").unwrap();
        // free window is 8192; estimate + max_tokens must fit.
        assert!(matches!(
            validate_dispatch(free, model, 1_024, 8_000),
            Err(ValidationError::ContextWindow { window: 8_192, .. })
        ));
    }

    #[test]
    fn envelope_normalization_fills_defaults() {
        let registry = crate::model_registry::ModelRegistry::from_env();
        let model = registry.get("qwen3_42b").unwrap();
        let body = serde_json::json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2}
        });
        let envelope =
            normalize_envelope(body, model, UpstreamEndpoint::ChatCompletions).unwrap();
        assert_eq!(envelope.object, "chat.completion");
        assert_eq!(envelope.model, "qwen3_42b");
        assert_eq!(envelope.usage.total_tokens, 5);
        assert!(envelope.created > 0);
        assert!(envelope.id.starts_with("cmpl-"));
        assert_eq!(envelope.choices[0].content(), "hi");
    }

    #[test]
    fn missing_choices_is_a_contract_error() {
        let registry = crate::model_registry::ModelRegistry::from_env();
        let model = registry.get("qwen3_42b").unwrap();
        let body = serde_json::json!({"usage": {}});
        assert!(matches!(
            normalize_envelope(body, model, UpstreamEndpoint::Completions),
            Err(UpstreamError::Contract(_))
        ));
    }
}
