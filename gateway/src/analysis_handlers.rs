use axum::extract::{Extension, State};
use axum::Json;
use common_http_errors::{ApiResult, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::app_state::AppState;
use crate::completion_handlers::{dispatch, parse_body, principal_and_tier, resolve_and_validate};
use crate::context::RequestContext;
use crate::upstream::{estimate_tokens, UpstreamEndpoint, UsageBody};

const ANALYSIS_MAX_TOKENS: u32 = 2_048;
const ANALYSIS_TEMPERATURE: f64 = 0.1;
const ANALYSIS_CONFIDENCE: f64 = 0.95;

const ANALYSIS_TYPES: &[&str] = &["quality", "performance", "maintainability"];
const SCAN_TYPES: &[&str] = &["vulnerability", "injection", "authentication"];

#[derive(Debug, Deserialize)]
pub struct CodeAnalysisRequest {
    pub code: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub analysis_type: Option<String>,
}

#[derive(Serialize)]
pub struct CodeAnalysisResponse {
    pub analysis: String,
    pub language: String,
    pub analysis_type: String,
    pub model: String,
    pub confidence: f64,
    pub usage: UsageBody,
}

#[derive(Debug, Deserialize)]
pub struct SecurityScanRequest {
    pub code: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub scan_type: Option<String>,
}

#[derive(Serialize)]
pub struct SecurityScanResponse {
    pub findings: String,
    pub risk_level: &'static str,
    pub scan_type: String,
    pub model: String,
    pub usage: UsageBody,
}

/// POST /v1/code/analysis — composed prompt against the coder model.
pub async fn code_analysis(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(raw): Json<serde_json::Value>,
) -> ApiResult<Json<CodeAnalysisResponse>> {
    let req: CodeAnalysisRequest = parse_body(&ctx, raw)?;
    let (principal, tier) = principal_and_tier(&state, &ctx)?;
    if req.code.trim().is_empty() {
        return Err(ctx
            .err(ErrorKind::InvalidArgument)
            .with_message("code must not be empty")
            .with_param("code"));
    }
    let analysis_type = pick(&ctx, req.analysis_type, ANALYSIS_TYPES, "analysis_type")?;
    let language = req.language.unwrap_or_else(|| "unknown".to_string());

    let prompt = format!(
        "You are a senior software engineer reviewing {language} code.\n\
         Assess the code below for {analysis_type}. List concrete findings\n\
         with line references and a short improvement for each.\n\n```{language}\n{}\n```",
        req.code
    );

    let model_id = state.config.models.coder_model.clone();
    let estimated = estimate_tokens(&prompt);
    let model = resolve_and_validate(&state, &ctx, tier, &model_id, ANALYSIS_MAX_TOKENS, estimated)?;

    let payload = json!({
        "messages": [{"role": "user", "content": prompt}],
        "max_tokens": ANALYSIS_MAX_TOKENS,
        "temperature": ANALYSIS_TEMPERATURE,
        "top_p": 1.0,
        "n": 1,
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

    let analysis = envelope
        .choices
        .first()
        .map(|choice| choice.content().to_string())
        .unwrap_or_default();
    Ok(Json(CodeAnalysisResponse {
        analysis,
        language,
        analysis_type,
        model: envelope.model,
        confidence: ANALYSIS_CONFIDENCE,
        usage: envelope.usage,
    }))
}

/// POST /v1/security/scan — composed prompt against the red-team model;
/// risk level is a lexical scan of the reply.
pub async fn security_scan(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(raw): Json<serde_json::Value>,
) -> ApiResult<Json<SecurityScanResponse>> {
    let req: SecurityScanRequest = parse_body(&ctx, raw)?;
    let (principal, tier) = principal_and_tier(&state, &ctx)?;
    if req.code.trim().is_empty() {
        return Err(ctx
            .err(ErrorKind::InvalidArgument)
            .with_message("code must not be empty")
            .with_param("code"));
    }
    let scan_type = pick(&ctx, req.scan_type, SCAN_TYPES, "scan_type")?;
    let language = req.language.unwrap_or_else(|| "unknown".to_string());

    let prompt = format!(
        "You are a security analyst performing a {scan_type} review of\n\
         {language} code. Report each issue with its severity (critical,\n\
         high, medium, or low) and a remediation.\n\n```{language}\n{}\n```",
        req.code
    );

    let model_id = state.config.models.redteam_model.clone();
    let estimated = estimate_tokens(&prompt);
    let model = resolve_and_validate(&state, &ctx, tier, &model_id, ANALYSIS_MAX_TOKENS, estimated)?;

    let payload = json!({
        "messages": [{"role": "user", "content": prompt}],
        "max_tokens": ANALYSIS_MAX_TOKENS,
        "temperature": ANALYSIS_TEMPERATURE,
        "top_p": 1.0,
        "n": 1,
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

    let findings = envelope
        .choices
        .first()
        .map(|choice| choice.content().to_string())
        .unwrap_or_default();
    Ok(Json(SecurityScanResponse {
        risk_level: classify_risk(&findings),
        findings,
        scan_type,
        model: envelope.model,
        usage: envelope.usage,
    }))
}

fn pick(
    ctx: &RequestContext,
    requested: Option<String>,
    allowed: &[&str],
    param: &str,
) -> ApiResult<String> {
    let value = requested.unwrap_or_else(|| allowed[0].to_string());
    if allowed.contains(&value.as_str()) {
        Ok(value)
    } else {
        Err(ctx
            .err(ErrorKind::InvalidArgument)
            .with_message(format!("{param} must be one of {allowed:?}"))
            .with_param(param))
    }
}

/// Lexical risk ladder over the model's free-form reply.
pub(crate) fn classify_risk(findings: &str) -> &'static str {
    let lowered = findings.to_lowercase();
    if lowered.contains("critical") || lowered.contains("severe") {
        "critical"
    } else if lowered.contains("high") {
        "high"
    } else if lowered.contains("medium") || lowered.contains("moderate") {
        "medium"
    } else {
        "low"
    }
}
