use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use common_http_errors::{ApiError, ErrorKind, RateLimitInfo};
use futures::FutureExt;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionError;
use crate::app_state::AppState;
use crate::authn::AuthnError;
use crate::context::RequestContext;
use crate::metrics::sanitize_endpoint;
use crate::output_filter::filter_response;
use crate::sanitize::{
    check_content_type, sanitize_value, scan_for_malicious, suspicion_score, SecurityError,
    SuspicionInput,
};
use crate::upstream::UpstreamError;

/// Response-body cap when buffering for the output filter.
const FILTER_BODY_LIMIT: usize = 8 * 1024 * 1024;

// ---------------- Stage 1: request identity ----------------

/// Assign or accept `X-Request-ID`, resolve the client IP, and establish the
/// request-scoped deadline. The context rides in request extensions; the id
/// is echoed on every response.
pub async fn assign_context(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("X-Request-ID")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok())
        .unwrap_or_else(Uuid::new_v4);

    let client_ip = resolve_client_ip(&req);
    let ctx = RequestContext::new(
        request_id,
        client_ip,
        Duration::from_secs(state.config.server.request_timeout_secs),
    );
    req.extensions_mut().insert(ctx);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert("X-Request-ID", value);
    }
    response
}

fn resolve_client_ip(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
    {
        for entry in forwarded.split(',') {
            let candidate = entry.trim();
            if let Ok(ip) = candidate.parse::<IpAddr>() {
                if !is_private_ip(&ip) {
                    return ip.to_string();
                }
            }
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

// ---------------- Stage 2 + 8 + 9: observability envelope ----------------

/// Holds the active-connections gauge and records a client-closed request if
/// the response future is dropped before completion.
struct ConnectionGuard {
    state: AppState,
    ctx: RequestContext,
    method: String,
    endpoint: String,
    finished: bool,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.metrics.connection_closed();
        if !self.finished {
            let tier = tier_label(&self.ctx);
            self.state.metrics.record_request(
                &self.method,
                499,
                &self.endpoint,
                &tier,
                self.ctx.started_at.elapsed().as_secs_f64(),
            );
        }
    }
}

/// Outer observability stage: gauge, deadline, output filter, metrics, and
/// the one JSON log line per request.
pub async fn observe(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .expect("request context missing");
    let method = req.method().to_string();
    let raw_path = req.uri().path().to_string();
    let endpoint = sanitize_endpoint(&raw_path);
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_string();

    state.metrics.connection_opened();
    let mut guard = ConnectionGuard {
        state: state.clone(),
        ctx: ctx.clone(),
        method: method.clone(),
        endpoint: endpoint.clone(),
        finished: false,
    };

    let response = match tokio::time::timeout(ctx.time_remaining(), next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            ctx.record_error_kind("upstream-timeout");
            ctx.err(ErrorKind::UpstreamTimeout)
                .with_message("request deadline elapsed")
                .into_response()
        }
    };

    let response = apply_output_filter(&state, response).await;

    let status = response.status().as_u16();
    let duration = ctx.started_at.elapsed();
    let tier = tier_label(&ctx);
    state
        .metrics
        .record_request(&method, status, &endpoint, &tier, duration.as_secs_f64());
    if status >= 400 {
        let code = response
            .headers()
            .get("X-Error-Code")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("unknown");
        let family = if status >= 500 { "server" } else { "client" };
        state.metrics.record_error(family, &endpoint, &tier, code);
    }
    if let (Some(model), Some(latency)) = (ctx.model(), ctx.upstream_latency()) {
        let outcome = if status < 400 { "success" } else { "error" };
        state
            .metrics
            .record_model_latency(&model, &endpoint, outcome, latency.as_secs_f64());
    }
    let (usage, cost) = ctx.usage();
    if usage.total_tokens > 0 {
        if let Some(model) = ctx.model() {
            state
                .metrics
                .record_tokens(&model, "input", &tier, usage.prompt_tokens as u64);
            state
                .metrics
                .record_tokens(&model, "output", &tier, usage.completion_tokens as u64);
        }
    }

    let principal = ctx.principal();
    info!(
        target: "autogram_gateway::request",
        request_id = %ctx.request_id,
        method = %method,
        path = %raw_path,
        status,
        duration_ms = duration.as_millis() as u64,
        principal_id = principal.as_ref().map(|p| p.id.to_string()),
        tier = principal.as_ref().map(|p| p.tier.as_str()),
        ip = %ctx.client_ip,
        user_agent = %user_agent,
        input_tokens = (usage.prompt_tokens > 0).then_some(usage.prompt_tokens),
        output_tokens = (usage.completion_tokens > 0).then_some(usage.completion_tokens),
        cost = (cost > 0.0).then_some(cost),
        "request"
    );

    guard.finished = true;
    drop(guard);
    response
}

fn tier_label(ctx: &RequestContext) -> String {
    ctx.principal()
        .map(|principal| principal.tier.as_str().to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Stage 8: every JSON response body passes through the output filter. The
/// mint surfaces opt out via the `SkipOutputFilter` marker; their bodies ARE
/// the secret being issued.
async fn apply_output_filter(state: &AppState, response: Response) -> Response {
    if response
        .extensions()
        .get::<crate::output_filter::SkipOutputFilter>()
        .is_some()
    {
        return response;
    }
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, FILTER_BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(?err, "Failed to buffer response for output filter");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(mut value) => {
            filter_response(&mut value, &state.config.security);
            let filtered = serde_json::to_vec(&value).unwrap_or_else(|_| bytes.to_vec());
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(filtered))
        }
        Err(_) => Response::from_parts(parts, Body::from(bytes)),
    }
}

// ---------------- Panic recovery ----------------

pub async fn recover(req: Request, next: Next) -> Response {
    let request_id = req
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id);
    match std::panic::AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(?request_id, panic = %detail, "Handler panicked");
            let body = json!({
                "error": "Internal server error",
                "requestId": request_id,
                "timestamp": Utc::now().to_rfc3339(),
            });
            let mut response = (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(body),
            )
                .into_response();
            response
                .headers_mut()
                .insert("X-Error-Code", HeaderValue::from_static("internal-error"));
            response
        }
    }
}

// ---------------- Stage 3: IP block-list gate ----------------

pub async fn ip_gate(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .expect("request context missing");
    if let Some(remaining) = state.suspicion.blocked_remaining(&ctx.client_ip) {
        ctx.record_error_kind("rate-limited-ip");
        let retry_after = remaining.as_secs().max(1);
        return ctx
            .err(ErrorKind::RateLimitedIp)
            .with_message("source address is temporarily blocked")
            .with_rate(RateLimitInfo {
                limit: 0,
                remaining: 0,
                reset_unix: Utc::now().timestamp() + retry_after as i64,
                retry_after_secs: Some(retry_after),
            })
            .into_response();
    }
    next.run(req).await
}

// ---------------- Stage 4: input validation and sanitization ----------------

pub async fn input_filter(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .expect("request context missing");

    let gap = state.suspicion.note_request(&ctx.client_ip);
    let has_body = matches!(*req.method(), Method::POST | Method::PUT | Method::PATCH);

    if has_body {
        if let Err(err) = check_content_type(req.headers(), &state.config.security) {
            return security_error(&ctx, err).into_response();
        }
    }

    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, state.config.security.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            ctx.record_error_kind("input-too-large");
            return ctx
                .err(ErrorKind::InputTooLarge)
                .with_message("request body exceeds the configured limit")
                .into_response();
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("")
        .to_string();
    let body_text = String::from_utf8_lossy(&bytes);
    if let Err(err) = scan_for_malicious(&body_text) {
        note_suspicion(&state, &ctx).await;
        return security_error(&ctx, err).into_response();
    }
    if let Err(err) = scan_for_malicious(&path_and_query) {
        note_suspicion(&state, &ctx).await;
        return security_error(&ctx, err).into_response();
    }

    let score = suspicion_score(
        &SuspicionInput {
            headers: &parts.headers,
            path_and_query: &path_and_query,
            body_len: bytes.len(),
            gap_ms: gap.map(|duration| duration.as_millis() as u64),
        },
        &state.config.security,
    );
    if score > state.config.security.suspicion_score_threshold {
        note_suspicion(&state, &ctx).await;
    }

    let is_json = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/json"))
        .unwrap_or(false);

    let new_body = if has_body && is_json && !bytes.is_empty() {
        match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(mut value) => {
                sanitize_value(&mut value);
                Body::from(serde_json::to_vec(&value).unwrap_or_else(|_| bytes.to_vec()))
            }
            Err(err) => {
                ctx.record_error_kind("invalid-argument");
                return ctx
                    .err(ErrorKind::InvalidArgument)
                    .with_message(format!("request body is not valid JSON: {err}"))
                    .into_response();
            }
        }
    } else {
        Body::from(bytes)
    };

    let mut req = Request::from_parts(parts, new_body);
    req.headers_mut().remove(header::CONTENT_LENGTH);
    next.run(req).await
}

async fn note_suspicion(state: &AppState, ctx: &RequestContext) {
    if state.suspicion.record_tick(&ctx.client_ip) {
        state
            .alerter
            .maybe_alert(
                &format!("block:{}", ctx.client_ip),
                &format!("Blocked IP {} after repeated suspicious requests", ctx.client_ip),
            )
            .await;
    }
}

fn security_error(ctx: &RequestContext, err: SecurityError) -> ApiError {
    match err {
        SecurityError::UnsupportedContentType => {
            ctx.record_error_kind("unsupported-content-type");
            ctx.err(ErrorKind::UnsupportedContentType)
        }
        SecurityError::InputTooLarge => {
            ctx.record_error_kind("input-too-large");
            ctx.err(ErrorKind::InputTooLarge)
        }
        SecurityError::Malicious(pattern) => {
            warn!(ip = %ctx.client_ip, pattern, "Rejected malicious request");
            ctx.record_error_kind("malicious-content");
            ctx.err(ErrorKind::MaliciousContent)
                .with_message("request content was rejected")
        }
    }
}

// ---------------- Stage 5: global + per-IP admission ----------------

pub async fn global_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .expect("request context missing");

    if let Err(err) = state.admission.check_global().await {
        return admission_error(&ctx, err).into_response();
    }
    match state.admission.check_ip(&ctx.client_ip).await {
        Ok(()) => {}
        Err(err) => {
            if let AdmissionError::IpLimited {
                blacklist: true, ..
            } = &err
            {
                state.suspicion.block(&ctx.client_ip);
                state
                    .alerter
                    .maybe_alert(
                        &format!("ip:{}", ctx.client_ip),
                        &format!(
                            "IP {} exceeded the per-minute threshold and was blocked",
                            ctx.client_ip
                        ),
                    )
                    .await;
            }
            return admission_error(&ctx, err).into_response();
        }
    }

    next.run(req).await
}

// ---------------- Stage 7: authenticate + tier limits ----------------

/// Authentication for the protected surfaces; attaches the principal to the
/// shared context.
pub async fn authenticate(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .expect("request context missing");

    match state.authn.authenticate(req.headers()).await {
        Ok(principal) => {
            ctx.set_principal(principal);
            next.run(req).await
        }
        Err(err) => authn_error(&ctx, err).into_response(),
    }
}

/// Tier-scoped admission for `/v1/*`: endpoint allow-list, hourly/daily
/// windows, and the concurrency slot held for the rest of the pipeline.
pub async fn tier_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .expect("request context missing");
    let Some(principal) = ctx.principal() else {
        return ctx.err(ErrorKind::CredentialsMissing).into_response();
    };
    let Some(tier) = state.config.tiers.get(principal.tier) else {
        return ctx
            .err(ErrorKind::Internal)
            .with_message("tier configuration missing")
            .into_response();
    };

    if let Some(endpoint) = endpoint_token(req.uri().path()) {
        if !tier.allows_endpoint(endpoint) {
            ctx.record_error_kind("forbidden-endpoint");
            return ctx
                .err(ErrorKind::ForbiddenEndpoint)
                .with_param(endpoint)
                .into_response();
        }
        if !principal.has_permission(endpoint) {
            ctx.record_error_kind("insufficient-permissions");
            return ctx
                .err(ErrorKind::InsufficientPermissions)
                .with_param(endpoint)
                .into_response();
        }
    }

    if let Err(err) = state.admission.check_principal(principal.id, tier).await {
        return admission_error(&ctx, err).into_response();
    }

    let permit = match state
        .admission
        .acquire_slot(principal.id, tier, ctx.time_remaining())
        .await
    {
        Ok(permit) => permit,
        Err(err) => return admission_error(&ctx, err).into_response(),
    };

    let response = next.run(req).await;
    drop(permit);
    response
}

fn endpoint_token(path: &str) -> Option<&'static str> {
    match path {
        "/v1/models" => Some("models"),
        "/v1/completions" => Some("completions"),
        "/v1/chat/completions" => Some("chat.completions"),
        "/v1/code/analysis" => Some("code.analysis"),
        "/v1/security/scan" => Some("security.scan"),
        "/v1/usage" => Some("usage"),
        _ => None,
    }
}

// ---------------- Error mapping ----------------

pub(crate) fn authn_error(ctx: &RequestContext, err: AuthnError) -> ApiError {
    match err {
        AuthnError::Missing => {
            ctx.record_error_kind("credentials-missing");
            ctx.err(ErrorKind::CredentialsMissing)
        }
        AuthnError::Invalid => {
            ctx.record_error_kind("credentials-invalid");
            ctx.err(ErrorKind::CredentialsInvalid)
        }
        AuthnError::Expired => {
            ctx.record_error_kind("credentials-expired");
            ctx.err(ErrorKind::CredentialsExpired)
        }
        AuthnError::Suspended => {
            ctx.record_error_kind("principal-suspended");
            ctx.err(ErrorKind::PrincipalSuspended)
        }
        AuthnError::UnknownTier(tier) => {
            warn!(tier, "Principal resolved to an unconfigured tier");
            ctx.record_error_kind("internal-error");
            ctx.err(ErrorKind::Internal)
                .with_message("tier configuration missing")
        }
        AuthnError::Store(err) => {
            error!(?err, "Identity store failure during authentication");
            ctx.record_error_kind("internal-error");
            ctx.err(ErrorKind::Internal).with_message(err.to_string())
        }
    }
}

pub(crate) fn admission_error(ctx: &RequestContext, err: AdmissionError) -> ApiError {
    let rate = err.rate_info();
    let kind = match &err {
        AdmissionError::GlobalLimited { .. } => ErrorKind::RateLimitedGlobal,
        AdmissionError::IpLimited { .. } => ErrorKind::RateLimitedIp,
        AdmissionError::PrincipalLimited { .. } => ErrorKind::RateLimitedPrincipal,
        AdmissionError::Concurrency => ErrorKind::ConcurrencyExceeded,
        AdmissionError::Unavailable(inner) => {
            // Fail closed: the store being down denies admission.
            warn!(?inner, "Admission store unreachable; denying request");
            ErrorKind::RateLimitedGlobal
        }
    };
    ctx.record_error_kind(kind.code());
    let mut api = ctx.err(kind);
    if let Some(rate) = rate {
        api = api.with_rate(rate);
    } else if matches!(err, AdmissionError::Unavailable(_)) {
        api = api.with_message("admission temporarily unavailable, retry shortly");
    }
    api
}

pub(crate) fn identity_error(ctx: &RequestContext, err: crate::identity::IdentityError) -> ApiError {
    match err {
        crate::identity::IdentityError::KeyNotFound => {
            ctx.record_error_kind("not-found");
            ctx.err(ErrorKind::NotFound).with_message("api key not found")
        }
        crate::identity::IdentityError::UserNotFound => {
            ctx.record_error_kind("not-found");
            ctx.err(ErrorKind::NotFound).with_message("user not found")
        }
        other => {
            error!(?other, "Identity store failure");
            ctx.record_error_kind("internal-error");
            ctx.err(ErrorKind::Internal).with_message(other.to_string())
        }
    }
}

pub(crate) fn upstream_error(ctx: &RequestContext, err: UpstreamError) -> ApiError {
    match err {
        UpstreamError::UnknownModel(model) => {
            ctx.record_error_kind("invalid-argument");
            ctx.err(ErrorKind::InvalidArgument)
                .with_message(format!("unknown model '{model}'"))
                .with_param("model")
        }
        UpstreamError::Unavailable => {
            ctx.record_error_kind("upstream-unavailable");
            ctx.err(ErrorKind::UpstreamUnavailable)
        }
        UpstreamError::Timeout => {
            ctx.record_error_kind("upstream-timeout");
            ctx.err(ErrorKind::UpstreamTimeout)
        }
        UpstreamError::Failed { status, message } => {
            warn!(?status, message, "Upstream failure");
            ctx.record_error_kind("upstream-error");
            ctx.err(ErrorKind::UpstreamError)
        }
        UpstreamError::Rejected { status, message } => {
            warn!(status, message, "Upstream rejected request");
            ctx.record_error_kind("upstream-error");
            ctx.err(ErrorKind::UpstreamError)
                .with_message("upstream rejected the request")
        }
        UpstreamError::Contract(detail) => {
            error!(detail, "Upstream contract violation");
            ctx.record_error_kind("upstream-error");
            ctx.err(ErrorKind::UpstreamError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_tokens_cover_the_v1_surface() {
        assert_eq!(endpoint_token("/v1/models"), Some("models"));
        assert_eq!(
            endpoint_token("/v1/chat/completions"),
            Some("chat.completions")
        );
        assert_eq!(endpoint_token("/v1/security/scan"), Some("security.scan"));
        assert_eq!(endpoint_token("/health"), None);
    }

    #[test]
    fn private_forwarded_entries_are_skipped() {
        let req = Request::builder()
            .uri("/v1/models")
            .header("X-Forwarded-For", "10.0.0.1, 203.0.113.7")
            .body(Body::empty())
            .unwrap();
        assert_eq!(resolve_client_ip(&req), "203.0.113.7");
    }

    #[test]
    fn missing_forwarding_falls_back_to_peer() {
        let mut req = Request::builder()
            .uri("/v1/models")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([198, 51, 100, 4], 9000))));
        assert_eq!(resolve_client_ip(&req), "198.51.100.4");
    }
}
