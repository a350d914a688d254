use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use regex::Regex;

static UUID_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("pattern")
});
static NUMERIC_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("pattern"));

/// Collapse high-cardinality path segments before they become label values:
/// UUIDs, numeric ids, and 20+-char opaque tokens.
pub fn sanitize_endpoint(path: &str) -> String {
    let sanitized: Vec<String> = path
        .split('/')
        .map(|segment| {
            if UUID_SEGMENT.is_match(segment) {
                ":uuid".to_string()
            } else if NUMERIC_SEGMENT.is_match(segment) {
                ":id".to_string()
            } else if segment.len() >= 20 {
                ":token".to_string()
            } else {
                segment.to_string()
            }
        })
        .collect();
    sanitized.join("/")
}

#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    http_requests: IntCounterVec,
    errors: IntCounterVec,
    http_duration: HistogramVec,
    model_latency: HistogramVec,
    token_usage: IntCounterVec,
    active_connections: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests handled"),
            &["method", "status", "endpoint", "tier"],
        )?;
        registry.register(Box::new(http_requests.clone()))?;

        let errors = IntCounterVec::new(
            Opts::new("errors_total", "Total error responses emitted"),
            &["type", "endpoint", "tier", "code"],
        )?;
        registry.register(Box::new(errors.clone()))?;

        let http_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.015, 0.05, 0.1, 0.2, 0.3, 0.4, 0.5, 1.0, 2.0, 5.0,
            ]),
            &["method", "status", "endpoint", "tier"],
        )?;
        registry.register(Box::new(http_duration.clone()))?;

        let model_latency = HistogramVec::new(
            HistogramOpts::new("model_latency_seconds", "Upstream model call latency")
                .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["model", "operation", "status"],
        )?;
        registry.register(Box::new(model_latency.clone()))?;

        let token_usage = IntCounterVec::new(
            Opts::new("token_usage_total", "Tokens processed grouped by direction"),
            &["model", "type", "tier"],
        )?;
        registry.register(Box::new(token_usage.clone()))?;

        let active_connections =
            IntGauge::with_opts(Opts::new("active_connections", "Requests currently in flight"))?;
        registry.register(Box::new(active_connections.clone()))?;

        Ok(Self {
            registry,
            http_requests,
            errors,
            http_duration,
            model_latency,
            token_usage,
            active_connections,
        })
    }

    pub fn record_request(
        &self,
        method: &str,
        status: u16,
        endpoint: &str,
        tier: &str,
        duration_secs: f64,
    ) {
        let status = status.to_string();
        self.http_requests
            .with_label_values(&[method, &status, endpoint, tier])
            .inc();
        self.http_duration
            .with_label_values(&[method, &status, endpoint, tier])
            .observe(duration_secs);
    }

    pub fn record_error(&self, family: &str, endpoint: &str, tier: &str, code: &str) {
        self.errors
            .with_label_values(&[family, endpoint, tier, code])
            .inc();
    }

    pub fn record_model_latency(&self, model: &str, operation: &str, status: &str, secs: f64) {
        self.model_latency
            .with_label_values(&[model, operation, status])
            .observe(secs);
    }

    pub fn record_tokens(&self, model: &str, direction: &str, tier: &str, count: u64) {
        self.token_usage
            .with_label_values(&[model, direction, tier])
            .inc_by(count);
    }

    pub fn connection_opened(&self) {
        self.active_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.active_connections.dec();
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.get()
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_labels_are_sanitized() {
        assert_eq!(
            sanitize_endpoint("/auth/api-keys/8c2b0f0e-8f2a-4c3b-9d2e-1a2b3c4d5e6f"),
            "/auth/api-keys/:uuid"
        );
        assert_eq!(sanitize_endpoint("/users/12345/keys"), "/users/:id/keys");
        assert_eq!(
            sanitize_endpoint("/auth/oauth/github/callback"),
            "/auth/oauth/github/callback"
        );
        assert_eq!(
            sanitize_endpoint("/v1/resources/autogram_sk_test_1234567890abcdef"),
            "/v1/resources/:token"
        );
    }

    #[test]
    fn gauge_tracks_open_connections() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        assert_eq!(metrics.active_connections(), 1);
    }

    #[test]
    fn render_produces_prometheus_text() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.record_request("POST", 200, "/v1/completions", "free", 0.05);
        metrics.record_tokens("qwen3_42b", "input", "free", 12);
        let response = metrics.render().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
