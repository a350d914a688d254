use std::sync::Arc;
use std::time::Duration;

use autogram_gateway::breaker::BreakerConfig;
use autogram_gateway::config::GatewayConfig;
use autogram_gateway::health::HealthMonitor;
use autogram_gateway::model_registry::ModelRegistry;
use autogram_gateway::upstream::{
    Correlation, UpstreamClient, UpstreamEndpoint, UpstreamError,
};
use httpmock::prelude::*;
use serde_json::json;
use uuid::Uuid;

fn client_for(base_url: &str, cooldown: Duration) -> UpstreamClient {
    let mut config = GatewayConfig::from_env().expect("config");
    config.models = ModelRegistry::with_base_url(base_url);
    let config = Arc::new(config);
    let health = Arc::new(HealthMonitor::new(&config.models));
    health.mark_success("qwen3_42b", Duration::from_millis(1));
    UpstreamClient::new(config, health).with_breaker_config(BreakerConfig {
        failure_threshold: 5,
        cooldown,
    })
}

async fn one_call(client: &UpstreamClient) -> Result<(), UpstreamError> {
    let correlation = Correlation {
        request_id: Uuid::new_v4(),
        principal_id: Uuid::new_v4(),
        tier: "free",
    };
    client
        .dispatch(
            "qwen3_42b",
            UpstreamEndpoint::Completions,
            &json!({"prompt": "hi", "max_tokens": 8}),
            &correlation,
            Duration::from_secs(5),
        )
        .await
        .map(|_| ())
}

#[tokio::test]
async fn five_failures_open_then_probe_after_cooldown() {
    let server = MockServer::start();
    let upstream = server.mock(|when, then| {
        when.method(POST).path("/v1/completions");
        then.status(500).body("boom");
    });

    let client = client_for(&server.base_url(), Duration::from_millis(150));

    // Five consecutive 5xx responses, each surfaced and counted.
    for attempt in 0..5 {
        // The health monitor flips red on failure; restore it so the breaker
        // is the component under test.
        client.health().mark_success("qwen3_42b", Duration::from_millis(1));
        let outcome = one_call(&client).await;
        assert!(
            matches!(outcome, Err(UpstreamError::Failed { status: Some(500), .. })),
            "attempt {attempt} should be a 5xx failure"
        );
    }
    assert_eq!(upstream.hits(), 5);

    // Sixth call short-circuits without an outbound POST.
    client.health().mark_success("qwen3_42b", Duration::from_millis(1));
    let outcome = one_call(&client).await;
    assert!(matches!(outcome, Err(UpstreamError::Unavailable)));
    assert_eq!(upstream.hits(), 5);

    // After the cooldown one probe goes out.
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.health().mark_success("qwen3_42b", Duration::from_millis(1));
    let outcome = one_call(&client).await;
    assert!(matches!(outcome, Err(UpstreamError::Failed { .. })));
    assert_eq!(upstream.hits(), 6);
}

#[tokio::test]
async fn client_errors_do_not_trip_the_breaker() {
    let server = MockServer::start();
    let upstream = server.mock(|when, then| {
        when.method(POST).path("/v1/completions");
        then.status(422).body("bad request");
    });

    let client = client_for(&server.base_url(), Duration::from_secs(60));
    for _ in 0..8 {
        client.health().mark_success("qwen3_42b", Duration::from_millis(1));
        let outcome = one_call(&client).await;
        assert!(matches!(
            outcome,
            Err(UpstreamError::Rejected { status: 422, .. })
        ));
    }
    // Every call went out; the circuit never opened.
    assert_eq!(upstream.hits(), 8);
}

#[tokio::test]
async fn probe_success_closes_the_circuit() {
    let server = MockServer::start();
    let mut failing = server.mock(|when, then| {
        when.method(POST).path("/v1/completions");
        then.status(500).body("boom");
    });

    let client = client_for(&server.base_url(), Duration::from_millis(100));
    for _ in 0..5 {
        client.health().mark_success("qwen3_42b", Duration::from_millis(1));
        let _ = one_call(&client).await;
    }
    failing.delete();

    // Upstream recovers.
    let healthy = server.mock(|when, then| {
        when.method(POST).path("/v1/completions");
        then.status(200).json_body(json!({
            "choices": [{"index": 0, "text": "ok", "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        }));
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    client.health().mark_success("qwen3_42b", Duration::from_millis(1));
    let outcome = one_call(&client).await;
    assert!(outcome.is_ok());
    healthy.assert();

    // Circuit is closed again; calls keep flowing.
    let outcome = one_call(&client).await;
    assert!(outcome.is_ok());
}
