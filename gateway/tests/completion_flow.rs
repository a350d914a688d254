use std::time::Duration;

use autogram_gateway::identity::IdentityStore;
use autogram_gateway::tiers::TierName;
use axum::http::StatusCode;
use httpmock::prelude::*;
use serde_json::json;

#[allow(dead_code)]
mod support;

fn chat_reply(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": "qwen3_42b",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
    })
}

#[tokio::test]
async fn chat_completion_happy_path() {
    let server = MockServer::start();
    let upstream = server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).json_body(chat_reply("Hello there!"));
    });

    let gw = support::gateway(Some(&server.base_url())).await;
    gw.mark_models_healthy();
    let (principal, key) = gw.seeded_key(TierName::Free).await;

    let (status, body, headers) = gw
        .json_request(
            "POST",
            "/v1/chat/completions",
            Some(&key),
            Some(json!({
                "model": "qwen3_42b",
                "messages": [{"role": "user", "content": "Say hi."}],
                "max_tokens": 32
            })),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "qwen3_42b");
    let content = body["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(!content.is_empty());
    let prompt = body["usage"]["prompt_tokens"].as_u64().unwrap();
    let completion = body["usage"]["completion_tokens"].as_u64().unwrap();
    assert_eq!(body["usage"]["total_tokens"].as_u64().unwrap(), prompt + completion);
    assert!(headers.get("X-Request-ID").is_some());
    upstream.assert();

    // The authentication bump lands asynchronously.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let keys = gw.identity.list_keys(principal).await.unwrap();
    assert_eq!(keys[0].usage.requests, 1);
    assert_eq!(keys[0].usage.input_tokens, 5);
    assert_eq!(keys[0].usage.output_tokens, 3);
}

#[tokio::test]
async fn tier_token_limit_denies_before_upstream() {
    let server = MockServer::start();
    let upstream = server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).json_body(chat_reply("unused"));
    });

    let gw = support::gateway(Some(&server.base_url())).await;
    gw.mark_models_healthy();
    let (_, key) = gw.seeded_key(TierName::Free).await;

    let (status, body, _) = gw
        .json_request(
            "POST",
            "/v1/chat/completions",
            Some(&key),
            Some(json!({
                "model": "qwen3_42b",
                "messages": [{"role": "user", "content": "Say hi."}],
                "max_tokens": 99_999
            })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "tier-token-limit-exceeded");
    assert_eq!(upstream.hits(), 0);
}

#[tokio::test]
async fn forbidden_model_denies_before_upstream() {
    let server = MockServer::start();
    let upstream = server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).json_body(chat_reply("unused"));
    });

    let gw = support::gateway(Some(&server.base_url())).await;
    gw.mark_models_healthy();
    let (_, key) = gw.seeded_key(TierName::Free).await;

    let (status, body, _) = gw
        .json_request(
            "POST",
            "/v1/chat/completions",
            Some(&key),
            Some(json!({
                "model": "qwen3_moe",
                "messages": [{"role": "user", "content": "Say hi."}],
                "max_tokens": 32
            })),
        )
        .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden-model");
    assert_eq!(upstream.hits(), 0);
}

#[tokio::test]
async fn output_filter_masks_leaked_credentials() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .json_body(chat_reply("your login is password=hunter2 ok"));
    });

    let gw = support::gateway(Some(&server.base_url())).await;
    gw.mark_models_healthy();
    let (_, key) = gw.seeded_key(TierName::Free).await;

    let (status, body, _) = gw
        .json_request(
            "POST",
            "/v1/chat/completions",
            Some(&key),
            Some(json!({
                "messages": [{"role": "user", "content": "Say hi."}],
                "max_tokens": 32
            })),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    let content = body["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(content.contains("[FILTERED]"), "content: {content}");
    assert!(!content.contains("hunter2"));
}

#[tokio::test]
async fn completions_default_to_the_fleet_default_model() {
    let server = MockServer::start();
    let upstream = server.mock(|when, then| {
        when.method(POST).path("/v1/completions");
        then.status(200).json_body(json!({
            "id": "cmpl-9",
            "object": "text_completion",
            "created": 1_700_000_000,
            "model": "qwen3_42b",
            "choices": [{"index": 0, "text": "hello", "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3}
        }));
    });

    let gw = support::gateway(Some(&server.base_url())).await;
    gw.mark_models_healthy();
    let (_, key) = gw.seeded_key(TierName::Free).await;

    let (status, body, _) = gw
        .json_request(
            "POST",
            "/v1/completions",
            Some(&key),
            Some(json!({"prompt": "Say hi.", "max_tokens": 16})),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["object"], "text_completion");
    assert_eq!(body["choices"][0]["text"], "hello");
    upstream.assert();
}

#[tokio::test]
async fn invalid_chat_role_is_rejected() {
    let gw = support::gateway(None).await;
    gw.mark_models_healthy();
    let (_, key) = gw.seeded_key(TierName::Free).await;

    let (status, body, _) = gw
        .json_request(
            "POST",
            "/v1/chat/completions",
            Some(&key),
            Some(json!({
                "messages": [{"role": "oracle", "content": "hm"}],
                "max_tokens": 16
            })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid-argument");
    assert_eq!(body["param"], "messages");
}

#[tokio::test]
async fn unhealthy_model_short_circuits() {
    let server = MockServer::start();
    let upstream = server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).json_body(chat_reply("unused"));
    });

    let gw = support::gateway(Some(&server.base_url())).await;
    // No mark_models_healthy: probes have not succeeded yet.
    let (_, key) = gw.seeded_key(TierName::Free).await;

    let (status, body, _) = gw
        .json_request(
            "POST",
            "/v1/chat/completions",
            Some(&key),
            Some(json!({
                "messages": [{"role": "user", "content": "Say hi."}],
                "max_tokens": 16
            })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "upstream-unavailable");
    assert_eq!(upstream.hits(), 0);
}
