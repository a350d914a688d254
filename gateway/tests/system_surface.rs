use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use tower::util::ServiceExt;

#[allow(dead_code)]
mod support;

#[tokio::test]
async fn health_reports_unhealthy_until_probes_succeed() {
    let gw = support::gateway(None).await;

    let (status, body, _) = gw.json_request("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["components"]["kv"]["status"], "healthy");

    gw.mark_models_healthy();
    let (status, body, _) = gw.json_request("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert!(body["status"] == "healthy" || body["status"] == "degraded");
    assert_eq!(
        body["components"]["models"]["qwen3_42b"]["status"],
        "healthy"
    );
    assert_eq!(
        body["components"]["models"]["qwen3_42b"]["circuit"],
        "closed"
    );
}

#[tokio::test]
async fn ready_requires_kv_and_one_healthy_model() {
    let gw = support::gateway(None).await;

    let (status, body, _) = gw.json_request("GET", "/ready", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);

    gw.state
        .health
        .mark_success("qwen3_42b", Duration::from_millis(3));
    let (status, body, _) = gw.json_request("GET", "/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn metrics_and_docs_are_unauthenticated() {
    let gw = support::gateway(None).await;

    let response = gw
        .request(
            Request::builder()
                .uri("/metrics")
                .header("User-Agent", "Mozilla/5.0 (integration tests)")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(
        to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap()
            .to_vec(),
    )
    .unwrap();
    assert!(text.contains("http_requests_total") || text.contains("active_connections"));

    let (status, body, _) = gw.json_request("GET", "/openapi.json", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["info"]["title"], "Autogram Gateway");

    let response = gw
        .request(
            Request::builder()
                .uri("/docs")
                .header("User-Agent", "Mozilla/5.0 (integration tests)")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn panics_become_the_internal_error_envelope() {
    async fn boom() -> &'static str {
        panic!("kaboom");
    }
    let app = Router::new()
        .route("/boom", get(boom))
        .layer(axum::middleware::from_fn(
            autogram_gateway::pipeline::recover,
        ));

    let response = app
        .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.headers().get("X-Error-Code").unwrap(),
        "internal-error"
    );
    let body: serde_json::Value = serde_json::from_slice(
        &to_bytes(response.into_body(), 4096).await.unwrap(),
    )
    .unwrap();
    assert_eq!(body["error"], "Internal server error");
    assert!(body["timestamp"].is_string());
}
