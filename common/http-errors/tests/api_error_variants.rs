use axum::body::to_bytes;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use common_http_errors::{ApiError, ErrorKind, RateLimitInfo};
use uuid::Uuid;

#[tokio::test]
async fn tier_token_limit_shape() {
    let request_id = Uuid::new_v4();
    let err = ApiError::new(ErrorKind::TierTokenLimitExceeded)
        .with_message("max_tokens 99999 exceeds tier cap 1024")
        .with_request_id(request_id);
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        resp.headers().get("X-Error-Code").unwrap(),
        "tier-token-limit-exceeded"
    );
    let bytes = to_bytes(resp.into_body(), 4096).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "tier-token-limit-exceeded");
    assert_eq!(body["requestId"], request_id.to_string());
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn rate_limited_carries_retry_headers() {
    let err = ApiError::new(ErrorKind::RateLimitedPrincipal).with_rate(RateLimitInfo {
        limit: 1000,
        remaining: 0,
        reset_unix: 1_700_000_000,
        retry_after_secs: Some(42),
    });
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers().get("X-RateLimit-Limit").unwrap(), "1000");
    assert_eq!(resp.headers().get("X-RateLimit-Remaining").unwrap(), "0");
    assert_eq!(resp.headers().get("Retry-After").unwrap(), "42");
}

#[tokio::test]
async fn auth_statuses() {
    assert_eq!(
        ApiError::new(ErrorKind::CredentialsMissing).status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        ApiError::new(ErrorKind::CredentialsExpired).status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        ApiError::new(ErrorKind::PrincipalSuspended).status(),
        StatusCode::FORBIDDEN
    );
    assert_eq!(
        ApiError::new(ErrorKind::ForbiddenModel).status(),
        StatusCode::FORBIDDEN
    );
    assert_eq!(
        ApiError::new(ErrorKind::UpstreamTimeout).status(),
        StatusCode::GATEWAY_TIMEOUT
    );
}

#[tokio::test]
async fn upstream_unavailable_shape() {
    let resp = ApiError::new(ErrorKind::UpstreamUnavailable).into_response();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let bytes = to_bytes(resp.into_body(), 4096).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "upstream-unavailable");
    assert_eq!(body["type"], "upstream");
}
