use autogram_gateway::config::OAuthProviderConfig;
use axum::http::StatusCode;
use httpmock::prelude::*;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use serde_json::json;

#[allow(dead_code)]
mod support;

fn test_keypair() -> (String, String) {
    let mut rng = rand_core::OsRng;
    let private = RsaPrivateKey::new(&mut rng, 2048).expect("keygen failed");
    let private_pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .expect("private pem")
        .to_string();
    let public_pem = private
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .expect("public pem");
    (private_pem, public_pem)
}

fn github_provider(server: &MockServer) -> OAuthProviderConfig {
    OAuthProviderConfig {
        name: "github".to_string(),
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        auth_url: format!("{}/login/oauth/authorize", server.base_url()),
        token_url: format!("{}/login/oauth/access_token", server.base_url()),
        user_info_url: format!("{}/user", server.base_url()),
        scopes: vec!["read:user".to_string(), "user:email".to_string()],
        redirect_url: "http://localhost:8080/auth/oauth/github/callback".to_string(),
    }
}

#[tokio::test]
async fn redirect_parks_single_use_state() {
    let server = MockServer::start();
    let provider = github_provider(&server);
    let auth_url = provider.auth_url.clone();
    let gw = support::gateway_with(None, move |config| {
        config.auth.oauth_providers = vec![provider];
    })
    .await;

    let (status, _, headers) = gw
        .json_request("GET", "/auth/oauth/github", None, None)
        .await;
    assert_eq!(status, StatusCode::FOUND);
    let location = headers.get("Location").unwrap().to_str().unwrap();
    assert!(location.starts_with(&auth_url));
    let state_param = location
        .split("state=")
        .nth(1)
        .expect("state parameter")
        .split('&')
        .next()
        .unwrap();
    assert_eq!(state_param.len(), 64);

    let stored = gw
        .state
        .kv
        .get(&format!("oauth:state:{state_param}"))
        .await
        .unwrap();
    assert_eq!(stored.as_deref(), Some("github"));
}

#[tokio::test]
async fn callback_mints_tokens_that_authenticate() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/login/oauth/access_token");
        then.status(200)
            .json_body(json!({"access_token": "gh-token", "token_type": "bearer"}));
    });
    server.mock(|when, then| {
        when.method(GET).path("/user");
        then.status(200).json_body(json!({
            "login": "octo",
            "email": "octo@example.com",
            "name": "Octo Cat"
        }));
    });

    let (private_pem, public_pem) = test_keypair();
    let provider = github_provider(&server);
    let gw = support::gateway_with(None, move |config| {
        config.auth.oauth_providers = vec![provider];
        config.auth.jwt_private_key_pem = Some(private_pem);
        config.auth.jwt_public_key_pem = Some(public_pem);
    })
    .await;

    // Park the state the redirect leg would have written.
    gw.state
        .kv
        .set(
            "oauth:state:deadbeef",
            "github",
            std::time::Duration::from_secs(600),
        )
        .await
        .unwrap();

    let (status, body, _) = gw
        .json_request(
            "GET",
            "/auth/oauth/github/callback?code=abc123&state=deadbeef",
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["user"]["email"], "octo@example.com");
    let access = body["access_token"].as_str().unwrap().to_string();
    let refresh = body["refresh_token"].as_str().unwrap().to_string();
    assert!(!access.is_empty());
    assert_ne!(access, refresh);

    // The access token authenticates a protected surface.
    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header("User-Agent", "Mozilla/5.0 (integration tests)")
        .header("Authorization", format!("Bearer {access}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = gw.request(request).await;
    assert_eq!(response.status(), StatusCode::OK);

    // The refresh token must not.
    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header("User-Agent", "Mozilla/5.0 (integration tests)")
        .header("Authorization", format!("Bearer {refresh}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = gw.request(request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn callback_rejects_unknown_state() {
    let server = MockServer::start();
    let provider = github_provider(&server);
    let gw = support::gateway_with(None, move |config| {
        config.auth.oauth_providers = vec![provider];
    })
    .await;

    let (status, body, _) = gw
        .json_request(
            "GET",
            "/auth/oauth/github/callback?code=abc123&state=bogus",
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid-argument");
}

#[tokio::test]
async fn unknown_provider_is_not_found() {
    let gw = support::gateway(None).await;
    let (status, body, _) = gw
        .json_request("GET", "/auth/oauth/gitlab", None, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not-found");
}
