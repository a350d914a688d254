use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::analysis_handlers::{code_analysis, security_scan};
use crate::app_state::AppState;
use crate::completion_handlers::{chat_completions, completions, list_models};
use crate::key_handlers::{create_key, list_keys, revoke_key};
use crate::oauth_handlers::{oauth_callback, oauth_redirect};
use crate::pipeline::{
    assign_context, authenticate, global_limit, input_filter, ip_gate, observe, recover,
    tier_limit,
};
use crate::system_handlers::{docs, health, metrics_endpoint, not_found, openapi, ready};
use crate::usage_handlers::usage_report;

/// Build the full gateway router. Layer order is the §pipeline contract:
/// request id → observability envelope → panic recovery → IP gate → input
/// filter → global limits → route match; `/v1/*` adds authenticate → tier
/// limits before the handler.
pub fn build_router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/v1/models", get(list_models))
        .route("/v1/completions", post(completions))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/code/analysis", post(code_analysis))
        .route("/v1/security/scan", post(security_scan))
        .route("/v1/usage", get(usage_report))
        .layer(middleware::from_fn_with_state(state.clone(), tier_limit))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate));

    let keys = Router::new()
        .route("/auth/api-keys", post(create_key).get(list_keys))
        .route("/auth/api-keys/:id", delete(revoke_key))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate));

    let oauth = Router::new()
        .route("/auth/oauth/:provider", get(oauth_redirect))
        .route("/auth/oauth/:provider/callback", get(oauth_callback));

    let system = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics_endpoint))
        .route("/docs", get(docs))
        .route("/openapi.json", get(openapi));

    Router::new()
        .merge(v1)
        .merge(keys)
        .merge(oauth)
        .merge(system)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), global_limit))
        .layer(middleware::from_fn_with_state(state.clone(), input_filter))
        .layer(middleware::from_fn_with_state(state.clone(), ip_gate))
        .layer(middleware::from_fn(recover))
        .layer(middleware::from_fn_with_state(state.clone(), observe))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            assign_context,
        ))
        .layer(cors_layer(&state))
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            state
                .config
                .security
                .cors_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            ACCEPT,
            CONTENT_TYPE,
            HeaderName::from_static("authorization"),
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-request-id"),
        ])
}
