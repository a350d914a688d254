use std::sync::Arc;
use std::time::Duration;

use autogram_gateway::app::build_router;
use autogram_gateway::app_state::AppState;
use autogram_gateway::config::GatewayConfig;
use autogram_gateway::identity::{IdentityStore, MemoryIdentityStore};
use autogram_gateway::model_registry::ModelRegistry;
use autogram_gateway::tiers::TierName;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use common_kv::MemoryKv;
use tower::util::ServiceExt;
use uuid::Uuid;

pub struct TestGateway {
    pub state: AppState,
    pub router: Router,
    pub identity: Arc<MemoryIdentityStore>,
}

/// Build a gateway wired to the in-memory stores. `base_url` points every
/// model at one fake upstream; `tweak` adjusts config before wiring.
pub async fn gateway_with<F>(base_url: Option<&str>, tweak: F) -> TestGateway
where
    F: FnOnce(&mut GatewayConfig),
{
    let mut config = GatewayConfig::from_env().expect("config");
    if let Some(base) = base_url {
        config.models = ModelRegistry::with_base_url(base);
    }
    tweak(&mut config);
    let config = Arc::new(config);
    let identity = Arc::new(MemoryIdentityStore::new());
    let kv = Arc::new(MemoryKv::new());
    let state = AppState::build(config, kv, identity.clone())
        .await
        .expect("failed to build gateway state");
    let router = build_router(state.clone());
    TestGateway {
        state,
        router,
        identity,
    }
}

pub async fn gateway(base_url: Option<&str>) -> TestGateway {
    gateway_with(base_url, |_| {}).await
}

impl TestGateway {
    /// Seed a key and return (principal id, cleartext secret).
    pub async fn seeded_key(&self, tier: TierName) -> (Uuid, String) {
        let principal = Uuid::new_v4();
        let created = self
            .identity
            .create_key(principal, "test", tier)
            .await
            .expect("failed to seed key");
        (principal, created.cleartext)
    }

    /// Pretend the probe round succeeded for every model.
    pub fn mark_models_healthy(&self) {
        for id in ["qwen3_42b", "qwen3_moe_coder", "qwen3_moe"] {
            self.state.health.mark_success(id, Duration::from_millis(5));
        }
    }

    pub async fn request(&self, req: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(req)
            .await
            .expect("router call failed")
    }

    pub async fn json_request(
        &self,
        method: &str,
        path: &str,
        api_key: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value, axum::http::HeaderMap) {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("User-Agent", "Mozilla/5.0 (integration tests)");
        if let Some(key) = api_key {
            builder = builder.header("X-API-Key", key);
        }
        let request = match body {
            Some(value) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(value.to_string()))
                .expect("request build failed"),
            None => builder.body(Body::empty()).expect("request build failed"),
        };
        let response = self.request(request).await;
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body read failed");
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value, headers)
    }
}
