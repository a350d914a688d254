use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common_kv::{KvStore, MemoryKv, RedisKv};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use autogram_gateway::app::build_router;
use autogram_gateway::app_state::AppState;
use autogram_gateway::config::GatewayConfig;
use autogram_gateway::identity::{IdentityStore, MemoryIdentityStore, PgIdentityStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(GatewayConfig::from_env()?);

    let kv: Arc<dyn KvStore> = match &config.rate_limit.redis_url {
        Some(url) => {
            let kv = RedisKv::connect(
                url,
                Duration::from_millis(config.rate_limit.kv_timeout_ms),
            )
            .await
            .context("Failed to connect to the rate-limit store")?;
            info!("Connected to Redis rate-limit store");
            Arc::new(kv)
        }
        None => {
            warn!("REDIS_URL not set; using the in-process KV store (single replica only)");
            Arc::new(MemoryKv::new())
        }
    };

    let identity: Arc<dyn IdentityStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .context("Failed to connect to the identity database")?;
            info!("Connected to the identity database");
            Arc::new(PgIdentityStore::new(pool))
        }
        Err(_) => {
            warn!("DATABASE_URL not set; using the in-memory identity store (development only)");
            Arc::new(MemoryIdentityStore::new())
        }
    };

    let state = AppState::build(config.clone(), kv, identity).await?;
    state.spawn_background_workers();

    let app = build_router(state);

    let ip: std::net::IpAddr = config.server.host.parse()?;
    let addr = SocketAddr::from((ip, config.server.port));
    info!(%addr, environment = %config.server.environment, "Starting autogram-gateway");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("invalid LOG_LEVEL filter");
    let json = std::env::var("LOG_JSON")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(true);
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
