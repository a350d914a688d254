use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use common_auth::{JwtVerifier, KeySource, VerifyOptions};
use common_kv::KvStore;
use reqwest::Client;
use tracing::{info, warn};

use crate::admission::AdmissionController;
use crate::alerts::SecurityAlerter;
use crate::authn::Authenticator;
use crate::config::GatewayConfig;
use crate::health::HealthMonitor;
use crate::identity::IdentityStore;
use crate::metrics::GatewayMetrics;
use crate::suspicion::SuspicionTracker;
use crate::tokens::{TokenConfig, TokenSigner};
use crate::upstream::UpstreamClient;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub kv: Arc<dyn KvStore>,
    pub identity: Arc<dyn IdentityStore>,
    pub authn: Arc<Authenticator>,
    pub admission: Arc<AdmissionController>,
    pub upstream: Arc<UpstreamClient>,
    pub health: Arc<HealthMonitor>,
    pub suspicion: Arc<SuspicionTracker>,
    pub metrics: Arc<GatewayMetrics>,
    pub alerter: Arc<SecurityAlerter>,
    pub signer: Option<Arc<TokenSigner>>,
    pub http_client: Client,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the gateway from its parts. Background workers are NOT spawned
    /// here; `spawn_background_workers` starts them once the caller is ready.
    pub async fn build(
        config: Arc<GatewayConfig>,
        kv: Arc<dyn KvStore>,
        identity: Arc<dyn IdentityStore>,
    ) -> Result<Self> {
        let verifier = build_verifier(&config).await?;
        let authn = Arc::new(Authenticator::new(
            identity.clone(),
            verifier,
            config.clone(),
        ));
        let admission = Arc::new(AdmissionController::new(kv.clone(), config.clone()));
        let health = Arc::new(HealthMonitor::new(&config.models));
        let upstream = Arc::new(UpstreamClient::new(config.clone(), health.clone()));
        let suspicion = Arc::new(SuspicionTracker::new(
            config.security.suspicion_block_ticks,
            Duration::from_secs(config.security.block_ttl_secs),
        ));
        let metrics = Arc::new(GatewayMetrics::new()?);
        let http_client = Client::new();
        let alerter = Arc::new(SecurityAlerter::new(http_client.clone(), &config.security));
        let signer = build_signer(&config)?;

        Ok(Self {
            config,
            kv,
            identity,
            authn,
            admission,
            upstream,
            health,
            suspicion,
            metrics,
            alerter,
            signer,
            http_client,
            started_at: Instant::now(),
        })
    }

    /// Start the long-lived workers: per-model health prober, the
    /// suspicion/block-set janitor, and the JWKS refresher when configured.
    pub fn spawn_background_workers(&self) {
        self.health.spawn_prober(self.config.models.clone());
        self.suspicion.spawn_janitor();
        if let Some(verifier) = self.authn.verifier() {
            let refresh_secs = std::env::var("JWKS_REFRESH_SECONDS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(300);
            verifier.spawn_refresh(Duration::from_secs(refresh_secs));
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

async fn build_verifier(config: &GatewayConfig) -> Result<Option<Arc<JwtVerifier>>> {
    let mut sources = Vec::new();
    if let Some(url) = &config.auth.jwt_jwks_url {
        info!(jwks_url = %url, "Configuring JWKS key source");
        sources.push(KeySource::Jwks(url.clone()));
    }
    if let Some(pem) = &config.auth.jwt_public_key_pem {
        sources.push(KeySource::StaticPem {
            kid: "gateway".to_string(),
            pem: pem.as_bytes().to_vec(),
        });
    }
    if sources.is_empty() {
        warn!("No JWT verification key configured; bearer tokens will be rejected");
        return Ok(None);
    }

    let options = VerifyOptions::new(
        config.auth.jwt_issuer.clone(),
        config.auth.jwt_audience.clone(),
    )
    .with_leeway(config.auth.jwt_leeway_seconds);
    let verifier = JwtVerifier::from_sources(options, sources)
        .await
        .map_err(anyhow::Error::from)?;
    info!("JWT verifier initialised");
    Ok(Some(Arc::new(verifier)))
}

fn build_signer(config: &GatewayConfig) -> Result<Option<Arc<TokenSigner>>> {
    let Some(pem) = &config.auth.jwt_private_key_pem else {
        warn!("No JWT signing key configured; OAuth token mint is disabled");
        return Ok(None);
    };
    let signer = TokenSigner::from_pem(
        TokenConfig {
            issuer: config.auth.jwt_issuer.clone(),
            audience: config.auth.jwt_audience.clone(),
            access_ttl_seconds: config.auth.access_ttl_seconds,
            refresh_ttl_seconds: config.auth.refresh_ttl_seconds,
        },
        "gateway",
        pem,
    )?;
    Ok(Some(Arc::new(signer)))
}
