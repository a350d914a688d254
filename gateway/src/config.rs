use anyhow::{Context, Result};
use std::env;
use std::fs;

use crate::model_registry::ModelRegistry;
use crate::tiers::TierTable;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub api_version: String,
    /// Request-scoped deadline propagated to every downstream call.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct OAuthProviderConfig {
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub user_info_url: String,
    pub scopes: Vec<String>,
    pub redirect_url: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwt_leeway_seconds: u32,
    /// PEM for RS256 signing; absent means the OAuth mint surface is disabled.
    pub jwt_private_key_pem: Option<String>,
    /// PEM for RS256 verification when no JWKS endpoint is configured.
    pub jwt_public_key_pem: Option<String>,
    pub jwt_jwks_url: Option<String>,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub key_cache_ttl_secs: u64,
    pub oauth_providers: Vec<OAuthProviderConfig>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// None selects the in-memory store (dev/test only).
    pub redis_url: Option<String>,
    pub prefix: String,
    pub kv_timeout_ms: u64,
    pub global_per_second: u32,
    pub global_burst: u32,
    pub ip_per_minute: u32,
    /// Per-minute count past which the IP lands in the block set.
    pub ip_blacklist_threshold: u32,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub cors_origins: Vec<String>,
    pub allowed_content_types: Vec<String>,
    pub max_body_bytes: usize,
    pub suspicion_score_threshold: u32,
    pub suspicion_block_ticks: u32,
    pub block_ttl_secs: u64,
    pub min_request_spacing_ms: u64,
    pub mask_pii: bool,
    pub mask_sensitive_keys: bool,
    pub alert_webhook_url: Option<String>,
    pub alert_webhook_bearer: Option<String>,
    pub alert_cooldown_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_json: bool,
    /// Heap usage percentage past which /health reports degraded.
    pub heap_warn_pct: f64,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub security: SecurityConfig,
    pub observability: ObservabilityConfig,
    pub tiers: TierTable,
    pub models: ModelRegistry,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let server = ServerConfig {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8080),
            environment: env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            api_version: env::var("API_VERSION").unwrap_or_else(|_| "v1".to_string()),
            request_timeout_secs: env_parse("GATEWAY_REQUEST_TIMEOUT_SECONDS", 150u64).max(1),
        };

        let jwt_private_key_pem = pem_from_env("JWT_PRIVATE_KEY_PATH", "JWT_DEV_PRIVATE_KEY_PEM")?;
        let jwt_public_key_pem = pem_from_env("JWT_PUBLIC_KEY_PATH", "JWT_DEV_PUBLIC_KEY_PEM")?;

        let auth = AuthConfig {
            jwt_issuer: env::var("JWT_ISSUER")
                .unwrap_or_else(|_| "https://auth.autogram.dev".to_string()),
            jwt_audience: env::var("JWT_AUDIENCE").unwrap_or_else(|_| "autogram-api".to_string()),
            jwt_leeway_seconds: env_parse("JWT_LEEWAY_SECONDS", 30u32),
            jwt_private_key_pem,
            jwt_public_key_pem,
            jwt_jwks_url: env::var("JWT_JWKS_URL").ok(),
            access_ttl_seconds: env_parse("JWT_ACCESS_TTL_SECONDS", 3_600i64).max(60),
            refresh_ttl_seconds: env_parse("JWT_REFRESH_TTL_SECONDS", 2_592_000i64).max(3_600),
            key_cache_ttl_secs: env_parse("API_KEY_CACHE_TTL_SECONDS", 300u64),
            oauth_providers: oauth_providers_from_env(&format!(
                "http://localhost:{}",
                env_parse::<u16>("PORT", 8080)
            )),
        };

        let rate_limit = RateLimitConfig {
            redis_url: redis_url_from_env(),
            prefix: env::var("GATEWAY_RATE_LIMIT_PREFIX")
                .unwrap_or_else(|_| "autogram:rate".to_string()),
            kv_timeout_ms: env_parse("GATEWAY_KV_TIMEOUT_MS", 50u64).min(50).max(1),
            global_per_second: env_parse("GATEWAY_GLOBAL_RPS", 500u32),
            global_burst: env_parse("GATEWAY_GLOBAL_BURST", 100u32),
            ip_per_minute: env_parse("GATEWAY_IP_PER_MINUTE", 120u32),
            ip_blacklist_threshold: env_parse("GATEWAY_IP_BLACKLIST_THRESHOLD", 300u32),
        };

        let security = SecurityConfig {
            cors_origins: env_list(
                "GATEWAY_CORS_ORIGINS",
                &["http://localhost:3000", "http://localhost:5173"],
            ),
            allowed_content_types: env_list(
                "GATEWAY_ALLOWED_CONTENT_TYPES",
                &["application/json", "text/plain", "multipart/form-data"],
            ),
            max_body_bytes: env_parse("GATEWAY_MAX_BODY_BYTES", 1_048_576usize),
            suspicion_score_threshold: env_parse("GATEWAY_SUSPICION_THRESHOLD", 50u32),
            suspicion_block_ticks: env_parse("GATEWAY_SUSPICION_BLOCK_TICKS", 5u32),
            block_ttl_secs: env_parse("GATEWAY_BLOCK_TTL_SECONDS", 86_400u64).max(60),
            min_request_spacing_ms: env_parse("GATEWAY_MIN_REQUEST_SPACING_MS", 1_000u64),
            mask_pii: env_flag("GATEWAY_MASK_PII", true),
            mask_sensitive_keys: env_flag("GATEWAY_MASK_SENSITIVE_KEYS", true),
            alert_webhook_url: env::var("SECURITY_ALERT_WEBHOOK_URL").ok(),
            alert_webhook_bearer: env::var("SECURITY_ALERT_WEBHOOK_BEARER").ok(),
            alert_cooldown_secs: env_parse("SECURITY_ALERT_COOLDOWN_SECONDS", 300u64).max(60),
        };

        let observability = ObservabilityConfig {
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: env_flag("LOG_JSON", true),
            heap_warn_pct: env_parse("GATEWAY_HEAP_WARN_PCT", 85.0f64),
        };

        Ok(Self {
            server,
            auth,
            rate_limit,
            security,
            observability,
            tiers: TierTable::default(),
            models: ModelRegistry::from_env(),
        })
    }

    pub fn is_development(&self) -> bool {
        self.server.environment != "production"
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(var: &str, default: bool) -> bool {
    env::var(var)
        .ok()
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_list(var: &str, defaults: &[&str]) -> Vec<String> {
    env::var(var)
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_else(|| defaults.iter().map(|item| item.to_string()).collect())
}

/// Key material comes from a path in production and may be inlined through a
/// dev-only env var; the dev path is warned about at startup.
fn pem_from_env(path_var: &str, dev_var: &str) -> Result<Option<String>> {
    if let Ok(path) = env::var(path_var) {
        let pem = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {path_var} at {path}"))?;
        return Ok(Some(pem));
    }
    if let Ok(pem) = env::var(dev_var) {
        tracing::warn!("Using {dev_var} for key material; do not enable in production");
        return Ok(Some(pem));
    }
    Ok(None)
}

fn redis_url_from_env() -> Option<String> {
    if let Ok(url) = env::var("REDIS_URL") {
        return Some(url);
    }
    let host = env::var("REDIS_HOST").ok()?;
    let port: u16 = env_parse("REDIS_PORT", 6379);
    let db: u32 = env_parse("REDIS_DB", 0);
    let auth = env::var("REDIS_PASSWORD")
        .map(|password| format!(":{password}@"))
        .unwrap_or_default();
    Some(format!("redis://{auth}{host}:{port}/{db}"))
}

fn oauth_providers_from_env(public_base: &str) -> Vec<OAuthProviderConfig> {
    let mut providers = Vec::new();
    if let (Ok(client_id), Ok(client_secret)) = (
        env::var("OAUTH_GITHUB_CLIENT_ID"),
        env::var("OAUTH_GITHUB_CLIENT_SECRET"),
    ) {
        providers.push(OAuthProviderConfig {
            name: "github".to_string(),
            client_id,
            client_secret,
            auth_url: "https://github.com/login/oauth/authorize".to_string(),
            token_url: "https://github.com/login/oauth/access_token".to_string(),
            user_info_url: "https://api.github.com/user".to_string(),
            scopes: vec!["read:user".to_string(), "user:email".to_string()],
            redirect_url: format!("{public_base}/auth/oauth/github/callback"),
        });
    }
    if let (Ok(client_id), Ok(client_secret)) = (
        env::var("OAUTH_GOOGLE_CLIENT_ID"),
        env::var("OAUTH_GOOGLE_CLIENT_SECRET"),
    ) {
        providers.push(OAuthProviderConfig {
            name: "google".to_string(),
            client_id,
            client_secret,
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            user_info_url: "https://openidconnect.googleapis.com/v1/userinfo".to_string(),
            scopes: vec!["openid".to_string(), "email".to_string(), "profile".to_string()],
            redirect_url: format!("{public_base}/auth/oauth/google/callback"),
        });
    }
    providers
}
