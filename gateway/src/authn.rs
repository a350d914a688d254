use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap};
use chrono::Utc;
use common_auth::JwtVerifier;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::context::Principal;
use crate::identity::{secret_lookup_digest, ApiKey, IdentityError, IdentityStore};

pub type AuthnResult<T> = Result<T, AuthnError>;

#[derive(Debug, Error)]
pub enum AuthnError {
    #[error("no credentials presented")]
    Missing,
    #[error("credentials are invalid")]
    Invalid,
    #[error("credentials have expired")]
    Expired,
    #[error("principal is suspended")]
    Suspended,
    #[error("principal tier '{0}' is not configured")]
    UnknownTier(String),
    #[error("identity store failure: {0}")]
    Store(#[from] IdentityError),
}

/// Cache of successful API-key verifications. Indexed by the SHA-256 digest
/// of the presented secret, never the cleartext; entries expire after a short
/// TTL and are dropped when the key is mutated.
pub struct KeyCache {
    ttl: Duration,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    digest_by_key: HashMap<Uuid, String>,
}

struct CacheEntry {
    key: ApiKey,
    inserted_at: Instant,
}

impl KeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn get(&self, digest: &str) -> Option<ApiKey> {
        let mut guard = self.inner.lock().expect("key cache poisoned");
        let fresh = match guard.entries.get(digest) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => true,
            Some(_) => false,
            None => return None,
        };
        if !fresh {
            if let Some(entry) = guard.entries.remove(digest) {
                guard.digest_by_key.remove(&entry.key.id);
            }
            return None;
        }
        guard.entries.get(digest).map(|entry| entry.key.clone())
    }

    fn insert(&self, digest: String, key: ApiKey) {
        let mut guard = self.inner.lock().expect("key cache poisoned");
        guard.digest_by_key.insert(key.id, digest.clone());
        guard.entries.insert(
            digest,
            CacheEntry {
                key,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop the cached verification for a mutated key.
    pub fn invalidate(&self, key_id: Uuid) {
        let mut guard = self.inner.lock().expect("key cache poisoned");
        if let Some(digest) = guard.digest_by_key.remove(&key_id) {
            guard.entries.remove(&digest);
        }
    }

    /// Usage bumps do not invalidate the verification; the cached record is
    /// refreshed in place so listings observed through the cache stay current.
    pub fn apply_usage(&self, key_id: Uuid, requests: u64, input: u64, output: u64, cost: f64) {
        let mut guard = self.inner.lock().expect("key cache poisoned");
        let Some(digest) = guard.digest_by_key.get(&key_id).cloned() else {
            return;
        };
        if let Some(entry) = guard.entries.get_mut(&digest) {
            entry.key.usage.requests += requests;
            entry.key.usage.input_tokens += input;
            entry.key.usage.output_tokens += output;
            entry.key.usage.cost += cost;
            entry.key.last_used = Some(Utc::now());
        }
    }
}

/// Resolves the caller identity for each request. Credential order is fixed:
/// `X-API-Key` wins over `Authorization: Bearer`; anything else is rejected.
pub struct Authenticator {
    store: Arc<dyn IdentityStore>,
    verifier: Option<Arc<JwtVerifier>>,
    config: Arc<GatewayConfig>,
    cache: Arc<KeyCache>,
}

impl Authenticator {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        verifier: Option<Arc<JwtVerifier>>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        let cache = Arc::new(KeyCache::new(Duration::from_secs(
            config.auth.key_cache_ttl_secs,
        )));
        Self {
            store,
            verifier,
            config,
            cache,
        }
    }

    pub fn cache(&self) -> Arc<KeyCache> {
        self.cache.clone()
    }

    pub fn verifier(&self) -> Option<Arc<JwtVerifier>> {
        self.verifier.clone()
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> AuthnResult<Principal> {
        if let Some(secret) = headers.get("X-API-Key").and_then(|value| value.to_str().ok()) {
            return self.authenticate_api_key(secret.trim()).await;
        }

        if let Some(value) = headers.get(header::AUTHORIZATION) {
            let token = parse_bearer(value)?;
            return self.authenticate_bearer(&token).await;
        }

        Err(AuthnError::Missing)
    }

    async fn authenticate_api_key(&self, secret: &str) -> AuthnResult<Principal> {
        if secret.is_empty() {
            return Err(AuthnError::Missing);
        }

        let digest = secret_lookup_digest(secret);
        let key = match self.cache.get(&digest) {
            Some(key) => key,
            None => {
                let key = self
                    .store
                    .lookup_key_by_secret(secret)
                    .await?
                    .ok_or(AuthnError::Invalid)?;
                self.cache.insert(digest, key.clone());
                key
            }
        };

        if !key.active {
            return Err(AuthnError::Invalid);
        }
        if key.is_expired(Utc::now()) {
            return Err(AuthnError::Expired);
        }
        if self.config.tiers.get(key.tier).is_none() {
            return Err(AuthnError::UnknownTier(key.tier.to_string()));
        }

        // Count the authentication now; token deltas follow when the handler
        // completes. Fire-and-forget so the hot path never waits on the store.
        {
            let store = self.store.clone();
            let cache = self.cache.clone();
            let key_id = key.id;
            tokio::spawn(async move {
                if let Err(err) = store.bump_usage(key_id, 1, 0, 0, 0.0).await {
                    warn!(?err, key_id = %key_id, "Failed to bump key usage");
                }
                cache.apply_usage(key_id, 1, 0, 0, 0.0);
            });
        }

        Ok(Principal {
            id: key.principal_id,
            email: None,
            tier: key.tier,
            api_key_id: Some(key.id),
            permissions: key.permissions.clone(),
        })
    }

    async fn authenticate_bearer(&self, token: &str) -> AuthnResult<Principal> {
        let verifier = self.verifier.as_ref().ok_or(AuthnError::Invalid)?;
        let claims = verifier.verify(token).map_err(|err| match err {
            common_auth::AuthError::Expired => AuthnError::Expired,
            other => {
                warn!(error = %other, "JWT verification failed");
                AuthnError::Invalid
            }
        })?;
        if claims.is_refresh() {
            return Err(AuthnError::Invalid);
        }

        let user = self
            .store
            .find_user(claims.subject)
            .await?
            .ok_or(AuthnError::Invalid)?;
        if !user.active {
            return Err(AuthnError::Suspended);
        }
        if self.config.tiers.get(user.tier).is_none() {
            return Err(AuthnError::UnknownTier(user.tier.to_string()));
        }

        let permissions = if claims.scope.is_empty() {
            vec!["*".to_string()]
        } else {
            claims.scope.clone()
        };

        Ok(Principal {
            id: user.id,
            email: Some(user.email),
            tier: user.tier,
            api_key_id: None,
            permissions,
        })
    }
}

fn parse_bearer(value: &axum::http::HeaderValue) -> AuthnResult<String> {
    let raw = value.to_str().map_err(|_| AuthnError::Invalid)?.trim();
    let token = raw
        .strip_prefix("Bearer ")
        .ok_or(AuthnError::Invalid)?
        .trim();
    if token.is_empty() {
        return Err(AuthnError::Invalid);
    }
    Ok(token.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryIdentityStore;
    use crate::tiers::TierName;

    fn test_config() -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig::from_env().expect("config"))
    }

    #[tokio::test]
    async fn api_key_wins_over_bearer() {
        let store = Arc::new(MemoryIdentityStore::new());
        let principal_id = Uuid::new_v4();
        let created = store
            .create_key(principal_id, "ci", TierName::Free)
            .await
            .unwrap();
        let authn = Authenticator::new(store, None, test_config());

        let mut headers = HeaderMap::new();
        headers.insert("X-API-Key", created.cleartext.parse().unwrap());
        headers.insert(header::AUTHORIZATION, "Bearer not-a-jwt".parse().unwrap());

        let principal = authn.authenticate(&headers).await.unwrap();
        assert_eq!(principal.id, principal_id);
        assert_eq!(principal.api_key_id, Some(created.key.id));
        assert_eq!(principal.tier, TierName::Free);
    }

    #[tokio::test]
    async fn missing_credentials_rejected() {
        let store = Arc::new(MemoryIdentityStore::new());
        let authn = Authenticator::new(store, None, test_config());
        let outcome = authn.authenticate(&HeaderMap::new()).await;
        assert!(matches!(outcome, Err(AuthnError::Missing)));
    }

    #[tokio::test]
    async fn revoked_key_is_invalid_after_cache_eviction() {
        let store = Arc::new(MemoryIdentityStore::new());
        let principal_id = Uuid::new_v4();
        let created = store
            .create_key(principal_id, "ci", TierName::Free)
            .await
            .unwrap();
        let authn = Authenticator::new(store.clone(), None, test_config());

        let mut headers = HeaderMap::new();
        headers.insert("X-API-Key", created.cleartext.parse().unwrap());
        authn.authenticate(&headers).await.unwrap();

        store.revoke_key(principal_id, created.key.id).await.unwrap();
        authn.cache().invalidate(created.key.id);

        let outcome = authn.authenticate(&headers).await;
        assert!(matches!(outcome, Err(AuthnError::Invalid)));
    }

    #[tokio::test]
    async fn unknown_secret_is_invalid() {
        let store = Arc::new(MemoryIdentityStore::new());
        let authn = Authenticator::new(store, None, test_config());
        let mut headers = HeaderMap::new();
        headers.insert("X-API-Key", "autogram_sk_test_nope".parse().unwrap());
        let outcome = authn.authenticate(&headers).await;
        assert!(matches!(outcome, Err(AuthnError::Invalid)));
    }
}
