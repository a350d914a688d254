use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::tiers::TierName;

const SECRET_PREFIX: &str = "autogram_sk";
const KEY_LIFETIME_DAYS: i64 = 90;

pub type IdentityResult<T> = Result<T, IdentityError>;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity store query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("secret hashing failed: {0}")]
    Hash(String),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
    #[error("api key not found")]
    KeyNotFound,
    #[error("user not found")]
    UserNotFound,
}

/// Monotonic per-key tally. Only ever added to.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyUsage {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub name: String,
    /// Argon2id hash of the full secret; the cleartext is never stored.
    pub hashed_secret: String,
    /// Last four characters of the cleartext, kept for display masking.
    pub secret_suffix: String,
    pub tier: TierName,
    pub permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub usage: KeyUsage,
    pub active: bool,
}

impl ApiKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    /// Display-only mask, e.g. `autogram_sk_test_…cdef`.
    pub fn masked(&self) -> String {
        format!(
            "{}_{}_…{}",
            SECRET_PREFIX,
            self.tier.key_marker(),
            self.secret_suffix
        )
    }
}

/// Result of key creation; the only place the cleartext secret ever appears.
pub struct CreatedKey {
    pub key: ApiKey,
    pub cleartext: String,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub tier: TierName,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Abstract store for users and API keys. The gateway owns no persistence of
/// its own; implementations decide where the records live.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Resolve a presented secret to its key record. Returns the record even
    /// when inactive or expired; the authenticator classifies those rejections.
    async fn lookup_key_by_secret(&self, cleartext: &str) -> IdentityResult<Option<ApiKey>>;

    async fn create_key(
        &self,
        principal_id: Uuid,
        name: &str,
        tier: TierName,
    ) -> IdentityResult<CreatedKey>;

    async fn list_keys(&self, principal_id: Uuid) -> IdentityResult<Vec<ApiKey>>;

    /// Idempotent: marks the key inactive, never deletes history.
    async fn revoke_key(&self, principal_id: Uuid, key_id: Uuid) -> IdentityResult<()>;

    /// Monotonic add; also refreshes `last_used`.
    async fn bump_usage(
        &self,
        key_id: Uuid,
        requests: u64,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    ) -> IdentityResult<()>;

    async fn upsert_user_by_email(&self, email: &str, name: &str) -> IdentityResult<User>;

    async fn find_user(&self, id: Uuid) -> IdentityResult<Option<User>>;
}

/// SHA-256 digest of the presented secret; used as the lookup index so the
/// store never needs a cleartext-keyed structure.
pub fn secret_lookup_digest(cleartext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cleartext.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_secret(tier: TierName) -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    format!(
        "{}_{}_{}",
        SECRET_PREFIX,
        tier.key_marker(),
        URL_SAFE_NO_PAD.encode(bytes)
    )
}

fn hash_secret(cleartext: &str) -> IdentityResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(cleartext.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| IdentityError::Hash(err.to_string()))
}

/// Constant-time verification of a presented secret against the stored hash.
pub fn verify_secret(cleartext: &str, hashed: &str) -> IdentityResult<bool> {
    let parsed = PasswordHash::new(hashed).map_err(|err| IdentityError::Hash(err.to_string()))?;
    Ok(Argon2::default()
        .verify_password(cleartext.as_bytes(), &parsed)
        .is_ok())
}

fn build_key(principal_id: Uuid, name: &str, tier: TierName) -> IdentityResult<(ApiKey, String)> {
    let cleartext = generate_secret(tier);
    let now = Utc::now();
    let key = ApiKey {
        id: Uuid::new_v4(),
        principal_id,
        name: name.to_string(),
        hashed_secret: hash_secret(&cleartext)?,
        secret_suffix: cleartext[cleartext.len() - 4..].to_string(),
        tier,
        permissions: vec!["*".to_string()],
        created_at: now,
        expires_at: Some(now + Duration::days(KEY_LIFETIME_DAYS)),
        last_used: None,
        usage: KeyUsage::default(),
        active: true,
    };
    Ok((key, cleartext))
}

// ---------------- In-Memory Implementation (tests, single process) ----------------

#[derive(Default)]
struct MemoryInner {
    users: HashMap<Uuid, User>,
    users_by_email: HashMap<String, Uuid>,
    keys: HashMap<Uuid, ApiKey>,
    lookup: HashMap<String, Uuid>,
}

#[derive(Clone, Default)]
pub struct MemoryIdentityStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user directly; test setup helper.
    pub async fn insert_user(&self, user: User) {
        let mut guard = self.inner.lock().await;
        guard.users_by_email.insert(user.email.clone(), user.id);
        guard.users.insert(user.id, user);
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn lookup_key_by_secret(&self, cleartext: &str) -> IdentityResult<Option<ApiKey>> {
        let digest = secret_lookup_digest(cleartext);
        let guard = self.inner.lock().await;
        let Some(key_id) = guard.lookup.get(&digest) else {
            return Ok(None);
        };
        let Some(key) = guard.keys.get(key_id) else {
            return Ok(None);
        };
        if !verify_secret(cleartext, &key.hashed_secret)? {
            return Ok(None);
        }
        Ok(Some(key.clone()))
    }

    async fn create_key(
        &self,
        principal_id: Uuid,
        name: &str,
        tier: TierName,
    ) -> IdentityResult<CreatedKey> {
        let (key, cleartext) = build_key(principal_id, name, tier)?;
        let mut guard = self.inner.lock().await;
        guard
            .lookup
            .insert(secret_lookup_digest(&cleartext), key.id);
        guard.keys.insert(key.id, key.clone());
        info!(principal_id = %principal_id, key_id = %key.id, "Created API key");
        Ok(CreatedKey { key, cleartext })
    }

    async fn list_keys(&self, principal_id: Uuid) -> IdentityResult<Vec<ApiKey>> {
        let guard = self.inner.lock().await;
        let mut keys: Vec<ApiKey> = guard
            .keys
            .values()
            .filter(|key| key.principal_id == principal_id)
            .cloned()
            .collect();
        keys.sort_by_key(|key| key.created_at);
        Ok(keys)
    }

    async fn revoke_key(&self, principal_id: Uuid, key_id: Uuid) -> IdentityResult<()> {
        let mut guard = self.inner.lock().await;
        match guard.keys.get_mut(&key_id) {
            Some(key) if key.principal_id == principal_id => {
                key.active = false;
                info!(principal_id = %principal_id, key_id = %key_id, "Revoked API key");
                Ok(())
            }
            _ => Err(IdentityError::KeyNotFound),
        }
    }

    async fn bump_usage(
        &self,
        key_id: Uuid,
        requests: u64,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    ) -> IdentityResult<()> {
        let mut guard = self.inner.lock().await;
        let key = guard
            .keys
            .get_mut(&key_id)
            .ok_or(IdentityError::KeyNotFound)?;
        key.usage.requests += requests;
        key.usage.input_tokens += input_tokens;
        key.usage.output_tokens += output_tokens;
        key.usage.cost += cost;
        key.last_used = Some(Utc::now());
        Ok(())
    }

    async fn upsert_user_by_email(&self, email: &str, name: &str) -> IdentityResult<User> {
        let mut guard = self.inner.lock().await;
        if let Some(user_id) = guard.users_by_email.get(email).copied() {
            let user = guard
                .users
                .get_mut(&user_id)
                .ok_or(IdentityError::UserNotFound)?;
            user.name = name.to_string();
            return Ok(user.clone());
        }
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: name.to_string(),
            tier: TierName::Free,
            active: true,
            created_at: Utc::now(),
        };
        guard.users_by_email.insert(email.to_string(), user.id);
        guard.users.insert(user.id, user.clone());
        info!(user_id = %user.id, "Created user");
        Ok(user)
    }

    async fn find_user(&self, id: Uuid) -> IdentityResult<Option<User>> {
        let guard = self.inner.lock().await;
        Ok(guard.users.get(&id).cloned())
    }
}

// ---------------- Postgres Implementation ----------------

#[derive(Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn key_from_row(row: &sqlx::postgres::PgRow) -> IdentityResult<ApiKey> {
    let tier_raw: String = row.try_get("tier")?;
    let tier = TierName::from_str(&tier_raw)
        .map_err(|err| IdentityError::Corrupt(err.to_string()))?;
    let requests: i64 = row.try_get("requests")?;
    let input_tokens: i64 = row.try_get("input_tokens")?;
    let output_tokens: i64 = row.try_get("output_tokens")?;
    Ok(ApiKey {
        id: row.try_get("id")?,
        principal_id: row.try_get("principal_id")?,
        name: row.try_get("name")?,
        hashed_secret: row.try_get("secret_hash")?,
        secret_suffix: row.try_get("secret_suffix")?,
        tier,
        permissions: row.try_get("permissions")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        last_used: row.try_get("last_used")?,
        usage: KeyUsage {
            requests: requests.max(0) as u64,
            input_tokens: input_tokens.max(0) as u64,
            output_tokens: output_tokens.max(0) as u64,
            cost: row.try_get("cost")?,
        },
        active: row.try_get("active")?,
    })
}

fn user_from_row(row: &sqlx::postgres::PgRow) -> IdentityResult<User> {
    let tier_raw: String = row.try_get("tier")?;
    let tier = TierName::from_str(&tier_raw)
        .map_err(|err| IdentityError::Corrupt(err.to_string()))?;
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        tier,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

const KEY_COLUMNS: &str = "id, principal_id, name, secret_hash, secret_suffix, tier, permissions, \
     created_at, expires_at, last_used, requests, input_tokens, output_tokens, cost, active";

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn lookup_key_by_secret(&self, cleartext: &str) -> IdentityResult<Option<ApiKey>> {
        let digest = secret_lookup_digest(cleartext);
        let row = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys WHERE secret_lookup = $1"
        ))
        .bind(&digest)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let key = key_from_row(&row)?;
        if !verify_secret(cleartext, &key.hashed_secret)? {
            return Ok(None);
        }
        Ok(Some(key))
    }

    async fn create_key(
        &self,
        principal_id: Uuid,
        name: &str,
        tier: TierName,
    ) -> IdentityResult<CreatedKey> {
        let (key, cleartext) = build_key(principal_id, name, tier)?;
        sqlx::query(
            "INSERT INTO api_keys (id, principal_id, name, secret_hash, secret_lookup, \
             secret_suffix, tier, permissions, created_at, expires_at, requests, input_tokens, \
             output_tokens, cost, active)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, 0, 0, 0, TRUE)",
        )
        .bind(key.id)
        .bind(key.principal_id)
        .bind(&key.name)
        .bind(&key.hashed_secret)
        .bind(secret_lookup_digest(&cleartext))
        .bind(&key.secret_suffix)
        .bind(key.tier.as_str())
        .bind(&key.permissions)
        .bind(key.created_at)
        .bind(key.expires_at)
        .execute(&self.pool)
        .await?;
        info!(principal_id = %principal_id, key_id = %key.id, "Created API key");
        Ok(CreatedKey { key, cleartext })
    }

    async fn list_keys(&self, principal_id: Uuid) -> IdentityResult<Vec<ApiKey>> {
        let rows = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys WHERE principal_id = $1 ORDER BY created_at"
        ))
        .bind(principal_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(key_from_row).collect()
    }

    async fn revoke_key(&self, principal_id: Uuid, key_id: Uuid) -> IdentityResult<()> {
        let result = sqlx::query(
            "UPDATE api_keys SET active = FALSE WHERE id = $1 AND principal_id = $2",
        )
        .bind(key_id)
        .bind(principal_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(IdentityError::KeyNotFound);
        }
        info!(principal_id = %principal_id, key_id = %key_id, "Revoked API key");
        Ok(())
    }

    async fn bump_usage(
        &self,
        key_id: Uuid,
        requests: u64,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    ) -> IdentityResult<()> {
        sqlx::query(
            "UPDATE api_keys SET requests = requests + $2, input_tokens = input_tokens + $3, \
             output_tokens = output_tokens + $4, cost = cost + $5, last_used = NOW() \
             WHERE id = $1",
        )
        .bind(key_id)
        .bind(requests as i64)
        .bind(input_tokens as i64)
        .bind(output_tokens as i64)
        .bind(cost)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_user_by_email(&self, email: &str, name: &str) -> IdentityResult<User> {
        let row = sqlx::query(
            "INSERT INTO users (id, email, name, tier, active, created_at)
             VALUES ($1, $2, $3, 'free', TRUE, NOW())
             ON CONFLICT (email) DO UPDATE SET name = EXCLUDED.name
             RETURNING id, email, name, tier, active, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        user_from_row(&row)
    }

    async fn find_user(&self, id: Uuid) -> IdentityResult<Option<User>> {
        let row = sqlx::query(
            "SELECT id, email, name, tier, active, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cleartext_returned_once_and_verifies() {
        let store = MemoryIdentityStore::new();
        let principal = Uuid::new_v4();
        let created = store
            .create_key(principal, "ci", TierName::Free)
            .await
            .unwrap();
        assert!(created.cleartext.starts_with("autogram_sk_test_"));
        // The stored record carries only the hash.
        assert!(!created.key.hashed_secret.contains(&created.cleartext));

        let found = store
            .lookup_key_by_secret(&created.cleartext)
            .await
            .unwrap()
            .expect("key should resolve");
        assert_eq!(found.id, created.key.id);

        assert!(store
            .lookup_key_by_secret("autogram_sk_test_wrong")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn masked_listing_hides_secret() {
        let store = MemoryIdentityStore::new();
        let principal = Uuid::new_v4();
        let created = store
            .create_key(principal, "ci", TierName::Professional)
            .await
            .unwrap();
        let listed = store.list_keys(principal).await.unwrap();
        assert_eq!(listed.len(), 1);
        let mask = listed[0].masked();
        assert!(mask.starts_with("autogram_sk_pro_…"));
        assert!(!mask.contains(&created.cleartext));
        assert!(mask.ends_with(&created.cleartext[created.cleartext.len() - 4..]));
    }

    #[tokio::test]
    async fn revoke_is_idempotent_and_preserves_history() {
        let store = MemoryIdentityStore::new();
        let principal = Uuid::new_v4();
        let created = store
            .create_key(principal, "ci", TierName::Free)
            .await
            .unwrap();
        store.revoke_key(principal, created.key.id).await.unwrap();
        store.revoke_key(principal, created.key.id).await.unwrap();
        let listed = store.list_keys(principal).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].active);
    }

    #[tokio::test]
    async fn usage_tally_is_monotonic() {
        let store = MemoryIdentityStore::new();
        let principal = Uuid::new_v4();
        let created = store
            .create_key(principal, "ci", TierName::Free)
            .await
            .unwrap();
        store
            .bump_usage(created.key.id, 1, 100, 50, 0.01)
            .await
            .unwrap();
        store
            .bump_usage(created.key.id, 1, 10, 5, 0.001)
            .await
            .unwrap();
        let key = &store.list_keys(principal).await.unwrap()[0];
        assert_eq!(key.usage.requests, 2);
        assert_eq!(key.usage.input_tokens, 110);
        assert_eq!(key.usage.output_tokens, 55);
        assert!(key.last_used.is_some());
    }

    #[tokio::test]
    async fn upsert_user_is_stable_by_email() {
        let store = MemoryIdentityStore::new();
        let first = store
            .upsert_user_by_email("dev@example.com", "Dev")
            .await
            .unwrap();
        let second = store
            .upsert_user_by_email("dev@example.com", "Dev Renamed")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Dev Renamed");
    }
}
