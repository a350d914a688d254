use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

// Redis dependencies (only used by the Redis implementation)
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv connection failed: {0}")]
    Connect(String),
    #[error("kv operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("kv backend error: {0}")]
    Backend(#[from] redis::RedisError),
}

/// Small verb set shared by every distributed counter and ephemeral-state
/// consumer. Per-key operations are linearizable on the Redis backend; the
/// in-memory backend exists for tests and single-process runs.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Increment an integer key, setting `ttl` when the key is created.
    /// Returns the post-increment count.
    async fn incr(&self, key: &str, ttl: Duration) -> KvResult<i64>;

    /// Add a member to a sorted set under `score` (seconds since epoch).
    async fn zadd(&self, key: &str, score: f64, member: &str) -> KvResult<()>;

    /// Count sorted-set members with score >= `since`.
    async fn zrange_count(&self, key: &str, since: f64) -> KvResult<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()>;

    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()>;

    async fn del(&self, key: &str) -> KvResult<()>;
}

// ---------------- Redis Implementation ----------------

#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
    op_timeout: Duration,
}

impl RedisKv {
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> KvResult<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|err| KvError::Connect(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| KvError::Connect(err.to_string()))?;
        Ok(Self {
            manager,
            op_timeout,
        })
    }

    /// Bound every round trip so a wedged store cannot stall the request path.
    async fn bounded<T, F>(&self, fut: F) -> KvResult<T>
    where
        F: std::future::Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(KvError::from),
            Err(_) => Err(KvError::Timeout(self.op_timeout)),
        }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn incr(&self, key: &str, ttl: Duration) -> KvResult<i64> {
        let mut conn = self.manager.clone();
        let count: i64 = self.bounded(conn.incr(key, 1)).await?;
        if count == 1 {
            let _: () = self.bounded(conn.expire(key, ttl.as_secs() as i64)).await?;
        }
        Ok(count)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> KvResult<()> {
        let mut conn = self.manager.clone();
        let _: () = self.bounded(conn.zadd(key, member, score)).await?;
        Ok(())
    }

    async fn zrange_count(&self, key: &str, since: f64) -> KvResult<i64> {
        let mut conn = self.manager.clone();
        let count: i64 = self.bounded(conn.zcount(key, since, "+inf")).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()> {
        let mut conn = self.manager.clone();
        let _: () = self.bounded(conn.expire(key, ttl.as_secs() as i64)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = self.bounded(conn.get(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        let mut conn = self.manager.clone();
        let _: () = self.bounded(conn.set(key, value)).await?;
        let _: () = self.bounded(conn.expire(key, ttl.as_secs() as i64)).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        let mut conn = self.manager.clone();
        let _: () = self.bounded(conn.del(key)).await?;
        Ok(())
    }
}

// ---------------- In-Memory Implementation (tests, single process) ----------------

#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

struct Entry {
    expires_at: Option<Instant>,
    value: Value,
}

enum Value {
    Counter(i64),
    Sorted(Vec<(f64, String)>),
    Plain(String),
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn incr(&self, key: &str, ttl: Duration) -> KvResult<i64> {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        let entry = guard.entry(key.to_string()).or_insert(Entry {
            expires_at: Some(now + ttl),
            value: Value::Counter(0),
        });
        if entry.expired(now) {
            entry.expires_at = Some(now + ttl);
            entry.value = Value::Counter(0);
        }
        match &mut entry.value {
            Value::Counter(count) => {
                *count += 1;
                Ok(*count)
            }
            _ => {
                entry.value = Value::Counter(1);
                Ok(1)
            }
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> KvResult<()> {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        let entry = guard.entry(key.to_string()).or_insert(Entry {
            expires_at: None,
            value: Value::Sorted(Vec::new()),
        });
        if entry.expired(now) {
            entry.expires_at = None;
            entry.value = Value::Sorted(Vec::new());
        }
        match &mut entry.value {
            Value::Sorted(members) => {
                if let Some(existing) = members.iter_mut().find(|(_, m)| m == member) {
                    existing.0 = score;
                } else {
                    members.push((score, member.to_string()));
                }
            }
            _ => entry.value = Value::Sorted(vec![(score, member.to_string())]),
        }
        Ok(())
    }

    async fn zrange_count(&self, key: &str, since: f64) -> KvResult<i64> {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        match guard.get_mut(key) {
            Some(entry) if !entry.expired(now) => match &entry.value {
                Value::Sorted(members) => {
                    Ok(members.iter().filter(|(score, _)| *score >= since).count() as i64)
                }
                _ => Ok(0),
            },
            _ => Ok(0),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()> {
        let mut guard = self.inner.lock().await;
        if let Some(entry) = guard.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        match guard.get_mut(key) {
            Some(entry) if !entry.expired(now) => match &entry.value {
                Value::Plain(value) => Ok(Some(value.clone())),
                Value::Counter(count) => Ok(Some(count.to_string())),
                Value::Sorted(_) => Ok(None),
            },
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        let mut guard = self.inner.lock().await;
        guard.insert(
            key.to_string(),
            Entry {
                expires_at: Some(Instant::now() + ttl),
                value: Value::Plain(value.to_string()),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        let mut guard = self.inner.lock().await;
        guard.remove(key);
        Ok(())
    }
}
