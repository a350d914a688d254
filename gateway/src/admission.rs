use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common_http_errors::RateLimitInfo;
use common_kv::{KvError, KvStore};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::tiers::TierConfig;

pub type AdmissionResult<T> = Result<T, AdmissionError>;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("global request limit exceeded")]
    GlobalLimited { retry_after_secs: u64 },
    #[error("per-ip request limit exceeded")]
    IpLimited {
        retry_after_secs: u64,
        /// Set when the count crossed the blacklist threshold; the caller
        /// hands the IP to the block set.
        blacklist: bool,
    },
    #[error("principal request limit exceeded")]
    PrincipalLimited {
        limit: u32,
        reset_unix: i64,
        retry_after_secs: u64,
    },
    #[error("concurrent request cap reached")]
    Concurrency,
    /// The KV store is unreachable; admission fails closed.
    #[error("admission store unavailable: {0}")]
    Unavailable(#[from] KvError),
}

impl AdmissionError {
    pub fn rate_info(&self) -> Option<RateLimitInfo> {
        let now = epoch_secs() as i64;
        match self {
            Self::GlobalLimited { retry_after_secs } => Some(RateLimitInfo {
                limit: 0,
                remaining: 0,
                reset_unix: now + *retry_after_secs as i64,
                retry_after_secs: Some(*retry_after_secs),
            }),
            Self::IpLimited {
                retry_after_secs, ..
            } => Some(RateLimitInfo {
                limit: 0,
                remaining: 0,
                reset_unix: now + *retry_after_secs as i64,
                retry_after_secs: Some(*retry_after_secs),
            }),
            Self::PrincipalLimited {
                limit,
                reset_unix,
                retry_after_secs,
            } => Some(RateLimitInfo {
                limit: *limit,
                remaining: 0,
                reset_unix: *reset_unix,
                retry_after_secs: Some(*retry_after_secs),
            }),
            _ => None,
        }
    }
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs_f64()
}

/// Ordered admission layers backed by the shared KV store. Counters are
/// authoritative across replicas; the only in-process state is the
/// per-principal concurrency semaphore map.
pub struct AdmissionController {
    kv: Arc<dyn KvStore>,
    config: Arc<GatewayConfig>,
    semaphores: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

impl AdmissionController {
    pub fn new(kv: Arc<dyn KvStore>, config: Arc<GatewayConfig>) -> Self {
        Self {
            kv,
            config,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// Layer 1: gateway-wide sliding window over the last second.
    pub async fn check_global(&self) -> AdmissionResult<()> {
        let limits = &self.config.rate_limit;
        let cap = limits.global_per_second + limits.global_burst;
        let key = format!("{}:global:gateway:1s", limits.prefix);
        let now = epoch_secs();
        let member = format!("{now:.6}:{}", Uuid::new_v4());
        self.kv.zadd(&key, now, &member).await?;
        self.kv.expire(&key, Duration::from_secs(2)).await?;
        let count = self.kv.zrange_count(&key, now - 1.0).await?;
        if count > cap as i64 {
            return Err(AdmissionError::GlobalLimited {
                retry_after_secs: 1,
            });
        }
        Ok(())
    }

    /// Layer 2: fixed per-minute window per client IP.
    pub async fn check_ip(&self, ip: &str) -> AdmissionResult<()> {
        let limits = &self.config.rate_limit;
        let now = epoch_secs() as u64;
        let minute = now / 60;
        let key = format!("{}:ip:{}:{}", limits.prefix, ip, minute);
        let count = self.kv.incr(&key, Duration::from_secs(120)).await?;
        if count > limits.ip_per_minute as i64 {
            return Err(AdmissionError::IpLimited {
                retry_after_secs: 60 - (now % 60),
                blacklist: count >= limits.ip_blacklist_threshold as i64,
            });
        }
        Ok(())
    }

    /// Layer 3a: hourly sliding window per principal against the tier limit,
    /// plus a fixed daily window against the tier's daily cap.
    pub async fn check_principal(
        &self,
        principal_id: Uuid,
        tier: &TierConfig,
    ) -> AdmissionResult<()> {
        let limits = &self.config.rate_limit;
        let now = epoch_secs();

        let hour_key = format!("{}:principal:{}:1h", limits.prefix, principal_id);
        let member = format!("{now:.6}:{}", Uuid::new_v4());
        self.kv.zadd(&hour_key, now, &member).await?;
        self.kv.expire(&hour_key, Duration::from_secs(7_200)).await?;
        let hourly = self.kv.zrange_count(&hour_key, now - 3_600.0).await?;
        if hourly > tier.requests_per_hour as i64 {
            return Err(AdmissionError::PrincipalLimited {
                limit: tier.requests_per_hour,
                reset_unix: now as i64 + 60,
                retry_after_secs: 60,
            });
        }

        let day = now as u64 / 86_400;
        let day_key = format!("{}:principal:{}:{}", limits.prefix, principal_id, day);
        let daily = self.kv.incr(&day_key, Duration::from_secs(172_800)).await?;
        if daily > tier.requests_per_day as i64 {
            let next_day = (day + 1) * 86_400;
            return Err(AdmissionError::PrincipalLimited {
                limit: tier.requests_per_day,
                reset_unix: next_day as i64,
                retry_after_secs: next_day.saturating_sub(now as u64),
            });
        }

        Ok(())
    }

    /// Layer 3b: per-principal in-flight cap. The returned permit must live
    /// for the whole handler; dropping it on any exit path releases the slot.
    pub async fn acquire_slot(
        &self,
        principal_id: Uuid,
        tier: &TierConfig,
        wait_budget: Duration,
    ) -> AdmissionResult<OwnedSemaphorePermit> {
        let semaphore = {
            let mut guard = self.semaphores.lock().expect("semaphore map poisoned");
            guard
                .entry(principal_id)
                .or_insert_with(|| Arc::new(Semaphore::new(tier.concurrent_requests as usize)))
                .clone()
        };
        match tokio::time::timeout(wait_budget, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            // Closed semaphores do not occur; treat both failures as the cap.
            Ok(Err(_)) | Err(_) => Err(AdmissionError::Concurrency),
        }
    }
}
