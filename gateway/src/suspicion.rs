use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Per-IP suspicion counters and the process-local block set. All state is
/// guarded by one mutex held only for O(1) work; the janitor evicts records
/// idle for an hour and blocks past their TTL.
pub struct SuspicionTracker {
    ticks_to_block: u32,
    block_ttl: Duration,
    idle_eviction: Duration,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, SuspicionRecord>,
    blocked: HashMap<String, Instant>,
}

struct SuspicionRecord {
    count: u32,
    last_activity: Instant,
}

impl SuspicionTracker {
    pub fn new(ticks_to_block: u32, block_ttl: Duration) -> Self {
        Self {
            ticks_to_block: ticks_to_block.max(1),
            block_ttl,
            idle_eviction: Duration::from_secs(3_600),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        self.blocked_remaining(ip).is_some()
    }

    /// Remaining block TTL for an IP; drives the Retry-After header.
    pub fn blocked_remaining(&self, ip: &str) -> Option<Duration> {
        let mut guard = self.inner.lock().expect("suspicion state poisoned");
        let now = Instant::now();
        match guard.blocked.get(ip) {
            Some(expires) if now < *expires => Some(*expires - now),
            Some(_) => {
                guard.blocked.remove(ip);
                None
            }
            None => None,
        }
    }

    /// Record activity for the spacing heuristic; returns the gap since the
    /// previous request from this IP, when one was seen.
    pub fn note_request(&self, ip: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("suspicion state poisoned");
        let record = guard
            .records
            .entry(ip.to_string())
            .or_insert(SuspicionRecord {
                count: 0,
                last_activity: now,
            });
        let gap = if record.last_activity == now {
            None
        } else {
            Some(now.duration_since(record.last_activity))
        };
        record.last_activity = now;
        gap
    }

    /// Add one suspicion tick; returns true when the IP just crossed the
    /// block threshold and was added to the block set.
    pub fn record_tick(&self, ip: &str) -> bool {
        let now = Instant::now();
        let block_until = now + self.block_ttl;
        let mut guard = self.inner.lock().expect("suspicion state poisoned");
        let record = guard
            .records
            .entry(ip.to_string())
            .or_insert(SuspicionRecord {
                count: 0,
                last_activity: now,
            });
        record.count += 1;
        record.last_activity = now;
        let crossed = record.count >= self.ticks_to_block;
        if crossed {
            record.count = 0;
            guard.blocked.insert(ip.to_string(), block_until);
            warn!(ip, ttl_secs = self.block_ttl.as_secs(), "Blocked suspicious IP");
        }
        crossed
    }

    /// Immediate block, used when the per-IP admission layer crosses its
    /// blacklist threshold.
    pub fn block(&self, ip: &str) {
        let mut guard = self.inner.lock().expect("suspicion state poisoned");
        guard
            .blocked
            .insert(ip.to_string(), Instant::now() + self.block_ttl);
        warn!(ip, ttl_secs = self.block_ttl.as_secs(), "Blocked IP via rate threshold");
    }

    pub fn blocked_count(&self) -> usize {
        let guard = self.inner.lock().expect("suspicion state poisoned");
        guard.blocked.len()
    }

    /// Evict idle suspicion records and expired blocks.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("suspicion state poisoned");
        let idle = self.idle_eviction;
        guard
            .records
            .retain(|_, record| now.duration_since(record.last_activity) < idle);
        guard.blocked.retain(|_, expires| now < *expires);
    }

    pub fn spawn_janitor(self: &Arc<Self>) {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3_600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracker.sweep();
                info!(blocked = tracker.blocked_count(), "Swept suspicion state");
            }
        });
    }
}
