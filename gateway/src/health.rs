use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::model_registry::ModelRegistry;

const PROBE_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshot of one model's health for /health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub avg_latency_ms: f64,
}

struct ModelHealth {
    healthy: AtomicBool,
    detail: Mutex<HealthDetail>,
}

#[derive(Default)]
struct HealthDetail {
    last_check: Option<DateTime<Utc>>,
    avg_latency_ms: f64,
}

impl ModelHealth {
    fn new() -> Self {
        // Models start unhealthy until the first probe succeeds.
        Self {
            healthy: AtomicBool::new(false),
            detail: Mutex::new(HealthDetail::default()),
        }
    }

    fn observe(&self, healthy: bool, latency: Option<Duration>) {
        self.healthy.store(healthy, Ordering::Relaxed);
        let mut guard = self.detail.lock().expect("health detail poisoned");
        guard.last_check = Some(Utc::now());
        if let Some(latency) = latency {
            let observed = latency.as_secs_f64() * 1_000.0;
            guard.avg_latency_ms = if guard.avg_latency_ms == 0.0 {
                observed
            } else {
                (guard.avg_latency_ms + observed) / 2.0
            };
        }
    }

    fn snapshot(&self) -> HealthSnapshot {
        let guard = self.detail.lock().expect("health detail poisoned");
        HealthSnapshot {
            healthy: self.healthy.load(Ordering::Relaxed),
            last_check: guard.last_check,
            avg_latency_ms: guard.avg_latency_ms,
        }
    }
}

/// Per-model health map. The probe task is the primary writer; the dispatch
/// path feeds back success/failure observations. Readers take atomic loads
/// on the hot path.
pub struct HealthMonitor {
    models: HashMap<String, ModelHealth>,
    client: reqwest::Client,
}

impl HealthMonitor {
    pub fn new(registry: &ModelRegistry) -> Self {
        let models = registry
            .ids()
            .map(|id| (id.to_string(), ModelHealth::new()))
            .collect();
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("failed to build health probe client");
        Self { models, client }
    }

    pub fn is_healthy(&self, model_id: &str) -> bool {
        self.models
            .get(model_id)
            .map(|record| record.healthy.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn any_healthy(&self) -> bool {
        self.models
            .values()
            .any(|record| record.healthy.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> HashMap<String, HealthSnapshot> {
        self.models
            .iter()
            .map(|(id, record)| (id.clone(), record.snapshot()))
            .collect()
    }

    /// Dispatch-path feedback: a successful upstream call proves liveness.
    pub fn mark_success(&self, model_id: &str, latency: Duration) {
        if let Some(record) = self.models.get(model_id) {
            record.observe(true, Some(latency));
        }
    }

    /// Dispatch-path feedback: failures flip the model red immediately.
    pub fn mark_failure(&self, model_id: &str) {
        if let Some(record) = self.models.get(model_id) {
            record.observe(false, None);
        }
    }

    /// Run one probe round against every model; used by the ticker and by
    /// tests that cannot wait for the 30s cadence.
    pub async fn probe_all(&self, registry: &ModelRegistry) {
        for model in registry.iter() {
            let Some(record) = self.models.get(&model.id) else {
                continue;
            };
            let url = format!("{}{}", model.base_url, model.health_path);
            let started = Instant::now();
            let outcome = self.client.get(&url).send().await;
            let latency = started.elapsed();
            match outcome {
                Ok(response) if response.status().is_success() => {
                    let healthy = response
                        .json::<serde_json::Value>()
                        .await
                        .ok()
                        .and_then(|body| {
                            body.get("status")
                                .and_then(|status| status.as_str())
                                .map(|status| status == "healthy")
                        })
                        .unwrap_or(false);
                    record.observe(healthy, Some(latency));
                    debug!(model = %model.id, healthy, latency_ms = latency.as_millis() as u64, "Probed model");
                }
                Ok(response) => {
                    record.observe(false, Some(latency));
                    warn!(model = %model.id, status = %response.status(), "Model probe returned failure status");
                }
                Err(err) => {
                    record.observe(false, None);
                    warn!(model = %model.id, error = %err, "Model probe failed");
                }
            }
        }
    }

    pub fn spawn_prober(self: &Arc<Self>, registry: ModelRegistry) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROBE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.probe_all(&registry).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn models_start_unhealthy() {
        let registry = ModelRegistry::from_env();
        let monitor = HealthMonitor::new(&registry);
        assert!(!monitor.is_healthy("qwen3_42b"));
        assert!(!monitor.any_healthy());
    }

    #[test]
    fn feedback_moves_the_latency_average() {
        let registry = ModelRegistry::from_env();
        let monitor = HealthMonitor::new(&registry);
        monitor.mark_success("qwen3_42b", Duration::from_millis(100));
        monitor.mark_success("qwen3_42b", Duration::from_millis(200));
        let snapshot = monitor.snapshot();
        let record = snapshot.get("qwen3_42b").unwrap();
        assert!(record.healthy);
        // EWMA: (100 + 200) / 2
        assert!((record.avg_latency_ms - 150.0).abs() < 1.0);

        monitor.mark_failure("qwen3_42b");
        assert!(!monitor.is_healthy("qwen3_42b"));
    }
}
