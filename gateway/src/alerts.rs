use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::config::SecurityConfig;

/// Posts security events (rate-limit bursts, IP blocks) to the configured
/// webhook. A per-key cooldown keeps a sustained burst from spamming the
/// destination; alerts never change the response to the triggering request.
pub struct SecurityAlerter {
    client: Client,
    webhook_url: Option<String>,
    bearer: Option<String>,
    cooldown: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl SecurityAlerter {
    pub fn new(client: Client, config: &SecurityConfig) -> Self {
        Self {
            client,
            webhook_url: config.alert_webhook_url.clone(),
            bearer: config.alert_webhook_bearer.clone(),
            cooldown: Duration::from_secs(config.alert_cooldown_secs),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Fire-and-forget alert, deduplicated per key within the cooldown.
    pub async fn maybe_alert(&self, key: &str, message: &str) {
        {
            let mut guard = self.last_sent.lock().expect("alert state poisoned");
            let now = Instant::now();
            if let Some(last) = guard.get(key) {
                if now.duration_since(*last) < self.cooldown {
                    return;
                }
            }
            guard.insert(key.to_string(), now);
        }

        warn!(key, message, "Security alert");
        if let Some(url) = &self.webhook_url {
            if let Err(err) = self.post_webhook(url, message).await {
                warn!(?err, "Failed to post security alert webhook");
            }
        }
    }

    async fn post_webhook(&self, url: &str, text: &str) -> Result<()> {
        if url.trim().is_empty() {
            return Ok(());
        }

        let mut request = self.client.post(url).json(&json!({ "text": text }));
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "Security webhook returned status {}",
                response.status()
            ));
        }

        info!("Posted security alert webhook");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alerter(cooldown_secs: u64) -> SecurityAlerter {
        let mut config = crate::config::GatewayConfig::from_env()
            .expect("config")
            .security;
        config.alert_webhook_url = None;
        config.alert_cooldown_secs = cooldown_secs;
        SecurityAlerter::new(Client::new(), &config)
    }

    #[tokio::test]
    async fn cooldown_deduplicates_alerts() {
        let alerter = alerter(60);
        alerter.maybe_alert("ip:203.0.113.5", "first").await;
        alerter.maybe_alert("ip:203.0.113.5", "second").await;
        let guard = alerter.last_sent.lock().unwrap();
        assert_eq!(guard.len(), 1);
    }
}
