use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common_http_errors::{ApiError, ErrorKind};
use uuid::Uuid;

use crate::tiers::TierName;

/// Resolved caller identity, produced by authentication and never persisted.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: Uuid,
    pub email: Option<String>,
    pub tier: TierName,
    pub api_key_id: Option<Uuid>,
    pub permissions: Vec<String>,
}

impl Principal {
    pub fn has_permission(&self, token: &str) -> bool {
        self.permissions
            .iter()
            .any(|value| value == token || value == "*")
    }
}

/// Token accounting for one request. The upstream-reported usage is the
/// authoritative figure; the estimate only gates admission.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Default)]
struct Scratch {
    principal: Option<Principal>,
    usage: TokenUsage,
    cost: f64,
    model: Option<String>,
    upstream_latency: Option<Duration>,
    error_kind: Option<&'static str>,
}

/// Request-scoped envelope threaded through the pipeline via extensions.
/// Stages read the identity fields directly and record outcomes through the
/// shared scratch pad so the observability close sees the final picture.
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub client_ip: String,
    pub started_at: Instant,
    pub deadline: Instant,
    scratch: Arc<Mutex<Scratch>>,
}

impl RequestContext {
    pub fn new(request_id: Uuid, client_ip: String, timeout: Duration) -> Self {
        let started_at = Instant::now();
        Self {
            request_id,
            client_ip,
            started_at,
            deadline: started_at + timeout,
            scratch: Arc::new(Mutex::new(Scratch::default())),
        }
    }

    /// Attach the authenticated principal; visible to every stage holding a
    /// clone of this context.
    pub fn set_principal(&self, principal: Principal) {
        let mut guard = self.scratch.lock().expect("context scratch poisoned");
        guard.principal = Some(principal);
    }

    pub fn principal(&self) -> Option<Principal> {
        let guard = self.scratch.lock().expect("context scratch poisoned");
        guard.principal.clone()
    }

    /// Remaining time before the request-scoped deadline elapses.
    pub fn time_remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn record_usage(&self, usage: TokenUsage, cost: f64) {
        let mut guard = self.scratch.lock().expect("context scratch poisoned");
        guard.usage = usage;
        guard.cost = cost;
    }

    pub fn record_model(&self, model: &str, latency: Duration) {
        let mut guard = self.scratch.lock().expect("context scratch poisoned");
        guard.model = Some(model.to_string());
        guard.upstream_latency = Some(latency);
    }

    pub fn record_error_kind(&self, kind: &'static str) {
        let mut guard = self.scratch.lock().expect("context scratch poisoned");
        guard.error_kind = Some(kind);
    }

    pub fn usage(&self) -> (TokenUsage, f64) {
        let guard = self.scratch.lock().expect("context scratch poisoned");
        (guard.usage, guard.cost)
    }

    pub fn model(&self) -> Option<String> {
        let guard = self.scratch.lock().expect("context scratch poisoned");
        guard.model.clone()
    }

    pub fn upstream_latency(&self) -> Option<Duration> {
        let guard = self.scratch.lock().expect("context scratch poisoned");
        guard.upstream_latency
    }

    pub fn error_kind(&self) -> Option<&'static str> {
        let guard = self.scratch.lock().expect("context scratch poisoned");
        guard.error_kind
    }

    /// Build an error already tagged with this request's id.
    pub fn err(&self, kind: ErrorKind) -> ApiError {
        ApiError::new(kind).with_request_id(self.request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_is_shared_across_clones() {
        let ctx = RequestContext::new(
            Uuid::new_v4(),
            "203.0.113.9".to_string(),
            Duration::from_secs(30),
        );
        let clone = ctx.clone();
        clone.record_usage(
            TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: 30,
            },
            0.5,
        );
        let (usage, cost) = ctx.usage();
        assert_eq!(usage.total_tokens, 30);
        assert!((cost - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn wildcard_permission_grants_all() {
        let principal = Principal {
            id: Uuid::new_v4(),
            email: None,
            tier: TierName::Internal,
            api_key_id: None,
            permissions: vec!["*".to_string()],
        };
        assert!(principal.has_permission("keys.write"));
    }
}
