use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Idle time after the last failure before a half-open probe is allowed.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Whether a dispatch may proceed, and in what role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Normal,
    /// The single permitted half-open probe.
    Probe,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Per-model circuit breaker. Writers are the dispatch path only; the mutex
/// is held for O(1) transitions.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Ask to dispatch one request. `None` means the circuit is open and the
    /// call must short-circuit with `upstream-unavailable`.
    pub fn try_acquire(&self) -> Option<Attempt> {
        let mut guard = self.inner.lock().expect("breaker poisoned");
        match guard.state {
            CircuitState::Closed => Some(Attempt::Normal),
            CircuitState::Open => {
                let cooled = guard
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    guard.state = CircuitState::HalfOpen;
                    guard.probe_in_flight = true;
                    Some(Attempt::Probe)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if guard.probe_in_flight {
                    None
                } else {
                    guard.probe_in_flight = true;
                    Some(Attempt::Probe)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut guard = self.inner.lock().expect("breaker poisoned");
        guard.consecutive_failures = 0;
        guard.probe_in_flight = false;
        guard.state = CircuitState::Closed;
    }

    pub fn record_failure(&self) {
        let mut guard = self.inner.lock().expect("breaker poisoned");
        guard.last_failure = Some(Instant::now());
        guard.probe_in_flight = false;
        match guard.state {
            CircuitState::HalfOpen => {
                guard.state = CircuitState::Open;
            }
            CircuitState::Closed => {
                guard.consecutive_failures += 1;
                if guard.consecutive_failures >= self.config.failure_threshold {
                    guard.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        let guard = self.inner.lock().expect("breaker poisoned");
        guard.state
    }
}
