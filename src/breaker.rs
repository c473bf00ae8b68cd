//! Per-backend circuit breakers.
//!
//! # States
//!
//! ```text
//!   Closed ──(failure_count >= threshold)──→ Open
//!     ↑                                       │
//!     │                          (recovery_timeout elapsed,
//!     │                           first caller only)
//!     │                                       ↓
//!     └────────(trial succeeds)────────── HalfOpen
//!                                             │
//!               Open ←──(trial fails, timer reset)
//! ```
//!
//! Exactly one trial is admitted per recovery window: the caller that
//! observes the elapsed timeout moves the breaker to `HalfOpen` and owns
//! the trial; concurrent callers are refused until the trial resolves.
//!
//! All operations take one short lock on the registry map and never
//! suspend, so the registry is safe to share across dispatch workers.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, attempts pass through.
    Closed,
    /// Backend assumed down, attempts are refused.
    Open,
    /// One trial attempt is testing recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds shared by every breaker in a registry.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn recovered(&self, recovery_timeout: Duration, now: Instant) -> bool {
        self.opened_at
            .is_some_and(|at| now.saturating_duration_since(at) >= recovery_timeout)
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub backend_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    /// How long the breaker has been open, if it is open or probing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_for_ms: Option<u64>,
}

/// One circuit breaker per backend id, created on first use.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<FxHashMap<String, Breaker>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers share `config`.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<String, Breaker>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit an attempt against `backend_id`.
    ///
    /// Returns `true` when closed. When open, returns `false` until the
    /// recovery timeout has elapsed; the first caller after that moves the
    /// breaker to `HalfOpen` and is admitted as the trial. Everyone else
    /// is refused until the trial is resolved by
    /// [`record_success`](Self::record_success),
    /// [`record_failure`](Self::record_failure) or
    /// [`release`](Self::release).
    pub fn is_available(&self, backend_id: &str) -> bool {
        let now = Instant::now();
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(backend_id.to_string())
            .or_insert_with(Breaker::new);

        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if breaker.recovered(self.config.recovery_timeout, now) {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.trial_in_flight = true;
                    info!(backend = backend_id, "circuit breaker half-open, admitting trial");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if breaker.trial_in_flight {
                    false
                } else {
                    breaker.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Whether [`is_available`](Self::is_available) would admit an attempt
    /// right now, without claiming the trial.
    pub fn would_admit(&self, backend_id: &str) -> bool {
        let now = Instant::now();
        let breakers = self.lock();
        match breakers.get(backend_id) {
            None => true,
            Some(breaker) => match breaker.state {
                CircuitState::Closed => true,
                CircuitState::Open => breaker.recovered(self.config.recovery_timeout, now),
                CircuitState::HalfOpen => !breaker.trial_in_flight,
            },
        }
    }

    /// Record a successful attempt.
    pub fn record_success(&self, backend_id: &str) {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(backend_id.to_string())
            .or_insert_with(Breaker::new);

        breaker.failure_count = 0;
        if breaker.state == CircuitState::HalfOpen {
            info!(backend = backend_id, "circuit breaker closing, trial succeeded");
            breaker.state = CircuitState::Closed;
            breaker.opened_at = None;
            breaker.trial_in_flight = false;
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&self, backend_id: &str) {
        let now = Instant::now();
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(backend_id.to_string())
            .or_insert_with(Breaker::new);

        breaker.failure_count = breaker.failure_count.saturating_add(1);
        match breaker.state {
            CircuitState::HalfOpen => {
                warn!(backend = backend_id, "circuit breaker reopening, trial failed");
                breaker.open(now);
            }
            CircuitState::Closed if breaker.failure_count >= self.config.failure_threshold => {
                warn!(
                    backend = backend_id,
                    failures = breaker.failure_count,
                    "circuit breaker opening"
                );
                breaker.open(now);
            }
            // Late results from attempts admitted before the breaker opened
            // do not extend the open window.
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    /// Give back an admission that ended without a health signal.
    ///
    /// Used when an attempt proved nothing about the backend (e.g. the
    /// input was rejected). A claimed trial is returned so the next caller
    /// can try instead.
    pub fn release(&self, backend_id: &str) {
        let mut breakers = self.lock();
        if let Some(breaker) = breakers.get_mut(backend_id) {
            if breaker.state == CircuitState::HalfOpen && breaker.trial_in_flight {
                debug!(backend = backend_id, "releasing unresolved trial");
                breaker.trial_in_flight = false;
            }
        }
    }

    /// Current state of a breaker. Unknown backends are closed.
    pub fn state(&self, backend_id: &str) -> CircuitState {
        self.lock()
            .get(backend_id)
            .map_or(CircuitState::Closed, |b| b.state)
    }

    /// Consecutive failures recorded for a backend.
    pub fn failure_count(&self, backend_id: &str) -> u32 {
        self.lock().get(backend_id).map_or(0, |b| b.failure_count)
    }

    /// Snapshot of every known breaker, sorted by backend id.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let breakers = self.lock();
        let mut out: Vec<_> = breakers
            .iter()
            .map(|(id, b)| BreakerSnapshot {
                backend_id: id.clone(),
                state: b.state,
                failure_count: b.failure_count,
                failure_threshold: self.config.failure_threshold,
                recovery_timeout_ms: self.config.recovery_timeout.as_millis() as u64,
                open_for_ms: b
                    .opened_at
                    .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            })
            .collect();
        out.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        out
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(threshold: u32, recovery_secs: u64) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(recovery_secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold() {
        let breakers = registry(3, 30);

        breakers.record_failure("qpu");
        breakers.record_failure("qpu");
        assert_eq!(breakers.state("qpu"), CircuitState::Closed);
        assert!(breakers.is_available("qpu"));

        breakers.record_failure("qpu");
        assert_eq!(breakers.state("qpu"), CircuitState::Open);
        assert!(!breakers.is_available("qpu"));
        assert!(!breakers.would_admit("qpu"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breakers = registry(3, 30);
        breakers.record_failure("qpu");
        breakers.record_failure("qpu");
        breakers.record_success("qpu");
        assert_eq!(breakers.failure_count("qpu"), 0);

        breakers.record_failure("qpu");
        breakers.record_failure("qpu");
        assert_eq!(breakers.state("qpu"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_recovery() {
        let breakers = registry(1, 30);
        breakers.record_failure("qpu");
        assert!(!breakers.is_available("qpu"));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breakers.is_available("qpu"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breakers.would_admit("qpu"));
        assert!(breakers.is_available("qpu"));
        assert_eq!(breakers.state("qpu"), CircuitState::HalfOpen);

        // Trial in flight: everyone else is refused.
        assert!(!breakers.is_available("qpu"));
        assert!(!breakers.is_available("qpu"));
        assert!(!breakers.would_admit("qpu"));

        breakers.record_success("qpu");
        assert_eq!(breakers.state("qpu"), CircuitState::Closed);
        assert!(breakers.is_available("qpu"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_fresh_timer() {
        let breakers = registry(1, 30);
        breakers.record_failure("qpu");
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breakers.is_available("qpu"));

        breakers.record_failure("qpu");
        assert_eq!(breakers.state("qpu"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!breakers.is_available("qpu"));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breakers.is_available("qpu"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_returns_trial() {
        let breakers = registry(1, 5);
        breakers.record_failure("qpu");
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(breakers.is_available("qpu"));
        assert!(!breakers.is_available("qpu"));

        breakers.release("qpu");
        assert_eq!(breakers.state("qpu"), CircuitState::HalfOpen);
        assert!(breakers.is_available("qpu"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot() {
        let breakers = registry(2, 10);
        assert!(breakers.is_available("classical-a"));
        breakers.record_failure("qpu");
        breakers.record_failure("qpu");

        let snapshot = breakers.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].backend_id, "classical-a");
        assert_eq!(snapshot[0].state, CircuitState::Closed);
        assert_eq!(snapshot[1].state, CircuitState::Open);
        assert_eq!(snapshot[1].failure_count, 2);
        assert_eq!(snapshot[1].open_for_ms, Some(0));
    }

    #[test]
    fn test_unknown_backend_is_closed() {
        let breakers = CircuitBreakerRegistry::default();
        assert_eq!(breakers.state("nothing"), CircuitState::Closed);
        assert_eq!(breakers.failure_count("nothing"), 0);
        assert!(breakers.would_admit("nothing"));
    }
}
