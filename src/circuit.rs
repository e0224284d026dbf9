//! Per-domain circuit breaker.
//!
//! CLOSED admits traffic, OPEN rejects immediately, HALF_OPEN lets exactly
//! one probe through after the recovery timeout. Failures carry a severity
//! weighted by how often the same failure signature has recurred in the
//! bounded history, so a repeating identical failure opens the circuit
//! faster than a scatter of novel ones.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::domains::DomainMap;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn label(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct FailureRecord {
    signature: u64,
    weight: f64,
}

/// Per-domain breaker state.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Weighted failure score; resets to 0 on transition to CLOSED.
    failure_score: f64,
    last_failure: Option<Instant>,
    /// Bounded ring of recent failures for severity weighting.
    history: VecDeque<FailureRecord>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_score: 0.0,
            last_failure: None,
            history: VecDeque::new(),
        }
    }

    fn signature_count(&self, signature: u64) -> usize {
        self.history
            .iter()
            .filter(|r| r.signature == signature)
            .count()
    }
}

/// Snapshot for stats surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failure_score: f64,
    pub history_len: usize,
}

/// Per-domain CLOSED/OPEN/HALF_OPEN state machine.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    recovery_timeout: Duration,
    domains: Arc<DomainMap<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            recovery_timeout: config.recovery_timeout(),
            config,
            // Breaker state is small; keep it as long as rate-limit state.
            domains: Arc::new(DomainMap::new(Duration::from_secs(3600))),
        }
    }

    #[cfg(test)]
    fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    #[cfg(test)]
    fn with_domain_ttl(mut self, ttl: Duration) -> Self {
        self.domains = Arc::new(DomainMap::new(ttl));
        self
    }

    /// Drop state for domains idle past the TTL. Returns the evicted count.
    pub async fn evict_stale(&self) -> usize {
        self.domains.evict_stale().await
    }

    async fn state(&self, domain: &str) -> Arc<tokio::sync::Mutex<BreakerState>> {
        self.domains.get_or_create(domain, BreakerState::new).await
    }

    /// Whether a call may proceed. An OPEN circuit flips to HALF_OPEN here
    /// once the recovery timeout has elapsed, admitting a single probe.
    pub async fn can_execute(&self, domain: &str) -> bool {
        let state = self.state(domain).await;
        let mut state = state.lock().await;
        match state.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                // The probe is already in flight; hold further calls.
                false
            }
            CircuitState::Open => {
                let elapsed = state
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.recovery_timeout {
                    state.state = CircuitState::HalfOpen;
                    info!("Circuit for {} half-open, probing", domain);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a success. Returns the new state when a transition occurred.
    pub async fn record_success(&self, domain: &str) -> Option<CircuitState> {
        let state = self.state(domain).await;
        let mut state = state.lock().await;
        match state.state {
            CircuitState::HalfOpen => {
                state.state = CircuitState::Closed;
                state.failure_score = 0.0;
                state.history.clear();
                info!("Circuit for {} closed after successful probe", domain);
                Some(CircuitState::Closed)
            }
            CircuitState::Closed => {
                // Successes bleed off accumulated score slowly.
                state.failure_score = (state.failure_score - 1.0).max(0.0);
                None
            }
            CircuitState::Open => None,
        }
    }

    /// Record a failure with a signature context (error kind plus whatever
    /// identifies the failure site). Returns the new state when a transition
    /// occurred.
    pub async fn record_failure(&self, domain: &str, context: &str) -> Option<CircuitState> {
        let signature = Self::signature(context);
        let state = self.state(domain).await;
        let mut state = state.lock().await;

        let repeats = state.signature_count(signature);
        let weight = (self.config.severity_base + self.config.severity_step * repeats as f64)
            .min(self.config.severity_cap);

        state.history.push_back(FailureRecord { signature, weight });
        while state.history.len() > self.config.history_size {
            state.history.pop_front();
        }
        state.failure_score += weight;
        state.last_failure = Some(Instant::now());

        match state.state {
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                warn!("Circuit for {} re-opened, probe failed", domain);
                Some(CircuitState::Open)
            }
            CircuitState::Closed if state.failure_score >= self.config.failure_threshold => {
                state.state = CircuitState::Open;
                warn!(
                    "Circuit for {} opened (score {:.1} >= {:.1})",
                    domain, state.failure_score, self.config.failure_threshold
                );
                Some(CircuitState::Open)
            }
            _ => {
                debug!(
                    "Failure for {} weighted {:.2}, score {:.2}",
                    domain, weight, state.failure_score
                );
                None
            }
        }
    }

    /// Current state without side effects.
    pub async fn current_state(&self, domain: &str) -> CircuitState {
        match self.domains.get(domain).await {
            Some(state) => state.lock().await.state,
            None => CircuitState::Closed,
        }
    }

    /// Snapshot stats for all tracked domains.
    pub async fn stats(&self) -> HashMap<String, CircuitStats> {
        let mut out = HashMap::new();
        for domain in self.domains.domains().await {
            if let Some(state) = self.domains.get(&domain).await {
                let state = state.lock().await;
                out.insert(
                    domain,
                    CircuitStats {
                        state: state.state,
                        failure_score: state.failure_score,
                        history_len: state.history.len(),
                    },
                );
            }
        }
        out
    }

    fn signature(context: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        context.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: f64, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            severity_step: 0.0,
            ..Default::default()
        })
        .with_recovery_timeout(Duration::from_millis(recovery_ms))
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let breaker = breaker(5.0, 10_000);

        for _ in 0..4 {
            assert!(breaker.record_failure("example.com", "network").await.is_none());
            assert!(breaker.can_execute("example.com").await);
        }
        assert_eq!(
            breaker.record_failure("example.com", "network").await,
            Some(CircuitState::Open)
        );
        assert!(!breaker.can_execute("example.com").await);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_probe() {
        let breaker = breaker(1.0, 20);

        breaker.record_failure("example.com", "network").await;
        assert!(!breaker.can_execute("example.com").await);

        tokio::time::sleep(Duration::from_millis(40)).await;

        // First call after the timeout is the probe, and exactly one.
        assert!(breaker.can_execute("example.com").await);
        assert!(!breaker.can_execute("example.com").await);
    }

    #[tokio::test]
    async fn test_probe_success_closes() {
        let breaker = breaker(1.0, 10);
        breaker.record_failure("example.com", "network").await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(breaker.can_execute("example.com").await);
        assert_eq!(
            breaker.record_success("example.com").await,
            Some(CircuitState::Closed)
        );
        assert_eq!(
            breaker.current_state("example.com").await,
            CircuitState::Closed
        );
        assert!(breaker.can_execute("example.com").await);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let breaker = breaker(1.0, 10);
        breaker.record_failure("example.com", "network").await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(breaker.can_execute("example.com").await);
        assert_eq!(
            breaker.record_failure("example.com", "network").await,
            Some(CircuitState::Open)
        );
        assert!(!breaker.can_execute("example.com").await);
    }

    #[tokio::test]
    async fn test_repeated_signature_weighs_heavier() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5.0,
            severity_base: 1.0,
            severity_step: 0.5,
            severity_cap: 3.0,
            ..Default::default()
        });

        // Identical signature: weights 1.0 + 1.5 + 2.0 + 2.5 cross 5.0 at
        // the fourth failure instead of the fifth.
        breaker.record_failure("example.com", "timeout /search").await;
        breaker.record_failure("example.com", "timeout /search").await;
        breaker.record_failure("example.com", "timeout /search").await;
        assert_eq!(
            breaker.record_failure("example.com", "timeout /search").await,
            Some(CircuitState::Open)
        );
    }

    #[tokio::test]
    async fn test_domains_are_independent() {
        let breaker = breaker(1.0, 10_000);
        breaker.record_failure("a.example", "network").await;
        assert!(!breaker.can_execute("a.example").await);
        assert!(breaker.can_execute("b.example").await);
    }

    #[tokio::test]
    async fn test_evict_stale_drops_idle_domains() {
        let breaker = breaker(1.0, 10_000).with_domain_ttl(Duration::from_millis(10));
        breaker.record_failure("example.com", "network").await;
        assert!(!breaker.can_execute("example.com").await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.evict_stale().await, 1);

        // Fresh state after eviction: the domain starts closed again.
        assert_eq!(
            breaker.current_state("example.com").await,
            CircuitState::Closed
        );
        assert!(breaker.can_execute("example.com").await);
    }
}
