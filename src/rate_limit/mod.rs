//! Adaptive per-domain rate limiting.
//!
//! Admission is a sliding 60-second window of request timestamps. Feedback
//! shapes the limit: 429s (or accumulated errors) halve it after a cooldown,
//! sustained success slowly raises it back toward the ceiling.

pub mod distributed;
mod state;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RateLimitConfig;
use crate::domains::DomainMap;
use crate::error::{FetchError, FetchResult};

pub use distributed::{BatchOutcome, DistributedRateLimiter, DistributedStats};
pub use state::{DomainRateState, WINDOW};

/// Per-domain stats snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub requests_per_minute: u32,
    pub remaining: u32,
    pub error_count: u32,
    pub total_admitted: u64,
    pub total_rejected: u64,
}

/// Adaptive sliding-window rate limiter, in-process.
pub struct RateLimiter {
    config: RateLimitConfig,
    domains: Arc<DomainMap<DomainRateState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let ttl = Duration::from_secs(config.domain_ttl_secs);
        Self {
            config,
            domains: Arc::new(DomainMap::new(ttl)),
        }
    }

    /// Extract the domain key from a URL.
    pub fn extract_domain(url: &str) -> Option<String> {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|s| s.to_string()))
    }

    async fn state(&self, domain: &str) -> Arc<tokio::sync::Mutex<DomainRateState>> {
        self.domains
            .get_or_create(domain, || DomainRateState::new(&self.config))
            .await
    }

    /// Admit one request or fail with a retry-after estimate.
    ///
    /// The per-domain lock is held across the prune-check-record sequence,
    /// so concurrent admissions can never jointly exceed the limit.
    pub async fn try_acquire(&self, domain: &str) -> FetchResult<()> {
        let state = self.state(domain).await;
        let mut state = state.lock().await;
        match state.try_admit(Instant::now()) {
            Ok(()) => Ok(()),
            Err(retry_after) => {
                debug!(
                    "Rate limit window full for {} (limit {}), retry in {:?}",
                    domain, state.requests_per_minute, retry_after
                );
                Err(FetchError::RateLimitExceeded {
                    domain: domain.to_string(),
                    retry_after,
                })
            }
        }
    }

    /// Admit up to `count` requests, returning how many were admitted.
    /// Used as the same-ceiling fallback for the distributed limiter.
    pub async fn try_acquire_many(&self, domain: &str, count: u32) -> u32 {
        let state = self.state(domain).await;
        let mut state = state.lock().await;
        let now = Instant::now();
        let mut admitted = 0;
        for _ in 0..count {
            if state.try_admit(now).is_err() {
                break;
            }
            admitted += 1;
        }
        admitted
    }

    /// Report an error response. 429 triggers an immediate halving attempt;
    /// other errors accumulate toward the error threshold.
    pub async fn record_error(&self, domain: &str, status_code: u16) {
        let state = self.state(domain).await;
        let mut state = state.lock().await;
        let now = Instant::now();

        let should_decrease = if status_code == 429 {
            true
        } else {
            state.error_count += 1;
            state.error_count >= self.config.error_threshold
        };

        if should_decrease {
            if let Some(new_limit) = state.maybe_decrease(now, &self.config) {
                warn!(
                    "Rate limit halved for {} (HTTP {}): now {} req/min",
                    domain, status_code, new_limit
                );
            }
        }
    }

    /// Report a successful response; may raise the limit after the quiet
    /// period.
    pub async fn record_success(&self, domain: &str) {
        let state = self.state(domain).await;
        let mut state = state.lock().await;
        if let Some(new_limit) = state.maybe_increase(Instant::now(), &self.config) {
            info!("Rate limit raised for {}: now {} req/min", domain, new_limit);
        }
    }

    /// Current limit for a domain (the configured default if unseen).
    pub async fn current_limit(&self, domain: &str) -> u32 {
        match self.domains.get(domain).await {
            Some(state) => state.lock().await.requests_per_minute,
            None => self.config.requests_per_minute,
        }
    }

    /// Admissions left in the current window.
    pub async fn remaining(&self, domain: &str) -> u32 {
        match self.domains.get(domain).await {
            Some(state) => state.lock().await.remaining(Instant::now()),
            None => self.config.requests_per_minute,
        }
    }

    /// Snapshot stats for all tracked domains.
    pub async fn stats(&self) -> HashMap<String, RateLimitStats> {
        let mut out = HashMap::new();
        for domain in self.domains.domains().await {
            if let Some(state) = self.domains.get(&domain).await {
                let mut state = state.lock().await;
                let remaining = state.remaining(Instant::now());
                out.insert(
                    domain,
                    RateLimitStats {
                        requests_per_minute: state.requests_per_minute,
                        remaining,
                        error_count: state.error_count,
                        total_admitted: state.total_admitted,
                        total_rejected: state.total_rejected,
                    },
                );
            }
        }
        out
    }

    /// Drop state for domains idle past the TTL.
    pub async fn evict_stale(&self) -> usize {
        self.domains.evict_stale().await
    }
}
