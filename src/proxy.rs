//! Proxy scoring, selection, and temporary bans, per domain.
//!
//! Each (domain, proxy) pair carries a performance score in [0, 1] that
//! decays on failure and recovers on success. Selection excludes banned and
//! recently-used proxies, then takes the best-scoring candidate with ties
//! broken by first-seen order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::domains::DomainMap;
use crate::error::{FetchError, FetchResult};

/// A selected proxy: stable index plus URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHandle {
    pub id: usize,
    pub url: String,
}

impl ProxyHandle {
    /// Build the reqwest proxy for this handle.
    pub fn to_reqwest_proxy(&self) -> Result<reqwest::Proxy, reqwest::Error> {
        reqwest::Proxy::all(&self.url)
    }
}

/// Score/ban state for one (domain, proxy) pair.
#[derive(Debug, Clone)]
struct ProxyState {
    performance: f64,
    failure_count: u32,
    usage_count: u32,
    banned_until: Option<Instant>,
    last_used: Option<Instant>,
}

impl ProxyState {
    fn new() -> Self {
        Self {
            performance: 1.0,
            failure_count: 0,
            usage_count: 0,
            banned_until: None,
            last_used: None,
        }
    }

    fn is_banned(&self, now: Instant) -> bool {
        matches!(self.banned_until, Some(until) if until > now)
    }

    fn in_cooldown(&self, now: Instant, cooldown: Duration) -> bool {
        matches!(self.last_used, Some(last) if now.duration_since(last) < cooldown)
    }

    fn selection_score(&self) -> f64 {
        (self.performance
            - 0.1 * self.usage_count as f64
            - 0.2 * self.failure_count as f64)
            .max(0.1)
    }
}

/// Stats snapshot for one (domain, proxy) pair.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStats {
    pub url: String,
    pub performance: f64,
    pub failure_count: u32,
    pub usage_count: u32,
    pub banned: bool,
}

/// Scores, selects, and temporarily bans proxies per domain.
pub struct ProxyManager {
    proxies: Vec<String>,
    config: ProxyConfig,
    domains: Arc<DomainMap<HashMap<usize, ProxyState>>>,
}

impl ProxyManager {
    pub fn new(proxies: Vec<String>, config: ProxyConfig) -> Self {
        Self {
            proxies,
            config,
            domains: Arc::new(DomainMap::new(Duration::from_secs(3600))),
        }
    }

    pub fn proxy_urls(&self) -> &[String] {
        &self.proxies
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    #[cfg(test)]
    fn with_domain_ttl(mut self, ttl: Duration) -> Self {
        self.domains = Arc::new(DomainMap::new(ttl));
        self
    }

    /// Drop scores for domains idle past the TTL. Returns the evicted count.
    pub async fn evict_stale(&self) -> usize {
        self.domains.evict_stale().await
    }

    async fn states(&self, domain: &str) -> Arc<tokio::sync::Mutex<HashMap<usize, ProxyState>>> {
        self.domains.get_or_create(domain, HashMap::new).await
    }

    /// Pick the best available proxy for a domain.
    ///
    /// `Ok(None)` means every usable proxy is merely cooling down; the
    /// caller may go direct or wait. All-banned is an error.
    pub async fn select_best(&self, domain: &str) -> FetchResult<Option<ProxyHandle>> {
        if self.proxies.is_empty() {
            return Ok(None);
        }

        let states = self.states(domain).await;
        let mut states = states.lock().await;
        let now = Instant::now();
        let cooldown = Duration::from_secs(self.config.cooldown_secs);

        let mut best: Option<(usize, f64)> = None;
        let mut banned = 0usize;

        // Iterate in registration order so score ties go to the
        // first-seen proxy.
        for id in 0..self.proxies.len() {
            let state = states.entry(id).or_insert_with(ProxyState::new);
            if state.is_banned(now) {
                banned += 1;
                continue;
            }
            if state.in_cooldown(now, cooldown) {
                continue;
            }
            let score = state.selection_score();
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((id, score));
            }
        }

        if let Some((id, score)) = best {
            let state = states.get_mut(&id).expect("candidate state exists");
            state.usage_count += 1;
            state.last_used = Some(now);
            debug!(
                "Selected proxy {} for {} (score {:.2})",
                self.proxies[id], domain, score
            );
            return Ok(Some(ProxyHandle {
                id,
                url: self.proxies[id].clone(),
            }));
        }

        if banned == self.proxies.len() {
            warn!("All {} proxies banned for {}", banned, domain);
            return Err(FetchError::Proxy {
                domain: domain.to_string(),
            });
        }
        Ok(None)
    }

    /// Report a successful request through a proxy. Score rises by 0.1
    /// (capped at 1.0) and one failure is forgiven.
    pub async fn report_success(&self, domain: &str, proxy: &ProxyHandle) -> f64 {
        let states = self.states(domain).await;
        let mut states = states.lock().await;
        let state = states.entry(proxy.id).or_insert_with(ProxyState::new);
        state.performance = (state.performance + 0.1).min(1.0);
        state.failure_count = state.failure_count.saturating_sub(1);
        state.performance
    }

    /// Report a failed request through a proxy. Score decays by x0.8; once
    /// failures reach the threshold the proxy is banned for this domain with
    /// exponentially growing duration.
    pub async fn report_failure(
        &self,
        domain: &str,
        proxy: &ProxyHandle,
        status_code: Option<u16>,
    ) -> f64 {
        let states = self.states(domain).await;
        let mut states = states.lock().await;
        let state = states.entry(proxy.id).or_insert_with(ProxyState::new);
        state.performance *= 0.8;
        state.failure_count += 1;

        if state.failure_count >= self.config.ban_threshold {
            let ban = self.ban_duration(state.failure_count);
            state.banned_until = Some(Instant::now() + ban);
            warn!(
                "Proxy {} banned for {} for {:?} ({} failures, status {:?})",
                proxy.url, domain, ban, state.failure_count, status_code
            );
        }
        state.performance
    }

    /// Ban duration for the nth consecutive failure:
    /// `min(base * 2^(n - threshold), max)`.
    fn ban_duration(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(self.config.ban_threshold).min(32);
        let secs = self
            .config
            .ban_base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.config.ban_max_secs);
        Duration::from_secs(secs)
    }

    /// Clear score, failures, and any ban for a (domain, proxy) pair.
    pub async fn reset_proxy(&self, domain: &str, proxy: &ProxyHandle) {
        let states = self.states(domain).await;
        let mut states = states.lock().await;
        states.insert(proxy.id, ProxyState::new());
    }

    /// Snapshot stats for one domain.
    pub async fn stats(&self, domain: &str) -> Vec<ProxyStats> {
        let mut out = Vec::new();
        if let Some(states) = self.domains.get(domain).await {
            let states = states.lock().await;
            let now = Instant::now();
            for (id, url) in self.proxies.iter().enumerate() {
                if let Some(state) = states.get(&id) {
                    out.push(ProxyStats {
                        url: url.clone(),
                        performance: state.performance,
                        failure_count: state.failure_count,
                        usage_count: state.usage_count,
                        banned: state.is_banned(now),
                    });
                }
            }
        }
        out
    }
}
