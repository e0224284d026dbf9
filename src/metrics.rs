//! Per-domain metrics aggregation.
//!
//! Pure recorder with no control flow: counters for error types and circuit
//! transitions, gauges for proxy scores and rate-limit headroom, running
//! response-time and payload-size aggregates. Exported pull-style via
//! [`MetricsRecorder::render_text`]; the scrape backend itself is out of
//! scope.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;

/// Aggregated metrics for one domain.
#[derive(Debug, Clone, Serialize, Default)]
pub struct DomainMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Failures by error type label.
    pub errors: HashMap<String, u64>,
    /// Circuit transitions by target state label.
    pub circuit_transitions: HashMap<String, u64>,
    /// Gauge: last observed per-proxy performance score.
    pub proxy_scores: HashMap<String, f64>,
    /// Gauge: admissions left in the current rate-limit window.
    pub rate_limit_remaining: u32,
    pub retry_attempts: u64,
    pub browser_fallbacks: u64,
    pub captcha_challenges: u64,
    pub total_response_time_ms: u64,
    pub total_response_bytes: u64,
}

impl DomainMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    pub fn average_response_time_ms(&self) -> f64 {
        if self.successful_requests == 0 {
            0.0
        } else {
            self.total_response_time_ms as f64 / self.successful_requests as f64
        }
    }
}

/// Shared recorder, cheap to clone.
#[derive(Clone, Default)]
pub struct MetricsRecorder {
    domains: Arc<RwLock<HashMap<String, DomainMetrics>>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_success(&self, domain: &str, elapsed: Duration, bytes: usize) {
        let mut domains = self.domains.write().await;
        let m = domains.entry(domain.to_string()).or_default();
        m.total_requests += 1;
        m.successful_requests += 1;
        m.total_response_time_ms += elapsed.as_millis() as u64;
        m.total_response_bytes += bytes as u64;
    }

    pub async fn record_error(&self, domain: &str, error_type: &str) {
        let mut domains = self.domains.write().await;
        let m = domains.entry(domain.to_string()).or_default();
        m.total_requests += 1;
        m.failed_requests += 1;
        *m.errors.entry(error_type.to_string()).or_default() += 1;
    }

    pub async fn record_retry(&self, domain: &str) {
        let mut domains = self.domains.write().await;
        domains.entry(domain.to_string()).or_default().retry_attempts += 1;
    }

    pub async fn record_circuit_transition(&self, domain: &str, state: &str) {
        let mut domains = self.domains.write().await;
        let m = domains.entry(domain.to_string()).or_default();
        *m.circuit_transitions.entry(state.to_string()).or_default() += 1;
    }

    pub async fn record_proxy_score(&self, domain: &str, proxy: &str, score: f64) {
        let mut domains = self.domains.write().await;
        let m = domains.entry(domain.to_string()).or_default();
        m.proxy_scores.insert(proxy.to_string(), score);
    }

    pub async fn record_rate_limit_remaining(&self, domain: &str, remaining: u32) {
        let mut domains = self.domains.write().await;
        domains
            .entry(domain.to_string())
            .or_default()
            .rate_limit_remaining = remaining;
    }

    pub async fn record_browser_fallback(&self, domain: &str) {
        let mut domains = self.domains.write().await;
        domains
            .entry(domain.to_string())
            .or_default()
            .browser_fallbacks += 1;
    }

    pub async fn record_captcha(&self, domain: &str) {
        let mut domains = self.domains.write().await;
        domains
            .entry(domain.to_string())
            .or_default()
            .captcha_challenges += 1;
    }

    /// Snapshot of one domain's metrics.
    pub async fn domain(&self, domain: &str) -> Option<DomainMetrics> {
        self.domains.read().await.get(domain).cloned()
    }

    /// Snapshot of all domains.
    pub async fn snapshot(&self) -> HashMap<String, DomainMetrics> {
        self.domains.read().await.clone()
    }

    /// Render a Prometheus-style text exposition of all domains.
    pub async fn render_text(&self) -> String {
        let domains = self.domains.read().await;
        let mut out = String::new();
        for (domain, m) in domains.iter() {
            for (error_type, count) in &m.errors {
                out.push_str(&format!(
                    "domain_errors{{domain=\"{domain}\",error_type=\"{error_type}\"}} {count}\n"
                ));
            }
            for (state, count) in &m.circuit_transitions {
                out.push_str(&format!(
                    "circuit_breaker_transitions{{domain=\"{domain}\",state=\"{state}\"}} {count}\n"
                ));
            }
            for (proxy, score) in &m.proxy_scores {
                out.push_str(&format!(
                    "proxy_performance_score{{domain=\"{domain}\",proxy=\"{proxy}\"}} {score}\n"
                ));
            }
            out.push_str(&format!(
                "rate_limit_remaining{{domain=\"{domain}\"}} {}\n",
                m.rate_limit_remaining
            ));
            out.push_str(&format!(
                "response_time_seconds_sum{{domain=\"{domain}\"}} {}\n",
                m.total_response_time_ms as f64 / 1000.0
            ));
            out.push_str(&format!(
                "response_time_seconds_count{{domain=\"{domain}\"}} {}\n",
                m.successful_requests
            ));
            out.push_str(&format!(
                "success_rate{{domain=\"{domain}\"}} {}\n",
                m.success_rate()
            ));
        }
        out
    }
}
