//! Configuration for the fetch layer.
//!
//! Everything is supplied as a single object at construction; there is no
//! runtime reconfiguration surface. `FetcherConfig::validate` is the one
//! place malformed configuration is caught, before any state is built.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FetchError, FetchResult};

/// Top-level configuration for [`crate::fetch::Fetcher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Local adaptive rate limiter settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Redis-distributed rate limiter. `None` disables the distributed gate;
    /// the local limiter always applies.
    #[serde(default)]
    pub distributed: Option<DistributedRateLimitConfig>,

    /// Circuit breaker settings.
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,

    /// Proxy URLs (e.g. "socks5://127.0.0.1:1080"). Empty list means direct
    /// connections only.
    #[serde(default)]
    pub proxies: Vec<String>,

    /// Proxy scoring/ban settings.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Browser session pool settings.
    #[serde(default)]
    pub browser: BrowserPoolConfig,

    /// Retry/backoff policy applied to network-class failures.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Total per-attempt HTTP timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Connect timeout in seconds (shorter than the total timeout).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Overall wall-clock bound on one `fetch` call, covering retries and
    /// browser fallback. Firing mid-schedule cancels remaining retries.
    #[serde(default = "default_total_timeout_secs")]
    pub total_timeout_secs: u64,
}

impl FetcherConfig {
    /// Validate the whole configuration tree. Called by the fetcher
    /// constructor; fails fast with [`FetchError::Validation`].
    pub fn validate(&self) -> FetchResult<()> {
        self.rate_limit.validate()?;
        if let Some(d) = &self.distributed {
            d.validate()?;
        }
        self.circuit.validate()?;
        self.retry.validate()?;
        if self.browser.max_sessions == 0 {
            return Err(FetchError::Validation(
                "browser.max_sessions must be at least 1".into(),
            ));
        }
        if self.connect_timeout_secs > self.request_timeout_secs {
            return Err(FetchError::Validation(
                "connect timeout exceeds total request timeout".into(),
            ));
        }
        if self.total_timeout_secs < self.request_timeout_secs {
            return Err(FetchError::Validation(
                "total_timeout_secs below per-attempt request timeout".into(),
            ));
        }
        for proxy in &self.proxies {
            if url::Url::parse(proxy).is_err() {
                return Err(FetchError::Validation(format!(
                    "invalid proxy url: {proxy}"
                )));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            distributed: None,
            circuit: CircuitBreakerConfig::default(),
            proxies: Vec::new(),
            proxy: ProxyConfig::default(),
            browser: BrowserPoolConfig::default(),
            retry: RetryPolicy::default(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            total_timeout_secs: default_total_timeout_secs(),
        }
    }
}

/// Local adaptive rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Starting requests-per-minute for a new domain.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Hard cap on admitted timestamps kept per window.
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,

    /// Ceiling the limit can recover to.
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,

    /// Accumulated (non-429) errors that trigger a halving.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// Minimum seconds between downward adjustments.
    #[serde(default = "default_decrease_cooldown_secs")]
    pub decrease_cooldown_secs: u64,

    /// Quiet seconds of success before a 20% increase.
    #[serde(default = "default_increase_cooldown_secs")]
    pub increase_cooldown_secs: u64,

    /// Idle seconds before a domain's state is evicted.
    #[serde(default = "default_domain_ttl_secs")]
    pub domain_ttl_secs: u64,
}

impl RateLimitConfig {
    pub fn validate(&self) -> FetchResult<()> {
        if self.requests_per_minute == 0 {
            return Err(FetchError::Validation(
                "rate_limit.requests_per_minute must be positive".into(),
            ));
        }
        if self.burst_limit == 0 {
            return Err(FetchError::Validation(
                "rate_limit.burst_limit must be positive".into(),
            ));
        }
        if self.max_requests_per_minute < self.requests_per_minute {
            return Err(FetchError::Validation(
                "rate_limit.max_requests_per_minute below starting limit".into(),
            ));
        }
        Ok(())
    }

    pub fn decrease_cooldown(&self) -> Duration {
        Duration::from_secs(self.decrease_cooldown_secs)
    }

    pub fn increase_cooldown(&self) -> Duration {
        Duration::from_secs(self.increase_cooldown_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            burst_limit: default_burst_limit(),
            max_requests_per_minute: default_max_requests_per_minute(),
            error_threshold: default_error_threshold(),
            decrease_cooldown_secs: default_decrease_cooldown_secs(),
            increase_cooldown_secs: default_increase_cooldown_secs(),
            domain_ttl_secs: default_domain_ttl_secs(),
        }
    }
}

/// Redis-distributed rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedRateLimitConfig {
    /// Redis endpoints tried in round-robin order on failure.
    pub endpoints: Vec<String>,

    /// Key prefix for limiter state in Redis.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Starting batch size for acquisitions.
    #[serde(default = "default_batch_size")]
    pub initial_batch_size: u32,

    /// Batch size ceiling.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,

    /// Redis attempts per acquisition before rotating endpoints.
    #[serde(default = "default_redis_retries")]
    pub redis_retries: u32,

    /// Fall back to the in-process limiter when Redis is unreachable.
    /// The fallback enforces the same numeric ceiling; it never admits
    /// unlimited traffic.
    #[serde(default = "default_true")]
    pub fallback_to_local: bool,

    /// Optional per-endpoint-class RPM caps (e.g. "search", "listing",
    /// "contact") scaling below the domain ceiling.
    #[serde(default)]
    pub endpoint_limits: HashMap<String, u32>,
}

impl DistributedRateLimitConfig {
    pub fn validate(&self) -> FetchResult<()> {
        if self.endpoints.is_empty() {
            return Err(FetchError::Validation(
                "distributed.endpoints must not be empty".into(),
            ));
        }
        if self.initial_batch_size == 0 || self.max_batch_size == 0 {
            return Err(FetchError::Validation(
                "distributed batch sizes must be positive".into(),
            ));
        }
        if self.initial_batch_size > self.max_batch_size {
            return Err(FetchError::Validation(
                "distributed.initial_batch_size exceeds max_batch_size".into(),
            ));
        }
        for (endpoint, limit) in &self.endpoint_limits {
            if *limit == 0 {
                return Err(FetchError::Validation(format!(
                    "distributed.endpoint_limits[{endpoint}] must be positive"
                )));
            }
        }
        Ok(())
    }
}

impl Default for DistributedRateLimitConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["redis://127.0.0.1:6379".to_string()],
            key_prefix: default_key_prefix(),
            initial_batch_size: default_batch_size(),
            max_batch_size: default_max_batch_size(),
            redis_retries: default_redis_retries(),
            fallback_to_local: true,
            endpoint_limits: HashMap::new(),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Weighted failure score that opens the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,

    /// Seconds the circuit stays OPEN before a HALF_OPEN probe.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,

    /// Failure history ring buffer size.
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Base weight of a novel failure.
    #[serde(default = "default_severity_base")]
    pub severity_base: f64,

    /// Extra weight per repeat of the same failure signature in the history.
    #[serde(default = "default_severity_step")]
    pub severity_step: f64,

    /// Cap on a single failure's weight.
    #[serde(default = "default_severity_cap")]
    pub severity_cap: f64,
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> FetchResult<()> {
        if self.failure_threshold <= 0.0 {
            return Err(FetchError::Validation(
                "circuit.failure_threshold must be positive".into(),
            ));
        }
        if self.history_size == 0 {
            return Err(FetchError::Validation(
                "circuit.history_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            history_size: default_history_size(),
            severity_base: default_severity_base(),
            severity_step: default_severity_step(),
            severity_cap: default_severity_cap(),
        }
    }
}

/// Proxy scoring and ban settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Per-domain reuse cooldown in seconds.
    #[serde(default = "default_proxy_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Consecutive failures before a proxy is banned for a domain.
    #[serde(default = "default_proxy_ban_threshold")]
    pub ban_threshold: u32,

    /// Base ban duration in seconds; doubles per failure past the threshold.
    #[serde(default = "default_proxy_ban_base_secs")]
    pub ban_base_secs: u64,

    /// Ban duration ceiling in seconds.
    #[serde(default = "default_proxy_ban_max_secs")]
    pub ban_max_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_proxy_cooldown_secs(),
            ban_threshold: default_proxy_ban_threshold(),
            ban_base_secs: default_proxy_ban_base_secs(),
            ban_max_secs: default_proxy_ban_max_secs(),
        }
    }
}

/// Browser session pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserPoolConfig {
    /// Whether the browser fallback path is available at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Hard bound on live sessions; LRU eviction beyond this.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Run headless (set false when debugging detection issues).
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Page navigation timeout in seconds (shorter than the HTTP total).
    #[serde(default = "default_navigation_timeout_secs")]
    pub navigation_timeout_secs: u64,

    /// Additional Chrome arguments.
    #[serde(default)]
    pub chrome_args: Vec<String>,

    /// Remote Chrome DevTools URL; if set, connect instead of launching.
    #[serde(default)]
    pub remote_url: Option<String>,
}

impl BrowserPoolConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_sessions: default_max_sessions(),
            headless: true,
            navigation_timeout_secs: default_navigation_timeout_secs(),
            chrome_args: Vec::new(),
            remote_url: None,
        }
    }
}

/// Retry/backoff policy. A value object: constructed once, no mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Delay ceiling in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Uniform jitter added to each delay, as a fraction of one second.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl RetryPolicy {
    pub fn validate(&self) -> FetchResult<()> {
        if self.base_delay_ms > self.max_delay_ms {
            return Err(FetchError::Validation(
                "retry.base_delay_ms exceeds max_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(FetchError::Validation(
                "retry.jitter_factor must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

fn default_requests_per_minute() -> u32 {
    10
}

fn default_burst_limit() -> u32 {
    30
}

fn default_max_requests_per_minute() -> u32 {
    30
}

fn default_error_threshold() -> u32 {
    5
}

fn default_decrease_cooldown_secs() -> u64 {
    60
}

fn default_increase_cooldown_secs() -> u64 {
    300
}

fn default_domain_ttl_secs() -> u64 {
    3600
}

fn default_key_prefix() -> String {
    "prospector:ratelimit".to_string()
}

fn default_batch_size() -> u32 {
    10
}

fn default_max_batch_size() -> u32 {
    100
}

fn default_redis_retries() -> u32 {
    3
}

fn default_failure_threshold() -> f64 {
    5.0
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_history_size() -> usize {
    50
}

fn default_severity_base() -> f64 {
    1.0
}

fn default_severity_step() -> f64 {
    0.25
}

fn default_severity_cap() -> f64 {
    3.0
}

fn default_proxy_cooldown_secs() -> u64 {
    5
}

fn default_proxy_ban_threshold() -> u32 {
    3
}

fn default_proxy_ban_base_secs() -> u64 {
    30
}

fn default_proxy_ban_max_secs() -> u64 {
    3600
}

fn default_max_sessions() -> usize {
    5
}

fn default_navigation_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_factor() -> f64 {
    1.0
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_total_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}
