//! prospector: resilient multi-source fetching for web-data aggregation.
//!
//! The crate wraps outbound HTTP in a layered defense against the failure
//! modes of scraping at scale: adaptive per-domain rate limiting (local
//! sliding window plus an optional Redis-shared window), a per-domain
//! circuit breaker with severity-weighted failure scoring, proxy rotation
//! with performance tracking and exponential ban backoff, retries with
//! jittered exponential backoff, and a headless-browser fallback with
//! CAPTCHA detection for hosts that reject plain clients.
//!
//! [`Fetcher`] is the entry point; everything else is reachable through it
//! but exported for callers that want to compose the pieces themselves.

pub mod browser;
pub mod captcha;
pub mod circuit;
pub mod config;
pub mod domains;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod proxy;
pub mod rate_limit;
pub mod retry;

pub use browser::{BrowserFetchResponse, BrowserSessionPool, SessionFetcher};
pub use captcha::{CaptchaChallenge, CaptchaDetector, CaptchaKind};
pub use circuit::{CircuitBreaker, CircuitState};
pub use config::{
    BrowserPoolConfig, CircuitBreakerConfig, DistributedRateLimitConfig, FetcherConfig,
    ProxyConfig, RateLimitConfig, RetryPolicy,
};
pub use error::{FetchError, FetchResult};
pub use fetch::{FetchRequest, FetchResponse, Fetcher, NextPage, PageRequest};
pub use metrics::{DomainMetrics, MetricsRecorder};
pub use proxy::{ProxyHandle, ProxyManager};
pub use rate_limit::{DistributedRateLimiter, RateLimiter};
pub use retry::with_retry;
