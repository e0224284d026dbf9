//! Typed errors surfaced at the fetch boundary.
//!
//! Recovery is local wherever a numeric policy exists; callers only see an
//! error once no local recovery option remains (circuit open, all proxies
//! banned, retries exhausted).

use std::time::Duration;

use thiserror::Error;

use crate::captcha::CaptchaKind;

/// Errors surfaced by the fetch layer.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The domain's request window is full. Carries a wait-time hint so the
    /// caller can requeue instead of spinning.
    #[error("rate limit exceeded for {domain}, retry after {retry_after:?}")]
    RateLimitExceeded {
        domain: String,
        retry_after: Duration,
    },

    /// Circuit breaker is OPEN for this domain; no network call was made.
    #[error("circuit open for {domain}")]
    CircuitOpen { domain: String },

    /// Connection, timeout, or DNS failure. Retried per policy before being
    /// surfaced.
    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },

    /// Every configured proxy is currently banned for this domain.
    #[error("all proxies banned for {domain}")]
    Proxy { domain: String },

    /// Fallback content was classified as a CAPTCHA challenge. Fatal for this
    /// fetch attempt; never retried automatically.
    #[error("captcha challenge ({kind:?}) at {url}")]
    Captcha { url: String, kind: CaptchaKind },

    /// Headless session init or navigation failure after the fallback path
    /// was attempted.
    #[error("browser fallback failed for {url}: {message}")]
    Browser { url: String, message: String },

    /// Malformed configuration. Fatal at construction time.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// Distributed rate limiter lost all Redis endpoints and fallback is
    /// disabled.
    #[error("redis error: {0}")]
    Redis(String),
}

impl FetchError {
    /// Whether the retry controller may re-attempt after this error.
    /// Only network-class failures are on the allow-list; everything else
    /// propagates immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Network { .. })
    }

    /// Short label used as the `error_type` metrics dimension.
    pub fn kind_label(&self) -> &'static str {
        match self {
            FetchError::RateLimitExceeded { .. } => "rate_limited",
            FetchError::CircuitOpen { .. } => "circuit_open",
            FetchError::Network { .. } => "network",
            FetchError::Proxy { .. } => "proxy",
            FetchError::Captcha { .. } => "captcha",
            FetchError::Browser { .. } => "browser",
            FetchError::Validation(_) => "validation",
            FetchError::Redis(_) => "redis",
        }
    }

    pub(crate) fn network(url: &str, err: impl std::fmt::Display) -> Self {
        FetchError::Network {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_are_retryable() {
        assert!(FetchError::network("https://example.com", "timed out").is_retryable());
        assert!(!FetchError::CircuitOpen {
            domain: "example.com".into()
        }
        .is_retryable());
        assert!(!FetchError::Captcha {
            url: "https://example.com".into(),
            kind: CaptchaKind::Recaptcha,
        }
        .is_retryable());
        assert!(!FetchError::Validation("bad".into()).is_retryable());
    }
}
