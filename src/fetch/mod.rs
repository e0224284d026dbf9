//! Fetch orchestration.
//!
//! Composes the circuit breaker, rate limiters, proxy manager, retry
//! controller, browser fallback, and CAPTCHA detector behind a single
//! `fetch(domain, request)` contract. Callers never see the internals;
//! they get a response, `None` for 429 backpressure, or a typed error.

mod fingerprint;

pub use fingerprint::{Fingerprint, ACCEPT_HEADERS, ACCEPT_LANGUAGES, USER_AGENTS};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use reqwest::{Client, Method};
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::browser::{BrowserSessionPool, SessionFetcher};
use crate::captcha::CaptchaDetector;
use crate::circuit::CircuitBreaker;
use crate::config::FetcherConfig;
use crate::error::{FetchError, FetchResult};
use crate::metrics::MetricsRecorder;
use crate::proxy::ProxyManager;
use crate::rate_limit::{DistributedRateLimiter, RateLimiter, WINDOW};
use crate::retry::with_retry;

/// One outbound request at the fetch boundary.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    /// Endpoint class for distributed per-endpoint sub-limits.
    pub endpoint_class: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            endpoint_class: None,
        }
    }

    pub fn with_endpoint_class(mut self, class: impl Into<String>) -> Self {
        self.endpoint_class = Some(class.into());
        self
    }
}

/// Response at the fetch boundary.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub final_url: String,
    /// Whether this came through the browser fallback path.
    pub from_browser: bool,
}

impl FetchResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// How the paginated fetch finds the next page.
#[derive(Debug, Clone)]
pub enum NextPage {
    /// CSS selector whose first match's `href` is the next-page link.
    Selector(String),
    /// JSON continuation token: read `field` from the response body and
    /// pass it back as query parameter `param`.
    Token { field: String, param: String },
}

/// A paginated fetch request.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub url: String,
    pub next: NextPage,
    /// Page-count ceiling.
    pub max_pages: u32,
    /// Elapsed-time-since-last-success ceiling in seconds.
    pub stall_timeout_secs: u64,
    pub endpoint_class: Option<String>,
}

/// The fetch orchestrator.
///
/// All collaborators are owned here and constructor-injected where a seam
/// matters (the browser pool is behind [`SessionFetcher`]); there are no
/// process-wide singletons.
pub struct Fetcher {
    config: FetcherConfig,
    direct_client: Client,
    /// Index-aligned with the proxy manager's proxy list.
    proxy_clients: Vec<Client>,
    rate_limiter: Arc<RateLimiter>,
    distributed: Option<Arc<DistributedRateLimiter>>,
    circuit: CircuitBreaker,
    proxies: ProxyManager,
    browser: Option<Arc<dyn SessionFetcher>>,
    captcha: CaptchaDetector,
    metrics: MetricsRecorder,
}

impl Fetcher {
    /// Build a fetcher from validated configuration.
    pub fn new(config: FetcherConfig) -> FetchResult<Self> {
        config.validate()?;

        let direct_client = Self::client_builder(&config)
            .build()
            .map_err(|e| FetchError::Validation(format!("http client: {e}")))?;

        let mut proxy_clients = Vec::with_capacity(config.proxies.len());
        for proxy_url in &config.proxies {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| FetchError::Validation(format!("proxy {proxy_url}: {e}")))?;
            let client = Self::client_builder(&config)
                .proxy(proxy)
                .build()
                .map_err(|e| FetchError::Validation(format!("proxy client: {e}")))?;
            proxy_clients.push(client);
        }

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let distributed = config.distributed.clone().map(|dist| {
            // The fallback gets its own limiter. Sharing `rate_limiter` would
            // charge each request twice during a Redis outage, halving the
            // effective ceiling.
            Arc::new(DistributedRateLimiter::new(
                dist,
                config.rate_limit.clone(),
                Arc::new(RateLimiter::new(config.rate_limit.clone())),
            ))
        });

        let browser: Option<Arc<dyn SessionFetcher>> = if config.browser.enabled {
            Some(Arc::new(BrowserSessionPool::new(config.browser.clone())))
        } else {
            None
        };

        Ok(Self {
            circuit: CircuitBreaker::new(config.circuit.clone()),
            proxies: ProxyManager::new(config.proxies.clone(), config.proxy.clone()),
            rate_limiter,
            distributed,
            browser,
            captcha: CaptchaDetector::new(),
            metrics: MetricsRecorder::new(),
            direct_client,
            proxy_clients,
            config,
        })
    }

    /// Replace the browser fallback with a custom session fetcher.
    pub fn with_session_fetcher(mut self, fetcher: Arc<dyn SessionFetcher>) -> Self {
        self.browser = Some(fetcher);
        self
    }

    fn client_builder(config: &FetcherConfig) -> reqwest::ClientBuilder {
        Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub fn proxy_manager(&self) -> &ProxyManager {
        &self.proxies
    }

    pub fn distributed_limiter(&self) -> Option<&Arc<DistributedRateLimiter>> {
        self.distributed.as_ref()
    }

    /// Fetch one URL through the full resilience pipeline.
    ///
    /// Returns `Ok(None)` on 429 backpressure (expected signal, not an
    /// error). Every surfaced error is recorded to metrics.
    pub async fn fetch(&self, request: FetchRequest) -> FetchResult<Option<FetchResponse>> {
        let domain = RateLimiter::extract_domain(&request.url).ok_or_else(|| {
            FetchError::Validation(format!("url has no host: {}", request.url))
        })?;

        let result = match tokio::time::timeout(
            self.config.total_timeout(),
            self.fetch_inner(&domain, &request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::network(
                &request.url,
                format!("fetch timed out after {:?}", self.config.total_timeout()),
            )),
        };

        if let Err(err) = &result {
            self.metrics.record_error(&domain, err.kind_label()).await;
        }
        result
    }

    async fn fetch_inner(
        &self,
        domain: &str,
        request: &FetchRequest,
    ) -> FetchResult<Option<FetchResponse>> {
        // Gate 1: circuit breaker, before any network work.
        if !self.circuit.can_execute(domain).await {
            debug!("Circuit open, rejecting fetch for {}", domain);
            return Err(FetchError::CircuitOpen {
                domain: domain.to_string(),
            });
        }

        // Gate 2: local window.
        self.rate_limiter.try_acquire(domain).await?;
        let remaining = self.rate_limiter.remaining(domain).await;
        self.metrics
            .record_rate_limit_remaining(domain, remaining)
            .await;

        // Gate 3: shared window, when configured.
        if let Some(distributed) = &self.distributed {
            let outcome = distributed
                .acquire_batch(domain, 1, request.endpoint_class.as_deref())
                .await?;
            if outcome.admitted == 0 {
                let limit = self.rate_limiter.current_limit(domain).await.max(1);
                return Err(FetchError::RateLimitExceeded {
                    domain: domain.to_string(),
                    retry_after: WINDOW / limit,
                });
            }
        }

        let attempt = with_retry(&self.config.retry, domain, &self.metrics, |_| {
            self.attempt_http(domain, request)
        })
        .await;

        match attempt {
            Err(err @ FetchError::Network { .. }) => {
                self.browser_fallback(domain, request, err).await
            }
            other => other,
        }
    }

    /// One plain-HTTP attempt: proxy selection, fingerprinted request,
    /// tracker feedback.
    async fn attempt_http(
        &self,
        domain: &str,
        request: &FetchRequest,
    ) -> FetchResult<Option<FetchResponse>> {
        let proxy = self.proxies.select_best(domain).await?;
        let client = proxy
            .as_ref()
            .map(|p| &self.proxy_clients[p.id])
            .unwrap_or(&self.direct_client);

        let method: Method = request
            .method
            .parse()
            .map_err(|_| FetchError::Validation(format!("bad method: {}", request.method)))?;

        let mut builder = Fingerprint::random().apply(client.request(method, &request.url));
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let start = Instant::now();
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                if let Some(proxy) = &proxy {
                    let score = self.proxies.report_failure(domain, proxy, None).await;
                    self.metrics
                        .record_proxy_score(domain, &proxy.url, score)
                        .await;
                }
                let transition = self
                    .circuit
                    .record_failure(domain, &format!("network {domain}"))
                    .await;
                if let Some(state) = transition {
                    self.metrics
                        .record_circuit_transition(domain, state.label())
                        .await;
                }
                return Err(FetchError::network(&request.url, e));
            }
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();

        match status {
            200..=299 => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| FetchError::network(&request.url, e))?;
                let elapsed = start.elapsed();

                if let Some(proxy) = &proxy {
                    let score = self.proxies.report_success(domain, proxy).await;
                    self.metrics
                        .record_proxy_score(domain, &proxy.url, score)
                        .await;
                }
                if let Some(state) = self.circuit.record_success(domain).await {
                    self.metrics
                        .record_circuit_transition(domain, state.label())
                        .await;
                }
                self.rate_limiter.record_success(domain).await;
                self.metrics
                    .record_success(domain, elapsed, body.len())
                    .await;

                Ok(Some(FetchResponse {
                    status,
                    body: body.to_vec(),
                    final_url,
                    from_browser: false,
                }))
            }
            429 => {
                // Expected backpressure: feedback for the rate limiter only,
                // never a breaker failure.
                self.rate_limiter.record_error(domain, 429).await;
                self.metrics.record_error(domain, "rate_limited").await;
                let remaining = self.rate_limiter.remaining(domain).await;
                self.metrics
                    .record_rate_limit_remaining(domain, remaining)
                    .await;
                debug!("429 from {}, backing off", domain);
                Ok(None)
            }
            500..=599 => {
                self.rate_limiter.record_error(domain, status).await;
                if let Some(proxy) = &proxy {
                    let score = self
                        .proxies
                        .report_failure(domain, proxy, Some(status))
                        .await;
                    self.metrics
                        .record_proxy_score(domain, &proxy.url, score)
                        .await;
                }
                let transition = self
                    .circuit
                    .record_failure(domain, &format!("http_{status} {domain}"))
                    .await;
                if let Some(state) = transition {
                    self.metrics
                        .record_circuit_transition(domain, state.label())
                        .await;
                }
                self.metrics.record_error(domain, "server_error").await;

                let body = response.bytes().await.unwrap_or_default();
                Ok(Some(FetchResponse {
                    status,
                    body: body.to_vec(),
                    final_url,
                    from_browser: false,
                }))
            }
            _ => {
                // Other 4xx: the caller's problem, but it still counts
                // toward the limiter's error accumulation.
                self.rate_limiter.record_error(domain, status).await;
                self.metrics.record_error(domain, "client_error").await;

                let body = response.bytes().await.unwrap_or_default();
                Ok(Some(FetchResponse {
                    status,
                    body: body.to_vec(),
                    final_url,
                    from_browser: false,
                }))
            }
        }
    }

    /// Browser fallback after exhausted retries. CAPTCHA-classified content
    /// becomes a typed error; success returns the rendered page.
    async fn browser_fallback(
        &self,
        domain: &str,
        request: &FetchRequest,
        network_err: FetchError,
    ) -> FetchResult<Option<FetchResponse>> {
        let Some(browser) = &self.browser else {
            return Err(network_err);
        };

        warn!(
            "Direct fetch failed for {}, falling back to browser: {}",
            domain, network_err
        );
        self.metrics.record_browser_fallback(domain).await;

        let start = Instant::now();
        let rendered = browser.fetch(domain, &request.url).await?;

        if let Some(challenge) = self.captcha.detect(&rendered.content) {
            self.metrics.record_captcha(domain).await;
            if let Some(state) = self.circuit.record_failure(domain, "captcha").await {
                self.metrics
                    .record_circuit_transition(domain, state.label())
                    .await;
            }
            return Err(FetchError::Captcha {
                url: request.url.clone(),
                kind: challenge.kind,
            });
        }

        if let Some(state) = self.circuit.record_success(domain).await {
            self.metrics
                .record_circuit_transition(domain, state.label())
                .await;
        }
        self.metrics
            .record_success(domain, start.elapsed(), rendered.content.len())
            .await;

        Ok(Some(FetchResponse {
            status: rendered.status,
            body: rendered.content.into_bytes(),
            final_url: rendered.final_url,
            from_browser: true,
        }))
    }

    /// Fetch successive pages, following either a CSS next-link or a JSON
    /// continuation token. Both the page-count ceiling and the
    /// time-since-last-success ceiling end the loop without error; partial
    /// results are returned.
    pub async fn fetch_paginated(&self, request: PageRequest) -> FetchResult<Vec<FetchResponse>> {
        let mut pages = Vec::new();
        let mut current_url = request.url.clone();
        let mut last_success = Instant::now();
        let stall = std::time::Duration::from_secs(request.stall_timeout_secs);

        while (pages.len() as u32) < request.max_pages {
            if last_success.elapsed() > stall {
                debug!("Pagination stalled for {:?}, stopping", stall);
                break;
            }

            let mut page_request = FetchRequest::get(&current_url);
            page_request.endpoint_class = request.endpoint_class.clone();

            match self.fetch(page_request).await {
                Ok(Some(response)) if response.status < 400 => {
                    last_success = Instant::now();
                    let next = match next_page_url(&current_url, &response, &request.next) {
                        Ok(next) => next,
                        // A malformed next link ends the walk; pages already
                        // collected are still worth returning.
                        Err(e) if !pages.is_empty() => {
                            warn!(url = %current_url, error = %e, "next page link unresolvable, stopping");
                            pages.push(response);
                            break;
                        }
                        Err(e) => return Err(e),
                    };
                    pages.push(response);
                    match next {
                        Some(url) => current_url = url,
                        None => break,
                    }
                }
                Ok(_) => break, // backpressure or an error page: stop here
                Err(err) if pages.is_empty() => return Err(err),
                Err(err) => {
                    warn!("Pagination stopped after {} pages: {}", pages.len(), err);
                    break;
                }
            }
        }

        Ok(pages)
    }

    /// Close browser sessions and drop stale per-domain state.
    pub async fn shutdown(&self) {
        if let Some(browser) = &self.browser {
            browser.close_all().await;
        }
        self.rate_limiter.evict_stale().await;
        self.circuit.evict_stale().await;
        self.proxies.evict_stale().await;
    }
}

/// Resolve the next page URL from a response, if any.
/// Kept synchronous so the parsed DOM never crosses an await point.
fn next_page_url(
    current_url: &str,
    response: &FetchResponse,
    next: &NextPage,
) -> FetchResult<Option<String>> {
    match next {
        NextPage::Selector(css) => {
            let selector = Selector::parse(css)
                .map_err(|e| FetchError::Validation(format!("bad selector {css}: {e}")))?;
            let document = Html::parse_document(&response.text());
            let href = document
                .select(&selector)
                .next()
                .and_then(|el| el.value().attr("href"))
                .map(|s| s.to_string());

            match href {
                Some(href) => {
                    let base = Url::parse(current_url)
                        .map_err(|e| FetchError::Validation(format!("bad url: {e}")))?;
                    let resolved = base
                        .join(&href)
                        .map_err(|e| FetchError::Validation(format!("bad next link: {e}")))?;
                    Ok(Some(resolved.to_string()))
                }
                None => Ok(None),
            }
        }
        NextPage::Token { field, param } => {
            let value: serde_json::Value = match serde_json::from_slice(&response.body) {
                Ok(value) => value,
                Err(_) => return Ok(None),
            };
            // Dotted paths address nested fields.
            let mut cursor = &value;
            for key in field.split('.') {
                match cursor.get(key) {
                    Some(inner) => cursor = inner,
                    None => return Ok(None),
                }
            }
            let token = match cursor.as_str() {
                Some(token) if !token.is_empty() => token.to_string(),
                _ => return Ok(None),
            };

            let mut url = Url::parse(current_url)
                .map_err(|e| FetchError::Validation(format!("bad url: {e}")))?;
            let others: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(name, _)| name != param.as_str())
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect();
            url.query_pairs_mut()
                .clear()
                .extend_pairs(others.iter().map(|(n, v)| (n.as_str(), v.as_str())))
                .append_pair(param, &token);
            Ok(Some(url.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(body: &str) -> FetchResponse {
        FetchResponse {
            status: 200,
            body: body.as_bytes().to_vec(),
            final_url: "https://example.com/listings".to_string(),
            from_browser: false,
        }
    }

    #[test]
    fn test_next_page_from_selector() {
        let response = page(r#"<html><body><a class="next" href="/listings?page=2">Next</a></body></html>"#);
        let next = next_page_url(
            "https://example.com/listings",
            &response,
            &NextPage::Selector("a.next".to_string()),
        )
        .unwrap();
        assert_eq!(next.as_deref(), Some("https://example.com/listings?page=2"));
    }

    #[test]
    fn test_selector_without_match_ends_pagination() {
        let response = page("<html><body><p>done</p></body></html>");
        let next = next_page_url(
            "https://example.com/listings",
            &response,
            &NextPage::Selector("a.next".to_string()),
        )
        .unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn test_next_page_from_token() {
        let response = page(r#"{"items": [], "paging": {"cursor": "abc123"}}"#);
        let next = next_page_url(
            "https://api.example.com/v1/listings?limit=50",
            &response,
            &NextPage::Token {
                field: "paging.cursor".to_string(),
                param: "cursor".to_string(),
            },
        )
        .unwrap()
        .unwrap();

        let url = Url::parse(&next).unwrap();
        let pairs: Vec<_> = url.query_pairs().collect();
        assert!(pairs.iter().any(|(n, v)| n == "limit" && v == "50"));
        assert!(pairs.iter().any(|(n, v)| n == "cursor" && v == "abc123"));
    }

    #[test]
    fn test_token_replaces_previous_cursor() {
        let response = page(r#"{"next_token": "page3"}"#);
        let next = next_page_url(
            "https://api.example.com/v1/listings?cursor=page2",
            &response,
            &NextPage::Token {
                field: "next_token".to_string(),
                param: "cursor".to_string(),
            },
        )
        .unwrap()
        .unwrap();

        let url = Url::parse(&next).unwrap();
        let cursors: Vec<_> = url
            .query_pairs()
            .filter(|(n, _)| n == "cursor")
            .map(|(_, v)| v.into_owned())
            .collect();
        assert_eq!(cursors, vec!["page3"]);
    }

    #[test]
    fn test_missing_token_ends_pagination() {
        let response = page(r#"{"items": []}"#);
        let next = next_page_url(
            "https://api.example.com/v1/listings",
            &response,
            &NextPage::Token {
                field: "next_token".to_string(),
                param: "cursor".to_string(),
            },
        )
        .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_url_without_host_is_rejected() {
        let fetcher = Fetcher::new(FetcherConfig::default()).unwrap();
        let err = fetcher
            .fetch(FetchRequest::get("not-a-url"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Validation(_)));
    }
}
