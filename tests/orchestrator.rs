//! End-to-end orchestrator behavior against a local mock server.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use prospector::{
    BrowserFetchResponse, CaptchaKind, CircuitState, DistributedRateLimitConfig, FetchError,
    FetchRequest, FetchResult, Fetcher, FetcherConfig, NextPage, PageRequest, SessionFetcher,
};

fn test_config() -> FetcherConfig {
    let mut config = FetcherConfig::default();
    config.browser.enabled = false;
    config.retry.max_retries = 1;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.jitter_factor = 0.001;
    config
}

/// Scripted stand-in for the browser pool.
struct ScriptedSession {
    calls: AtomicU32,
    content: String,
}

impl ScriptedSession {
    fn new(content: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            content: content.to_string(),
        })
    }
}

#[async_trait]
impl SessionFetcher for ScriptedSession {
    async fn fetch(&self, _domain: &str, url: &str) -> FetchResult<BrowserFetchResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(BrowserFetchResponse {
            url: url.to_string(),
            final_url: url.to_string(),
            status: 200,
            content: self.content.clone(),
            content_type: "text/html".to_string(),
        })
    }

    async fn close_all(&self) {}
}

#[tokio::test]
async fn test_successful_fetch_records_metrics() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/listings"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(test_config()).unwrap();
    let response = fetcher
        .fetch(FetchRequest::get(format!("{}/listings", server.uri())))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "<html>ok</html>");
    assert!(!response.from_browser);

    let metrics = fetcher.metrics().domain("127.0.0.1").await.unwrap();
    assert_eq!(metrics.total_requests, 1);
    assert_eq!(metrics.successful_requests, 1);
    assert_eq!(metrics.failed_requests, 0);
    assert_eq!(
        fetcher.circuit_breaker().current_state("127.0.0.1").await,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_429_is_backpressure_not_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(test_config()).unwrap();
    let before = fetcher.rate_limiter().current_limit("127.0.0.1").await;

    let result = fetcher.fetch(FetchRequest::get(server.uri())).await.unwrap();
    assert!(result.is_none());

    // Limit halves once; the breaker never hears about it.
    let after = fetcher.rate_limiter().current_limit("127.0.0.1").await;
    assert_eq!(after, before / 2);
    assert_eq!(
        fetcher.circuit_breaker().current_state("127.0.0.1").await,
        CircuitState::Closed
    );

    // A second 429 inside the cooldown leaves the limit alone.
    let result = fetcher.fetch(FetchRequest::get(server.uri())).await.unwrap();
    assert!(result.is_none());
    assert_eq!(
        fetcher.rate_limiter().current_limit("127.0.0.1").await,
        after
    );

    let metrics = fetcher.metrics().domain("127.0.0.1").await.unwrap();
    assert_eq!(metrics.errors["rate_limited"], 2);
}

#[tokio::test]
async fn test_local_window_exhaustion_rejects() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.rate_limit.requests_per_minute = 2;
    config.rate_limit.burst_limit = 2;
    let fetcher = Fetcher::new(config).unwrap();

    for _ in 0..2 {
        assert!(fetcher
            .fetch(FetchRequest::get(server.uri()))
            .await
            .unwrap()
            .is_some());
    }

    let err = fetcher
        .fetch(FetchRequest::get(server.uri()))
        .await
        .unwrap_err();
    match err {
        FetchError::RateLimitExceeded { domain, retry_after } => {
            assert_eq!(domain, "127.0.0.1");
            assert!(retry_after.as_secs() <= 60);
        }
        other => panic!("expected rate limit error, got {other}"),
    }
}

#[tokio::test]
async fn test_server_errors_open_the_circuit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.circuit.failure_threshold = 3.0;
    let fetcher = Fetcher::new(config).unwrap();

    // Repeated identical failures gain weight: 1.0 + 1.25 + 1.5 crosses 3.0.
    for _ in 0..3 {
        let response = fetcher
            .fetch(FetchRequest::get(server.uri()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status, 500);
    }

    assert_eq!(
        fetcher.circuit_breaker().current_state("127.0.0.1").await,
        CircuitState::Open
    );
    let err = fetcher
        .fetch(FetchRequest::get(server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::CircuitOpen { .. }));

    let metrics = fetcher.metrics().domain("127.0.0.1").await.unwrap();
    assert_eq!(metrics.circuit_transitions["open"], 1);
}

#[tokio::test]
async fn test_browser_fallback_runs_once_after_retries() {
    // Nothing listens here; every attempt is a connect failure.
    let dead_url = "http://127.0.0.1:9/listings";

    let session = ScriptedSession::new("<html><body>rendered</body></html>");
    let fetcher = Fetcher::new(test_config())
        .unwrap()
        .with_session_fetcher(session.clone());

    let response = fetcher
        .fetch(FetchRequest::get(dead_url))
        .await
        .unwrap()
        .unwrap();

    assert!(response.from_browser);
    assert_eq!(response.text(), "<html><body>rendered</body></html>");
    // One fallback call regardless of how many HTTP attempts failed.
    assert_eq!(session.calls.load(Ordering::SeqCst), 1);

    let metrics = fetcher.metrics().domain("127.0.0.1").await.unwrap();
    assert_eq!(metrics.browser_fallbacks, 1);
    assert_eq!(metrics.retry_attempts, 1);
}

#[tokio::test]
async fn test_captcha_in_rendered_page_is_a_typed_error() {
    let dead_url = "http://127.0.0.1:9/listings";
    let session = ScriptedSession::new(
        r#"<html><body><div class="g-recaptcha" data-sitekey="k"></div></body></html>"#,
    );
    let fetcher = Fetcher::new(test_config())
        .unwrap()
        .with_session_fetcher(session.clone());

    let err = fetcher.fetch(FetchRequest::get(dead_url)).await.unwrap_err();
    match err {
        FetchError::Captcha { kind, .. } => assert_eq!(kind, CaptchaKind::Recaptcha),
        other => panic!("expected captcha error, got {other}"),
    }

    let metrics = fetcher.metrics().domain("127.0.0.1").await.unwrap();
    assert_eq!(metrics.captcha_challenges, 1);
}

#[tokio::test]
async fn test_no_fallback_without_a_session_fetcher() {
    let fetcher = Fetcher::new(test_config()).unwrap();
    let err = fetcher
        .fetch(FetchRequest::get("http://127.0.0.1:9/"))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Network { .. }));

    let metrics = fetcher.metrics().domain("127.0.0.1").await.unwrap();
    assert_eq!(metrics.browser_fallbacks, 0);
    assert_eq!(metrics.errors["retries_exhausted"], 1);
}

#[tokio::test]
async fn test_paginated_fetch_follows_next_links() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/listings"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body><a class="next" href="/listings2">more</a></body></html>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/listings2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>last</body></html>"))
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(test_config()).unwrap();
    let pages = fetcher
        .fetch_paginated(PageRequest {
            url: format!("{}/listings", server.uri()),
            next: NextPage::Selector("a.next".to_string()),
            max_pages: 10,
            stall_timeout_secs: 30,
            endpoint_class: None,
        })
        .await
        .unwrap();

    assert_eq!(pages.len(), 2);
    assert!(pages[1].text().contains("last"));
}

#[tokio::test]
async fn test_paginated_fetch_follows_json_tokens_and_stops_at_ceiling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .and(query_param("cursor", "c1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"items":[2],"next":"c2"}"#),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"items":[1],"next":"c1"}"#),
        )
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(test_config()).unwrap();
    let pages = fetcher
        .fetch_paginated(PageRequest {
            url: format!("{}/api/items", server.uri()),
            next: NextPage::Token {
                field: "next".to_string(),
                param: "cursor".to_string(),
            },
            max_pages: 2,
            stall_timeout_secs: 30,
            endpoint_class: None,
        })
        .await
        .unwrap();

    // The ceiling stops the walk even though every page offers a cursor.
    assert_eq!(pages.len(), 2);
    assert!(pages[0].text().contains("c1"));
    assert!(pages[1].text().contains("c2"));
}

#[tokio::test]
async fn test_redis_outage_keeps_full_local_ceiling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.rate_limit.requests_per_minute = 4;
    config.rate_limit.burst_limit = 4;
    config.distributed = Some(DistributedRateLimitConfig {
        endpoints: vec!["redis://127.0.0.1:1".to_string()],
        redis_retries: 1,
        fallback_to_local: true,
        ..Default::default()
    });
    let fetcher = Fetcher::new(config).unwrap();

    // With Redis down, all four slots of the window are still usable; the
    // fallback must not double-charge against the front-door limiter.
    tokio::time::timeout(Duration::from_secs(60), async {
        for _ in 0..4 {
            assert!(fetcher
                .fetch(FetchRequest::get(server.uri()))
                .await
                .unwrap()
                .is_some());
        }
        let err = fetcher
            .fetch(FetchRequest::get(server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RateLimitExceeded { .. }));
    })
    .await
    .expect("unreachable Redis must fail fast, not stall fetches");
}

#[tokio::test]
async fn test_cookies_persist_across_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "sid=abc123; Path=/")
                .set_body_string("<html>in</html>"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/account"))
        .and(header("cookie", "sid=abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>account</html>"))
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(test_config()).unwrap();
    fetcher
        .fetch(FetchRequest::get(format!("{}/login", server.uri())))
        .await
        .unwrap()
        .unwrap();

    // Without a cookie jar the second request misses the matcher and 404s.
    let response = fetcher
        .fetch(FetchRequest::get(format!("{}/account", server.uri())))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status, 200);
    assert!(response.text().contains("account"));
}

#[tokio::test]
async fn test_paginated_fetch_keeps_pages_when_next_link_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/listings"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body><a class="next" href="/listings2">more</a></body></html>"#,
        ))
        .mount(&server)
        .await;
    // "https://" joins to a URL with no host, which cannot be fetched.
    Mock::given(method("GET"))
        .and(path("/listings2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body><a class="next" href="https://">more</a></body></html>"#,
        ))
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(test_config()).unwrap();
    let pages = fetcher
        .fetch_paginated(PageRequest {
            url: format!("{}/listings", server.uri()),
            next: NextPage::Selector("a.next".to_string()),
            max_pages: 10,
            stall_timeout_secs: 30,
            endpoint_class: None,
        })
        .await
        .unwrap();

    // The walk ends at the bad link but keeps what it fetched.
    assert_eq!(pages.len(), 2);
}

#[tokio::test]
async fn test_paginated_fetch_returns_partial_pages_on_late_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/listings"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body><a class="next" href="/gone">more</a></body></html>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(test_config()).unwrap();
    let pages = fetcher
        .fetch_paginated(PageRequest {
            url: format!("{}/listings", server.uri()),
            next: NextPage::Selector("a.next".to_string()),
            max_pages: 10,
            stall_timeout_secs: 30,
            endpoint_class: None,
        })
        .await
        .unwrap();

    assert_eq!(pages.len(), 1);
}
