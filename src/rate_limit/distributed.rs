//! Redis-backed rate limiter shared across process instances.
//!
//! Redis is the authoritative copy of each domain's window; admission runs
//! as an atomic Lua script so concurrent processes cannot jointly exceed the
//! limit. Each process keeps a locally tuned batch size and fails over
//! between configured Redis endpoints. When Redis is unreachable the limiter
//! can delegate to the in-process limiter, which enforces the same numeric
//! ceiling; it never silently admits unlimited traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{DistributedRateLimitConfig, RateLimitConfig};
use crate::error::{FetchError, FetchResult};

use super::RateLimiter;

/// TTL for window keys (auto-cleanup of stale domains).
const WINDOW_TTL_SECS: i64 = 300;
/// TTL for snapshot keys.
const SNAPSHOT_TTL_SECS: i64 = 86400;
/// Rolling window length for batch tuning.
const TUNE_WINDOW: usize = 10;
/// Per-attempt bound on establishing a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Per-command response bound once connected.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Hard ceiling on one connection-establishment call, internal retries
/// included. A dead endpoint must fail within this bound so rotation and
/// the local fallback can engage.
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

/// Result of one batch acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Items admitted now.
    pub admitted: u32,
    /// Headroom left in the domain's window after this batch.
    pub remaining: u32,
}

/// Aggregate counters for observability.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DistributedStats {
    pub successful_batches: u64,
    pub partial_batches: u64,
    pub failed_batches: u64,
    pub redis_failures: u64,
    pub fallback_batches: u64,
}

/// Serialized window metadata shared via Redis (last-write-wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub requests_per_minute: u32,
    pub burst_limit: u32,
    /// Request timestamps keyed by domain.
    pub request_times: HashMap<String, Vec<DateTime<Utc>>>,
}

/// Adaptive batch sizing over a rolling window of success ratios.
#[derive(Debug)]
struct BatchTuner {
    batch_size: u32,
    max_batch_size: u32,
    recent_ratios: VecDeque<f64>,
}

impl BatchTuner {
    fn new(initial: u32, max: u32) -> Self {
        Self {
            batch_size: initial.max(1),
            max_batch_size: max,
            recent_ratios: VecDeque::with_capacity(TUNE_WINDOW),
        }
    }

    /// Record one batch's success ratio and retune.
    fn record(&mut self, ratio: f64) {
        if self.recent_ratios.len() == TUNE_WINDOW {
            self.recent_ratios.pop_front();
        }
        self.recent_ratios.push_back(ratio.clamp(0.0, 1.0));

        let avg =
            self.recent_ratios.iter().sum::<f64>() / self.recent_ratios.len() as f64;
        if avg > 0.9 {
            self.batch_size = (self.batch_size * 2).min(self.max_batch_size);
        } else if avg < 0.5 {
            self.batch_size = (self.batch_size / 2).max(1);
        }
    }
}

/// Redis-distributed rate limiter with endpoint failover and local fallback.
pub struct DistributedRateLimiter {
    config: DistributedRateLimitConfig,
    rate_config: RateLimitConfig,
    fallback: Arc<RateLimiter>,
    conn: Mutex<Option<ConnectionManager>>,
    endpoint_index: AtomicUsize,
    tuner: Mutex<BatchTuner>,
    stats: Mutex<DistributedStats>,
}

impl DistributedRateLimiter {
    /// `fallback` must share the numeric limits in `rate_config` so local
    /// degradation keeps the same ceiling.
    pub fn new(
        config: DistributedRateLimitConfig,
        rate_config: RateLimitConfig,
        fallback: Arc<RateLimiter>,
    ) -> Self {
        let tuner = BatchTuner::new(config.initial_batch_size, config.max_batch_size);
        Self {
            config,
            rate_config,
            fallback,
            conn: Mutex::new(None),
            endpoint_index: AtomicUsize::new(0),
            tuner: Mutex::new(tuner),
            stats: Mutex::new(DistributedStats::default()),
        }
    }

    fn window_key(&self, domain: &str) -> String {
        format!("{}:window:{}", self.config.key_prefix, domain)
    }

    fn snapshot_key(&self, domain: &str) -> String {
        format!("{}:{}", self.config.key_prefix, domain)
    }

    /// Effective per-window limit for a domain, optionally scaled down by an
    /// endpoint-class cap.
    fn effective_limit(&self, endpoint_class: Option<&str>) -> u32 {
        let base = self.rate_config.requests_per_minute;
        match endpoint_class.and_then(|c| self.config.endpoint_limits.get(c)) {
            Some(&cap) => base.min(cap),
            None => base,
        }
    }

    fn current_endpoint(&self) -> &str {
        let idx = self.endpoint_index.load(Ordering::Relaxed);
        &self.config.endpoints[idx % self.config.endpoints.len()]
    }

    /// Round-robin to the next configured endpoint and drop the connection.
    async fn rotate_endpoint(&self) {
        self.endpoint_index.fetch_add(1, Ordering::Relaxed);
        *self.conn.lock().await = None;
        warn!(
            "Rotating to Redis endpoint {}",
            self.current_endpoint()
        );
    }

    async fn connection(&self) -> FetchResult<ConnectionManager> {
        if let Some(conn) = self.conn.lock().await.as_ref() {
            return Ok(conn.clone());
        }
        // Connect with the guard released; other domains' acquisitions must
        // not queue behind a slow endpoint.
        let endpoint = self.current_endpoint().to_string();
        let conn = Self::connect(&endpoint).await?;
        *self.conn.lock().await = Some(conn.clone());
        Ok(conn)
    }

    async fn connect(endpoint: &str) -> FetchResult<ConnectionManager> {
        let client = redis::Client::open(endpoint)
            .map_err(|e| FetchError::Redis(format!("{endpoint}: {e}")))?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(CONNECT_TIMEOUT)
            .set_response_timeout(RESPONSE_TIMEOUT)
            .set_number_of_retries(1);
        match tokio::time::timeout(
            CONNECT_DEADLINE,
            ConnectionManager::new_with_config(client, manager_config),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(FetchError::Redis(format!("{endpoint}: {e}"))),
            Err(_) => Err(FetchError::Redis(format!(
                "{endpoint}: connect timed out after {CONNECT_DEADLINE:?}"
            ))),
        }
    }

    /// Atomic admission: prune the window, grant up to `requested` within
    /// the limit. Returns (granted, remaining headroom).
    async fn redis_acquire(
        &self,
        domain: &str,
        requested: u32,
        limit: u32,
    ) -> FetchResult<(u32, u32)> {
        let mut conn = self.connection().await?;

        let script = Script::new(
            r#"
            local key = KEYS[1]
            local now_ms = tonumber(ARGV[1])
            local window_ms = tonumber(ARGV[2])
            local limit = tonumber(ARGV[3])
            local requested = tonumber(ARGV[4])
            local ttl = tonumber(ARGV[5])

            redis.call('ZREMRANGEBYSCORE', key, 0, now_ms - window_ms)
            local count = redis.call('ZCARD', key)

            local headroom = limit - count
            if headroom < 0 then headroom = 0 end
            local grant = requested
            if grant > headroom then grant = headroom end

            for i = 1, grant do
                redis.call('ZADD', key, now_ms, now_ms .. '-' .. i .. '-' .. math.random(1000000))
            end
            redis.call('EXPIRE', key, ttl)

            return {grant, headroom - grant}
        "#,
        );

        let now_ms = Utc::now().timestamp_millis();
        let result: Vec<i64> = script
            .key(self.window_key(domain))
            .arg(now_ms)
            .arg(super::WINDOW.as_millis() as i64)
            .arg(limit as i64)
            .arg(requested as i64)
            .arg(WINDOW_TTL_SECS)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| FetchError::Redis(e.to_string()))?;

        let granted = result.first().copied().unwrap_or(0).max(0) as u32;
        let remaining = result.get(1).copied().unwrap_or(0).max(0) as u32;
        Ok((granted, remaining))
    }

    /// Acquire up to `items` admissions for a domain.
    ///
    /// Admits at most the current batch size per call; the caller retries
    /// with the returned remainder. On Redis failure the call retries,
    /// rotates endpoints, and finally either degrades to the local limiter
    /// or propagates a [`FetchError::Redis`].
    pub async fn acquire_batch(
        &self,
        domain: &str,
        items: u32,
        endpoint_class: Option<&str>,
    ) -> FetchResult<BatchOutcome> {
        if items == 0 {
            return Ok(BatchOutcome {
                admitted: 0,
                remaining: 0,
            });
        }

        let batch_size = self.tuner.lock().await.batch_size;
        let requested = items.min(batch_size);
        let limit = self.effective_limit(endpoint_class);

        let mut last_err = None;
        for attempt in 0..self.config.redis_retries.max(1) {
            match self.redis_acquire(domain, requested, limit).await {
                Ok((admitted, remaining)) => {
                    let ratio = admitted as f64 / requested as f64;
                    self.tuner.lock().await.record(ratio);

                    let mut stats = self.stats.lock().await;
                    if admitted == requested {
                        stats.successful_batches += 1;
                    } else if admitted > 0 {
                        stats.partial_batches += 1;
                    } else {
                        stats.failed_batches += 1;
                    }

                    debug!(
                        "Distributed batch for {}: {}/{} admitted, {} headroom",
                        domain, admitted, requested, remaining
                    );
                    return Ok(BatchOutcome { admitted, remaining });
                }
                Err(e) => {
                    self.stats.lock().await.redis_failures += 1;
                    warn!(
                        "Redis acquire failed for {} (attempt {}): {}",
                        domain,
                        attempt + 1,
                        e
                    );
                    self.rotate_endpoint().await;
                    last_err = Some(e);
                }
            }
        }

        if self.config.fallback_to_local {
            let admitted = self.fallback.try_acquire_many(domain, requested).await;
            let remaining = self.fallback.remaining(domain).await;
            let mut stats = self.stats.lock().await;
            stats.fallback_batches += 1;
            if admitted == requested {
                stats.successful_batches += 1;
            } else if admitted > 0 {
                stats.partial_batches += 1;
            } else {
                stats.failed_batches += 1;
            }
            warn!(
                "Redis unavailable, local fallback admitted {}/{} for {}",
                admitted, requested, domain
            );
            return Ok(BatchOutcome { admitted, remaining });
        }

        self.stats.lock().await.failed_batches += 1;
        Err(last_err.unwrap_or_else(|| FetchError::Redis("no redis endpoints".into())))
    }

    /// Persist a domain's window metadata for other processes to seed from.
    pub async fn save_snapshot(&self, domain: &str) -> FetchResult<()> {
        let mut conn = self.connection().await?;

        // Read back the authoritative window and serialize it.
        let cutoff = Utc::now().timestamp_millis() - super::WINDOW.as_millis() as i64;
        let members: Vec<(String, f64)> = conn
            .zrangebyscore_withscores(self.window_key(domain), cutoff as f64, "+inf")
            .await
            .map_err(|e| FetchError::Redis(e.to_string()))?;

        let times = members
            .iter()
            .filter_map(|(_, score)| DateTime::from_timestamp_millis(*score as i64))
            .collect();

        let snapshot = RateLimitSnapshot {
            requests_per_minute: self.rate_config.requests_per_minute,
            burst_limit: self.rate_config.burst_limit,
            request_times: HashMap::from([(domain.to_string(), times)]),
        };
        let payload = serde_json::to_string(&snapshot)
            .map_err(|e| FetchError::Redis(e.to_string()))?;

        redis::pipe()
            .set(self.snapshot_key(domain), payload)
            .expire(self.snapshot_key(domain), SNAPSHOT_TTL_SECS)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| FetchError::Redis(e.to_string()))?;
        Ok(())
    }

    /// Load another process's snapshot, if present.
    pub async fn load_snapshot(&self, domain: &str) -> FetchResult<Option<RateLimitSnapshot>> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn
            .get(self.snapshot_key(domain))
            .await
            .map_err(|e| FetchError::Redis(e.to_string()))?;
        match payload {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| FetchError::Redis(format!("corrupt snapshot: {e}"))),
            None => Ok(None),
        }
    }

    /// Current adaptive batch size.
    pub async fn batch_size(&self) -> u32 {
        self.tuner.lock().await.batch_size
    }

    /// Aggregate counters.
    pub async fn stats(&self) -> DistributedStats {
        self.stats.lock().await.clone()
    }
}
