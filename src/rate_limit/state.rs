//! Per-domain sliding-window rate state.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// One-minute admission window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window state for a single domain.
///
/// The adjustment policy is deliberately asymmetric: fast decrease on
/// rate-limit feedback, slow recovery on sustained success.
#[derive(Debug)]
pub struct DomainRateState {
    /// Current admission limit per window.
    pub requests_per_minute: u32,
    /// Hard cap on timestamps retained.
    pub burst_limit: u32,
    /// Admitted request times, oldest first.
    pub recent_requests: VecDeque<Instant>,
    /// Accumulated non-429 errors since the last adjustment.
    pub error_count: u32,
    /// Last limit change; `None` until the first adjustment.
    pub last_adjustment: Option<Instant>,
    pub total_admitted: u64,
    pub total_rejected: u64,
}

impl DomainRateState {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            requests_per_minute: config.requests_per_minute,
            burst_limit: config.burst_limit,
            recent_requests: VecDeque::new(),
            error_count: 0,
            last_adjustment: None,
            total_admitted: 0,
            total_rejected: 0,
        }
    }

    /// Drop timestamps that have left the window.
    pub fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.recent_requests.front() {
            if now.duration_since(oldest) >= WINDOW {
                self.recent_requests.pop_front();
            } else {
                break;
            }
        }
    }

    /// Try to admit one request. On rejection returns the wait until the
    /// oldest admitted timestamp leaves the window.
    pub fn try_admit(&mut self, now: Instant) -> Result<(), Duration> {
        self.prune(now);
        let cap = self.requests_per_minute.min(self.burst_limit) as usize;
        if self.recent_requests.len() < cap {
            self.recent_requests.push_back(now);
            self.total_admitted += 1;
            Ok(())
        } else {
            self.total_rejected += 1;
            let retry_after = self
                .recent_requests
                .front()
                .map(|&oldest| WINDOW.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(WINDOW);
            Err(retry_after)
        }
    }

    /// Admissions left in the current window.
    pub fn remaining(&mut self, now: Instant) -> u32 {
        self.prune(now);
        let cap = self.requests_per_minute.min(self.burst_limit) as usize;
        cap.saturating_sub(self.recent_requests.len()) as u32
    }

    fn adjustment_elapsed(&self, now: Instant) -> Option<Duration> {
        self.last_adjustment.map(|t| now.duration_since(t))
    }

    /// Halve the limit if the decrease cooldown has elapsed (or no adjustment
    /// has happened yet). Returns the new limit when a change was made.
    pub fn maybe_decrease(&mut self, now: Instant, config: &RateLimitConfig) -> Option<u32> {
        if let Some(elapsed) = self.adjustment_elapsed(now) {
            if elapsed < config.decrease_cooldown() {
                return None;
            }
        }
        self.requests_per_minute = (self.requests_per_minute / 2).max(1);
        self.error_count = 0;
        self.last_adjustment = Some(now);
        Some(self.requests_per_minute)
    }

    /// Raise the limit by 20% if the increase cooldown has elapsed. Returns
    /// the new limit when a change was made.
    pub fn maybe_increase(&mut self, now: Instant, config: &RateLimitConfig) -> Option<u32> {
        let eligible = match self.adjustment_elapsed(now) {
            Some(elapsed) => elapsed >= config.increase_cooldown(),
            // A fresh domain with no adjustments has nothing to recover from.
            None => false,
        };
        if !eligible || self.requests_per_minute >= config.max_requests_per_minute {
            return None;
        }
        let raised = (self.requests_per_minute as f64 * 1.2).ceil() as u32;
        self.requests_per_minute = raised.min(config.max_requests_per_minute);
        self.error_count = 0;
        self.last_adjustment = Some(now);
        Some(self.requests_per_minute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RateLimitConfig {
        RateLimitConfig::default()
    }

    #[test]
    fn test_window_ceiling() {
        let cfg = RateLimitConfig {
            requests_per_minute: 3,
            ..config()
        };
        let mut state = DomainRateState::new(&cfg);
        let now = Instant::now();

        for _ in 0..3 {
            assert!(state.try_admit(now).is_ok());
        }
        let retry_after = state.try_admit(now).unwrap_err();
        assert!(retry_after <= WINDOW);
        assert_eq!(state.recent_requests.len(), 3);
    }

    #[test]
    fn test_burst_limit_bounds_window() {
        let cfg = RateLimitConfig {
            requests_per_minute: 10,
            burst_limit: 4,
            ..config()
        };
        let mut state = DomainRateState::new(&cfg);
        let now = Instant::now();

        for _ in 0..4 {
            assert!(state.try_admit(now).is_ok());
        }
        assert!(state.try_admit(now).is_err());
    }

    #[test]
    fn test_decrease_floors_at_one() {
        let cfg = config();
        let mut state = DomainRateState::new(&cfg);
        state.requests_per_minute = 1;
        let now = Instant::now();
        assert_eq!(state.maybe_decrease(now, &cfg), Some(1));
    }

    #[test]
    fn test_decrease_respects_cooldown() {
        let cfg = config();
        let mut state = DomainRateState::new(&cfg);
        let now = Instant::now();

        assert_eq!(state.maybe_decrease(now, &cfg), Some(5));
        // Second trigger inside the cooldown is a no-op.
        assert_eq!(state.maybe_decrease(now, &cfg), None);
        assert_eq!(state.requests_per_minute, 5);
    }

    #[test]
    fn test_increase_caps_at_max() {
        let cfg = config();
        let mut state = DomainRateState::new(&cfg);
        state.requests_per_minute = 29;
        state.last_adjustment = Some(Instant::now() - cfg.increase_cooldown());
        assert_eq!(state.maybe_increase(Instant::now(), &cfg), Some(30));

        state.last_adjustment = Some(Instant::now() - cfg.increase_cooldown());
        assert_eq!(state.maybe_increase(Instant::now(), &cfg), None);
    }

    #[test]
    fn test_fresh_domain_does_not_increase() {
        let cfg = config();
        let mut state = DomainRateState::new(&cfg);
        assert_eq!(state.maybe_increase(Instant::now(), &cfg), None);
    }
}
