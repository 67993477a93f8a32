//! Per-key admission control: fixed windows plus a token bucket.
//!
//! Every key is checked against three budgets at once: a per-minute window, a
//! per-hour window, and a continuously refilled token bucket that shapes
//! bursts. A request is admitted only when all three agree, and admission
//! consumes from all three atomically (per key).
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use scc::HashMap;
use serde::{Deserialize, Serialize};

/// Budget configuration applied to every key of one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Admissions allowed per calendar-aligned minute window
    pub requests_per_minute: u32,
    /// Admissions allowed per calendar-aligned hour window
    pub requests_per_hour: u32,
    /// Token bucket capacity; also the initial fill for new keys
    pub burst_size: u32,
}

#[derive(Debug)]
struct KeyState {
    minute_bucket: u64,
    minute_count: u32,
    hour_bucket: u64,
    hour_count: u32,
    tokens: f64,
    last_refill: f64,
    last_seen: Instant,
}

impl KeyState {
    fn fresh(now: f64, policy: &RateLimitPolicy) -> Self {
        Self {
            minute_bucket: (now as u64) / 60,
            minute_count: 0,
            hour_bucket: (now as u64) / 3600,
            hour_count: 0,
            tokens: policy.burst_size as f64,
            last_refill: now,
            last_seen: Instant::now(),
        }
    }
}

/// Keyed rate limiter. One instance guards one route; keys are typically
/// `client_ip:route_id`.
pub struct RateLimiter {
    keys: HashMap<String, KeyState>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            keys: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Admit or reject one request for `key` at the current wall-clock time.
    pub fn allow(&self, key: &str) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.allow_at(key, now)
    }

    /// Admit or reject at an explicit Unix timestamp (seconds).
    ///
    /// Window rollovers, token refill, the three budget checks and the
    /// consumption on admission all happen under the key's entry lock.
    pub fn allow_at(&self, key: &str, now: f64) -> bool {
        let mut entry = self
            .keys
            .entry_sync(key.to_string())
            .or_insert_with(|| KeyState::fresh(now, &self.policy));
        let state = entry.get_mut();
        state.last_seen = Instant::now();

        let minute_bucket = (now as u64) / 60;
        if minute_bucket != state.minute_bucket {
            state.minute_bucket = minute_bucket;
            state.minute_count = 0;
        }
        let hour_bucket = (now as u64) / 3600;
        if hour_bucket != state.hour_bucket {
            state.hour_bucket = hour_bucket;
            state.hour_count = 0;
        }

        let elapsed = (now - state.last_refill).max(0.0);
        let refill_rate = f64::from(self.policy.requests_per_minute) / 60.0;
        state.tokens =
            (state.tokens + elapsed * refill_rate).min(f64::from(self.policy.burst_size));
        state.last_refill = now;

        if state.minute_count >= self.policy.requests_per_minute
            || state.hour_count >= self.policy.requests_per_hour
            || state.tokens < 1.0
        {
            return false;
        }

        state.tokens -= 1.0;
        state.minute_count += 1;
        state.hour_count += 1;
        true
    }

    /// Drop key state idle for longer than `max_idle`.
    ///
    /// An evicted key that returns starts over with a full burst, which is the
    /// accepted cost of bounding memory.
    pub fn evict_idle(&self, max_idle: std::time::Duration) {
        let before = self.keys.len();
        self.keys
            .retain_sync(|_, state| state.last_seen.elapsed() <= max_idle);
        let evicted = before.saturating_sub(self.keys.len());
        if evicted > 0 {
            tracing::debug!("Evicted {} idle rate-limit keys", evicted);
        }
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(rpm: u32, rph: u32, burst: u32) -> RateLimitPolicy {
        RateLimitPolicy {
            requests_per_minute: rpm,
            requests_per_hour: rph,
            burst_size: burst,
        }
    }

    // Bucket-aligned base avoids a window rollover mid-test.
    const BASE: f64 = 7200.0;

    #[test]
    fn test_burst_then_refill() {
        let limiter = RateLimiter::new(policy(60, 10_000, 10));

        for _ in 0..10 {
            assert!(limiter.allow_at("client", BASE));
        }
        assert!(!limiter.allow_at("client", BASE));

        // One token per second at 60 rpm.
        assert!(limiter.allow_at("client", BASE + 1.0));
        assert!(!limiter.allow_at("client", BASE + 1.0));
    }

    #[test]
    fn test_minute_window_caps_sustained_rate() {
        let limiter = RateLimiter::new(policy(5, 10_000, 100));

        for i in 0..5 {
            assert!(limiter.allow_at("client", BASE + f64::from(i)));
        }
        // Tokens remain but the minute window is exhausted.
        assert!(!limiter.allow_at("client", BASE + 10.0));

        // The next minute admits again.
        assert!(limiter.allow_at("client", BASE + 60.0));
    }

    #[test]
    fn test_hour_window_outlasts_minute_resets() {
        let limiter = RateLimiter::new(policy(1000, 3, 1000));

        assert!(limiter.allow_at("client", BASE));
        assert!(limiter.allow_at("client", BASE + 60.0));
        assert!(limiter.allow_at("client", BASE + 120.0));
        assert!(!limiter.allow_at("client", BASE + 180.0));

        // A new hour clears the hourly count.
        assert!(limiter.allow_at("client", BASE + 3600.0));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(policy(60, 10_000, 1));

        assert!(limiter.allow_at("alice", BASE));
        assert!(!limiter.allow_at("alice", BASE));
        assert!(limiter.allow_at("bob", BASE));
    }

    #[test]
    fn test_tokens_cap_at_burst_size() {
        let limiter = RateLimiter::new(policy(60, 10_000, 3));

        assert!(limiter.allow_at("client", BASE));
        // A long idle period refills to the cap, not beyond.
        for _ in 0..3 {
            assert!(limiter.allow_at("client", BASE + 600.0));
        }
        assert!(!limiter.allow_at("client", BASE + 600.0));
    }

    #[test]
    fn test_evict_idle_resets_returning_keys() {
        let limiter = RateLimiter::new(policy(60, 10_000, 1));

        assert!(limiter.allow_at("client", BASE));
        assert!(!limiter.allow_at("client", BASE));
        assert_eq!(limiter.tracked_keys(), 1);

        limiter.evict_idle(std::time::Duration::from_secs(0));
        assert_eq!(limiter.tracked_keys(), 0);

        // Fresh key state means a full burst again.
        assert!(limiter.allow_at("client", BASE));
    }
}
