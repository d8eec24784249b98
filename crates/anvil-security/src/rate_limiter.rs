use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Named scopes a `RateLimiter` instance can be constructed for. Purely a
/// label used in logs and metrics; each scope gets its own limiter with
/// its own `(rate, window, burst)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    GlobalIp,
    FlagSubmit,
    InstanceStart,
    VpnConfigGenerate,
}

impl RateLimitScope {
    pub fn label(&self) -> &'static str {
        match self {
            Self::GlobalIp => "global_ip",
            Self::FlagSubmit => "flag_submit",
            Self::InstanceStart => "instance_start",
            Self::VpnConfigGenerate => "vpn_config_generate",
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Per-key token bucket. The bucket starts full (`burst` tokens) and
/// refills at `rate / window` tokens per second, capped at `burst`. Over
/// any `window`-second span a single key is allowed at most `burst +
/// rate` requests.
pub struct RateLimiter {
    scope: RateLimitScope,
    rate_per_window: f64,
    window_secs: f64,
    burst: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(scope: RateLimitScope, rate_per_window: u32, window_secs: u64, burst: u32) -> Self {
        Self {
            scope,
            rate_per_window: rate_per_window as f64,
            window_secs: window_secs as f64,
            burst: burst as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> RateLimitScope {
        self.scope
    }

    /// Refills `key`'s bucket for elapsed time, then consumes one token
    /// if available. Returns `true` when the request is allowed.
    pub fn allow(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed_secs = (now - bucket.last_refill).num_milliseconds() as f64 / 1000.0;
        if elapsed_secs > 0.0 {
            let refill = elapsed_secs * (self.rate_per_window / self.window_secs);
            bucket.tokens = (bucket.tokens + refill).min(self.burst);
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Evicts bucket entries whose last refill is older than
    /// `2 * window_secs`. Intended to run once a minute from a janitor loop.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let stale_after = self.window_secs * 2.0;
        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let age_secs = (now - bucket.last_refill).num_milliseconds() as f64 / 1000.0;
            age_secs <= stale_after
        });
        before - buckets.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_allows_immediate_requests_then_blocks() {
        let limiter = RateLimiter::new(RateLimitScope::GlobalIp, 60, 60, 5);
        for _ in 0..5 {
            assert!(limiter.allow("1.2.3.4"));
        }
        assert!(!limiter.allow("1.2.3.4"));
    }

    #[test]
    fn distinct_keys_have_independent_buckets() {
        let limiter = RateLimiter::new(RateLimitScope::FlagSubmit, 10, 60, 1);
        assert!(limiter.allow("user-a"));
        assert!(limiter.allow("user-b"));
        assert!(!limiter.allow("user-a"));
    }

    #[test]
    fn sweep_evicts_only_stale_entries() {
        let limiter = RateLimiter::new(RateLimitScope::InstanceStart, 10, 60, 2);
        limiter.allow("fresh");
        assert_eq!(limiter.tracked_keys(), 1);
        // Manually age the entry past 2x the window to simulate a long idle gap.
        {
            let mut buckets = limiter.buckets.lock().unwrap();
            let bucket = buckets.get_mut("fresh").unwrap();
            bucket.last_refill = Utc::now() - chrono::Duration::seconds(200);
        }
        let evicted = limiter.sweep();
        assert_eq!(evicted, 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn scope_label_is_stable() {
        assert_eq!(RateLimitScope::VpnConfigGenerate.label(), "vpn_config_generate");
    }
}
