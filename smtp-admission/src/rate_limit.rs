use std::{
    hash::Hash,
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Width of a rate-limit window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Window {
    Minute,
    Hour,
    Day,
    Custom(Duration),
}

impl Window {
    fn duration(&self) -> Duration {
        match self {
            Window::Minute => Duration::from_secs(60),
            Window::Hour => Duration::from_secs(3600),
            Window::Day => Duration::from_secs(24 * 3600),
            Window::Custom(d) => *d,
        }
    }
}

/// A single key's outcome when it is over the configured limit.
#[derive(Clone, Debug)]
pub struct RateLimitExceeded {
    pub current: u32,
    pub limit: u32,
    pub window: Duration,
    pub reset_at: DateTime<Utc>,
}

struct Bucket {
    window_start: DateTime<Utc>,
    count: u32,
}

/// Fixed-window rate limiter keyed by, e.g., remote IP: each key gets a
/// counter that resets to zero every time a window elapses, rather than a
/// continuously-draining token bucket. Simpler to reason about and to
/// serialize for tests, at the cost of allowing up to `2x limit` requests
/// across a window boundary.
pub struct RateLimiter<K> {
    limit: u32,
    window: Window,
    buckets: DashMap<K, Mutex<Bucket>>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new(limit: u32, window: Window) -> RateLimiter<K> {
        RateLimiter {
            limit,
            window,
            buckets: DashMap::new(),
        }
    }

    /// Records one request for `key`, returning `Err` with the details
    /// needed to build a `452`/`421` response if it pushed the key over
    /// the limit.
    pub fn check_and_increment(&self, key: K) -> Result<(), RateLimitExceeded> {
        let now = Utc::now();
        let window_len = self.window.duration();
        let bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| {
                Mutex::new(Bucket {
                    window_start: now,
                    count: 0,
                })
            });
        let mut bucket = bucket.lock().expect("rate limit mutex poisoned");
        if now.signed_duration_since(bucket.window_start)
            >= chrono::Duration::from_std(window_len).unwrap_or_else(|_| chrono::Duration::zero())
        {
            bucket.window_start = now;
            bucket.count = 0;
        }
        bucket.count += 1;
        if bucket.count > self.limit {
            Err(RateLimitExceeded {
                current: bucket.count,
                limit: self.limit,
                window: window_len,
                reset_at: bucket.window_start
                    + chrono::Duration::from_std(window_len)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let limiter: RateLimiter<IpAddr> = RateLimiter::new(2, Window::Custom(Duration::from_secs(3600)));
        let ip: IpAddr = "9.9.9.9".parse().unwrap();
        assert!(limiter.check_and_increment(ip).is_ok());
        assert!(limiter.check_and_increment(ip).is_ok());
        let err = limiter
            .check_and_increment(ip)
            .expect_err("third request in window should be rejected");
        assert_eq!(err.limit, 2);
        assert_eq!(err.current, 3);
    }
}
