//! Per-user sliding-window rate limiter.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::util::now_millis;

const WINDOW_MS: i64 = 60_000;

pub struct RateLimiter {
    max_per_minute: usize,
    windows: Mutex<HashMap<String, Vec<i64>>>,
}

impl RateLimiter {
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            max_per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record an event for the user and report whether they are over the
    /// per-minute cap.
    pub fn is_limited(&self, user_id: &str) -> bool {
        let now = now_millis();
        let mut windows = self.windows.lock().expect("rate map lock poisoned");
        let timestamps = windows.entry(user_id.to_string()).or_default();
        timestamps.retain(|t| now - t < WINDOW_MS);
        timestamps.push(now);
        timestamps.len() > self.max_per_minute
    }

    /// Drop stale entries. Called on the sweeper tick so the map does not
    /// grow with every user ever seen.
    pub fn prune(&self) {
        let now = now_millis();
        let mut windows = self.windows.lock().expect("rate map lock poisoned");
        windows.retain(|_, timestamps| {
            timestamps.retain(|t| now - t < WINDOW_MS);
            !timestamps.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_cap() {
        let limiter = RateLimiter::new(3);
        assert!(!limiter.is_limited("u1"));
        assert!(!limiter.is_limited("u1"));
        assert!(!limiter.is_limited("u1"));
        assert!(limiter.is_limited("u1"));
        // other users have their own window
        assert!(!limiter.is_limited("u2"));
    }

    #[test]
    fn prune_discards_empty_windows() {
        let limiter = RateLimiter::new(10);
        limiter.is_limited("u1");
        {
            let mut windows = limiter.windows.lock().unwrap();
            windows.get_mut("u1").unwrap()[0] = now_millis() - WINDOW_MS - 1;
        }
        limiter.prune();
        assert!(limiter.windows.lock().unwrap().is_empty());
    }
}
