//! Per-key sliding window rate limiting.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::Error;

/// Limits how many requests a key may make within a sliding window.
///
/// Keys are normalized phone numbers. Timestamps older than the window are
/// dropped whenever their key is checked, and [RateLimiter::evict_expired]
/// drops keys that have gone quiet so the map does not grow without bound.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    requests: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Allow up to `max_requests` per key in any `window`.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            window,
            max_requests,
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request for `key` made at `now`.
    ///
    /// # Errors
    /// Returns [Error::RateLimited] if `key` has already made the maximum
    /// number of requests in the window ending at `now`. Rejected requests are
    /// not recorded.
    pub fn check(&self, key: &str, now: Instant) -> Result<(), Error> {
        let mut requests = self
            .requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let timestamps = requests.entry(key.to_owned()).or_default();
        drop_expired(timestamps, now, self.window);

        if timestamps.len() >= self.max_requests {
            tracing::warn!(key, "Rate limit exceeded");
            return Err(Error::RateLimited);
        }

        timestamps.push_back(now);

        Ok(())
    }

    /// Forget keys with no requests in the window ending at `now`.
    ///
    /// Returns the number of keys removed.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut requests = self
            .requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let before = requests.len();
        requests.retain(|_, timestamps| {
            drop_expired(timestamps, now, self.window);
            !timestamps.is_empty()
        });

        before - requests.len()
    }

    /// The number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

fn drop_expired(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}
