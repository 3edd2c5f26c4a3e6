//! Per-principal request quotas.
//!
//! Fixed windows aligned to the wall clock: every request increments the
//! counter of `(key, window_start)` and is admitted while the count stays at
//! or below the limit. Counters live behind a [`RateLimitStore`]; if the store
//! errors the request is admitted and the error logged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::Result;
use crate::config::RateLimitConfig;

/// Counter storage for rate-limit windows.
#[async_trait]
pub trait RateLimitStore: Send + Sync + 'static {
    /// Increment the counter of `key` in the window starting at
    /// `window_start` (unix seconds) and return the new count.
    async fn increment(&self, key: &str, window_start: i64) -> Result<u64>;

    /// Drop windows that started before `cutoff`. Returns how many were dropped.
    async fn evict_before(&self, cutoff: i64) -> usize;
}

/// In-memory counters keyed by `(key, window_start)`
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    windows: DashMap<(String, i64), u64>,
}

impl InMemoryRateLimitStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live windows
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no windows are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn increment(&self, key: &str, window_start: i64) -> Result<u64> {
        let mut count = self
            .windows
            .entry((key.to_string(), window_start))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn evict_before(&self, cutoff: i64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|(_, start), _| *start >= cutoff);
        before - self.windows.len()
    }
}

/// Outcome of one quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Quota for the window
    pub limit: u32,
    /// Requests left in the window
    pub remaining: u32,
    /// Seconds until the window resets
    pub reset_secs: u64,
}

/// Fixed-window rate limiter
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    enabled: bool,
    default_limit: u32,
    window_secs: i64,
}

impl RateLimiter {
    /// Create a limiter from configuration
    pub fn new(store: Arc<dyn RateLimitStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            enabled: config.enabled,
            default_limit: config.default_per_minute.max(1),
            window_secs: i64::try_from(config.window.as_secs()).unwrap_or(60).max(1),
        }
    }

    /// Whether enforcement is on
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Quota used for `limit` (0 = default)
    #[must_use]
    pub fn effective_limit(&self, limit: u32) -> u32 {
        if limit == 0 { self.default_limit } else { limit }
    }

    /// Count one request against `key` and decide whether it is admitted.
    pub async fn allow(&self, key: &str, limit: u32) -> Decision {
        self.allow_at(key, limit, Utc::now().timestamp()).await
    }

    async fn allow_at(&self, key: &str, limit: u32, now: i64) -> Decision {
        let limit = self.effective_limit(limit);
        let window_start = now - now.rem_euclid(self.window_secs);
        let reset_secs = u64::try_from(window_start + self.window_secs - now).unwrap_or(0);

        let count = match self.store.increment(key, window_start).await {
            Ok(count) => count,
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limit store failed, admitting request");
                return Decision {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset_secs,
                };
            }
        };

        let remaining = u64::from(limit).saturating_sub(count);
        Decision {
            allowed: count <= u64::from(limit),
            limit,
            remaining: u32::try_from(remaining).unwrap_or(limit),
            reset_secs,
        }
    }

    /// Window length in seconds
    #[must_use]
    pub fn window_secs(&self) -> i64 {
        self.window_secs
    }
}

/// Spawn a background task evicting windows older than the current one.
pub fn spawn_reaper(
    store: Arc<dyn RateLimitStore>,
    window_secs: i64,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now().timestamp();
                    let current = now - now.rem_euclid(window_secs);
                    let evicted = store.evict_before(current).await;
                    if evicted > 0 {
                        debug!(count = evicted, "Evicted stale rate-limit windows");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Rate-limit reaper shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn limiter(store: Arc<dyn RateLimitStore>, default: u32) -> RateLimiter {
        let config = RateLimitConfig {
            default_per_minute: default,
            ..RateLimitConfig::default()
        };
        RateLimiter::new(store, &config)
    }

    struct FailingStore;

    #[async_trait]
    impl RateLimitStore for FailingStore {
        async fn increment(&self, _: &str, _: i64) -> Result<u64> {
            Err(Error::Store("redis down".to_string()))
        }

        async fn evict_before(&self, _: i64) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn exactly_limit_requests_pass_then_deny() {
        // GIVEN: a limit of 5 in a fixed window
        let rl = limiter(Arc::new(InMemoryRateLimitStore::new()), 1000);
        let now = 1_700_000_010;

        // WHEN: 5 requests arrive
        for i in 0..5 {
            let d = rl.allow_at("acme:key_1", 5, now).await;
            assert!(d.allowed, "request {i} should pass");
            assert_eq!(d.remaining, 4 - i);
        }

        // THEN: the 6th is denied with nothing remaining
        let d = rl.allow_at("acme:key_1", 5, now).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.limit, 5);
    }

    #[tokio::test]
    async fn new_window_resets_count() {
        let rl = limiter(Arc::new(InMemoryRateLimitStore::new()), 1000);
        let now = 1_700_000_040;
        assert!(rl.allow_at("k", 1, now).await.allowed);
        assert!(!rl.allow_at("k", 1, now + 1).await.allowed);
        assert!(rl.allow_at("k", 1, now + 60).await.allowed);
    }

    #[tokio::test]
    async fn reset_counts_down_to_window_end() {
        let rl = limiter(Arc::new(InMemoryRateLimitStore::new()), 1000);
        // 1_700_000_040 is 40s into its minute
        assert_eq!(rl.allow_at("k", 10, 1_700_000_040).await.reset_secs, 20);
    }

    #[tokio::test]
    async fn zero_limit_uses_default() {
        let rl = limiter(Arc::new(InMemoryRateLimitStore::new()), 1000);
        let d = rl.allow("acme:user", 0).await;
        assert_eq!(d.limit, 1000);
        assert_eq!(d.remaining, 999);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let rl = limiter(Arc::new(InMemoryRateLimitStore::new()), 1000);
        let now = 1_700_000_000;
        assert!(rl.allow_at("a", 1, now).await.allowed);
        assert!(rl.allow_at("b", 1, now).await.allowed);
    }

    #[tokio::test]
    async fn store_error_fails_open() {
        let rl = limiter(Arc::new(FailingStore), 1000);
        let d = rl.allow("acme:key", 1).await;
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn stale_windows_are_evicted() {
        let store = InMemoryRateLimitStore::new();
        store.increment("k", 0).await.unwrap();
        store.increment("k", 60).await.unwrap();
        assert_eq!(store.evict_before(60).await, 1);
        assert_eq!(store.len(), 1);
    }
}
