//! Per-key request rate limiting
//!
//! Keys are opt-in: only keys registered through [`RateLimiter::set_rate_limit`]
//! are counted, every other key is unrestricted. Admission uses a fixed
//! policy (100 requests per one-minute window); the limit/window passed at
//! registration are kept for reporting only.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::logger::log;

/// Length of one counting window
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
/// Highest count still admitted within a window
pub const RATE_LIMIT_CEILING: u64 = 100;
/// Period of the idle-entry sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Entries whose window started longer ago than this are reclaimed
pub const ENTRY_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Counting state for one key
#[derive(Debug, Clone)]
pub struct RateLimitEntry {
    pub count: u64,
    pub window_start: Instant,
    /// Declared limit, informational
    pub limit: u64,
    /// Declared window, informational
    pub window: Duration,
}

/// Rate limiter shared by every accept loop
#[derive(Debug)]
pub struct RateLimiter {
    entries: RwLock<HashMap<String, RateLimitEntry>>,
    shutdown: CancellationToken,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create or reset the entry for `key`
    pub fn set_rate_limit(&self, key: &str, limit: u64, window: Duration) {
        let entry = RateLimitEntry {
            count: 0,
            window_start: Instant::now(),
            limit,
            window,
        };
        self.entries.write().insert(key.to_string(), entry);
    }

    /// Count one request for `key` and return whether it is admitted
    pub fn check_rate_limit(&self, key: &str) -> bool {
        if !self.entries.read().contains_key(key) {
            return true;
        }

        let mut entries = self.entries.write();
        // Swept between the two lock acquisitions
        let Some(entry) = entries.get_mut(key) else {
            return true;
        };

        let now = Instant::now();
        entry.count = entry.count.saturating_add(1);
        if now.duration_since(entry.window_start) > RATE_LIMIT_WINDOW {
            entry.count = 1;
            entry.window_start = now;
        }
        entry.count <= RATE_LIMIT_CEILING
    }

    /// Copy of the entry for `key`, if registered
    pub fn entry(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop entries idle beyond [`ENTRY_RETENTION`]; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.window_start) <= ENTRY_RETENTION);
        before - entries.len()
    }

    /// Spawn the periodic sweep; it runs until [`shutdown`](Self::shutdown)
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            log::debug!(removed = removed, remaining = limiter.len(), "Rate limit entries swept");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        log::debug!("Rate limit sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the sweeper. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_unknown_key_is_unrestricted() {
        let limiter = RateLimiter::new();
        for _ in 0..500 {
            assert!(limiter.check_rate_limit("203.0.113.9"));
        }
        assert!(limiter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_101st_request_in_window_is_blocked() {
        let limiter = RateLimiter::new();
        limiter.set_rate_limit("client", 10, Duration::from_secs(1));

        for i in 1..=100 {
            assert!(limiter.check_rate_limit("client"), "request {} should pass", i);
        }
        assert!(!limiter.check_rate_limit("client"));
        assert!(!limiter.check_rate_limit("client"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset_after_one_minute() {
        let limiter = RateLimiter::new();
        limiter.set_rate_limit("client", 100, RATE_LIMIT_WINDOW);
        for _ in 0..101 {
            limiter.check_rate_limit("client");
        }
        assert!(!limiter.check_rate_limit("client"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check_rate_limit("client"));
        assert_eq!(limiter.entry("client").unwrap().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_one_minute_does_not_reset() {
        let limiter = RateLimiter::new();
        limiter.set_rate_limit("client", 100, RATE_LIMIT_WINDOW);
        for _ in 0..100 {
            limiter.check_rate_limit("client");
        }

        tokio::time::advance(RATE_LIMIT_WINDOW).await;
        assert!(!limiter.check_rate_limit("client"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rate_limit_resets_entry() {
        let limiter = RateLimiter::new();
        limiter.set_rate_limit("k", 5, Duration::from_secs(30));
        for _ in 0..150 {
            limiter.check_rate_limit("k");
        }
        limiter.set_rate_limit("k", 7, Duration::from_secs(10));

        let entry = limiter.entry("k").unwrap();
        assert_eq!(entry.count, 0);
        assert_eq!(entry.limit, 7);
        assert_eq!(entry.window, Duration::from_secs(10));
        assert!(limiter.check_rate_limit("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_stale_entries() {
        let limiter = RateLimiter::new();
        limiter.set_rate_limit("stale", 1, RATE_LIMIT_WINDOW);

        tokio::time::advance(Duration::from_secs(12 * 60 * 60)).await;
        limiter.set_rate_limit("fresh", 1, RATE_LIMIT_WINDOW);

        tokio::time::advance(Duration::from_secs(12 * 60 * 60 + 1)).await;
        assert_eq!(limiter.sweep(), 1);
        assert!(limiter.entry("stale").is_none());
        assert!(limiter.entry("fresh").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_reclaims_and_stops() {
        let limiter = Arc::new(RateLimiter::new());
        limiter.set_rate_limit("idle", 1, RATE_LIMIT_WINDOW);
        let handle = limiter.spawn_sweeper();
        // Let the sweeper arm its interval before moving the clock
        tokio::task::yield_now().await;

        tokio::time::advance(ENTRY_RETENTION + SWEEP_INTERVAL).await;
        for _ in 0..20 {
            if limiter.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(limiter.is_empty());

        limiter.shutdown();
        limiter.shutdown();
        handle.await.unwrap();
    }
}
