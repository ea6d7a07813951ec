//! Hook traits for extensibility
//!
//! Extension points through which the relay engine and background tasks talk
//! to collaborators without depending on their concrete types.

use async_trait::async_trait;

use crate::notify::Notification;

/// Traffic sink written by the relay engine.
///
/// Called from both relay directions concurrently, so implementations must
/// be internally synchronized.
pub trait StatsCollector: Send + Sync {
    /// Record upload bytes (client -> target)
    fn record_upload(&self, bytes: u64);
    /// Record download bytes (target -> client)
    fn record_download(&self, bytes: u64);
    /// Mark the owner as active now
    fn record_activity(&self);
}

/// Delivery channel for notifications produced by the core.
///
/// Delivery itself (SMTP, webhooks, ...) lives outside the core.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingCollector {
        up: AtomicU64,
        down: AtomicU64,
    }

    impl StatsCollector for CountingCollector {
        fn record_upload(&self, bytes: u64) {
            self.up.fetch_add(bytes, Ordering::Relaxed);
        }
        fn record_download(&self, bytes: u64) {
            self.down.fetch_add(bytes, Ordering::Relaxed);
        }
        fn record_activity(&self) {}
    }

    #[test]
    fn test_stats_collector_as_trait_object() {
        let collector = CountingCollector {
            up: AtomicU64::new(0),
            down: AtomicU64::new(0),
        };
        let sink: &dyn StatsCollector = &collector;
        sink.record_upload(3);
        sink.record_download(4);
        assert_eq!(collector.up.load(Ordering::Relaxed), 3);
        assert_eq!(collector.down.load(Ordering::Relaxed), 4);
    }
}
