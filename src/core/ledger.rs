//! Per-instance traffic and activity ledger
//!
//! Counters are atomics so both relay directions of a connection (and all
//! connections of an instance) can record concurrently without a lock.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::hooks::StatsCollector;

/// Current wall-clock time as unix seconds
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Upload/download counters plus last-active marker for one proxy instance
#[derive(Debug, Default)]
pub struct TrafficLedger {
    /// Bytes moved client -> target
    upload: AtomicU64,
    /// Bytes moved target -> client
    download: AtomicU64,
    /// Unix seconds, 0 = never active
    last_active: AtomicI64,
}

/// Point-in-time copy of a ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerSnapshot {
    pub upload: u64,
    pub download: u64,
    pub last_active: i64,
}

impl LedgerSnapshot {
    pub fn total(&self) -> u64 {
        self.upload.saturating_add(self.download)
    }
}

impl TrafficLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a ledger from persisted counters
    pub fn with_counters(upload: u64, download: u64, last_active: i64) -> Self {
        Self {
            upload: AtomicU64::new(upload),
            download: AtomicU64::new(download),
            last_active: AtomicI64::new(last_active),
        }
    }

    /// Add deltas to the running totals
    pub fn update_traffic(&self, upload: u64, download: u64) {
        if upload > 0 {
            self.upload.fetch_add(upload, Ordering::Relaxed);
        }
        if download > 0 {
            self.download.fetch_add(download, Ordering::Relaxed);
        }
    }

    /// Overwrite the last-active marker
    pub fn update_last_active(&self, timestamp: i64) {
        self.last_active.store(timestamp, Ordering::Relaxed);
    }

    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }

    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            upload: self.upload(),
            download: self.download(),
            last_active: self.last_active(),
        }
    }

    /// Zero both counters and return what they held
    pub fn reset(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            upload: self.upload.swap(0, Ordering::AcqRel),
            download: self.download.swap(0, Ordering::AcqRel),
            last_active: self.last_active(),
        }
    }
}

impl StatsCollector for TrafficLedger {
    fn record_upload(&self, bytes: u64) {
        self.update_traffic(bytes, 0);
    }

    fn record_download(&self, bytes: u64) {
        self.update_traffic(0, bytes);
    }

    fn record_activity(&self) {
        self.update_last_active(unix_now());
    }
}
