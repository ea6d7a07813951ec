//! Core proxy module
//!
//! This module contains the parts shared by every protocol handler:
//! - Target addresses and incremental decoding
//! - Traffic ledger and hook traits
//! - Admission guard (IP filter + rate limiter)
//! - Bidirectional relay

pub mod address;
pub mod guard;
pub mod hooks;
pub mod ip_filter;
pub mod ledger;
pub mod rate_limit;
pub mod relay;
mod server;

pub use address::{Address, DecodeResult};
pub use guard::{AdmissionGuard, Rejection};
pub use hooks::{Notifier, StatsCollector};
pub use ip_filter::{GuardError, IpFilter};
pub use ledger::{unix_now, LedgerSnapshot, TrafficLedger};
pub use rate_limit::RateLimiter;
pub use relay::{relay_tcp, relay_udp, RelayOptions, RelayResult};
pub use server::{Server, ServerBuilder};
