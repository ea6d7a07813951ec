//! Multi-protocol proxy node
//!
//! Layout:
//! - `core/`: admission guard, traffic ledger, addresses and the relay engine
//! - `protocol/`: per-protocol handlers and the inbound accept loop
//! - `manager`: proxy instance lifecycle
//! - `notify`: settings snapshot, notifications and the traffic watcher

pub mod config;
pub mod core;
pub mod error;
pub mod logger;
pub mod manager;
pub mod notify;
pub mod protocol;

pub use error::{ProxyError, Result};
