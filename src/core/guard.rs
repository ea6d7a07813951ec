//! Admission guard: IP filtering plus per-key rate limiting
//!
//! The accept loop consults [`AdmissionGuard::admit`] before a connection is
//! handed to its protocol handler.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::ip_filter::{GuardError, IpFilter};
use super::rate_limit::RateLimiter;

/// Why a connection was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Peer address is blacklisted
    Blocked,
    /// Peer exceeded its rate limit
    RateLimited,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::Blocked => "ip blocked",
            Rejection::RateLimited => "rate limited",
        }
    }
}

/// Combined gate shared by every inbound
#[derive(Debug, Default)]
pub struct AdmissionGuard {
    ip_filter: IpFilter,
    rate_limiter: Arc<RateLimiter>,
}

impl AdmissionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a peer: IP filter first, then the rate limit keyed by the peer IP
    pub fn admit(&self, ip: &IpAddr) -> Result<(), Rejection> {
        if !self.ip_filter.is_allowed(ip) {
            return Err(Rejection::Blocked);
        }
        if !self.rate_limiter.check_rate_limit(&ip.to_string()) {
            return Err(Rejection::RateLimited);
        }
        Ok(())
    }

    pub fn is_ip_allowed(&self, ip: &str) -> bool {
        self.ip_filter.is_ip_allowed(ip)
    }

    pub fn add_to_whitelist(&self, ip: &str) -> Result<(), GuardError> {
        self.ip_filter.add_to_whitelist(ip)
    }

    pub fn add_to_blacklist(&self, ip: &str) -> Result<(), GuardError> {
        self.ip_filter.add_to_blacklist(ip)
    }

    pub fn remove_from_whitelist(&self, ip: &str) -> Result<(), GuardError> {
        self.ip_filter.remove_from_whitelist(ip)
    }

    pub fn remove_from_blacklist(&self, ip: &str) -> Result<(), GuardError> {
        self.ip_filter.remove_from_blacklist(ip)
    }

    pub fn set_rate_limit(&self, key: &str, limit: u64, window: Duration) {
        self.rate_limiter.set_rate_limit(key, limit, window);
    }

    pub fn check_rate_limit(&self, key: &str) -> bool {
        self.rate_limiter.check_rate_limit(key)
    }

    pub fn ip_filter(&self) -> &IpFilter {
        &self.ip_filter
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Start the background sweep of idle rate-limit entries
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.rate_limiter.spawn_sweeper()
    }

    pub fn shutdown(&self) {
        self.rate_limiter.shutdown();
    }
}
