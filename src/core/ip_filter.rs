//! IP allow/deny lists consulted before a connection is handed to a protocol.
//!
//! Whitelist takes precedence over blacklist; unknown addresses are allowed.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::IpAddr;
use thiserror::Error;

/// Errors returned by the admission guard management surface
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    /// Input is not a parseable IP address
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Address is not present in the list it should be removed from
    #[error("address not present: {0}")]
    NotPresent(String),
}

fn parse_ip(ip: &str) -> Result<IpAddr, GuardError> {
    ip.trim()
        .parse::<IpAddr>()
        .map_err(|_| GuardError::InvalidAddress(ip.to_string()))
}

#[derive(Debug, Default)]
struct FilterSets {
    whitelist: HashSet<IpAddr>,
    blacklist: HashSet<IpAddr>,
}

/// Whitelist/blacklist filter, shared by every accept loop
#[derive(Debug, Default)]
pub struct IpFilter {
    sets: RwLock<FilterSets>,
}

impl IpFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admission decision for a peer address
    pub fn is_allowed(&self, ip: &IpAddr) -> bool {
        let sets = self.sets.read();
        if sets.whitelist.contains(ip) {
            return true;
        }
        !sets.blacklist.contains(ip)
    }

    /// String form of [`is_allowed`](Self::is_allowed); unparsable input is
    /// treated like any unknown address.
    pub fn is_ip_allowed(&self, ip: &str) -> bool {
        match parse_ip(ip) {
            Ok(addr) => self.is_allowed(&addr),
            Err(_) => true,
        }
    }

    pub fn add_to_whitelist(&self, ip: &str) -> Result<(), GuardError> {
        let addr = parse_ip(ip)?;
        self.sets.write().whitelist.insert(addr);
        Ok(())
    }

    pub fn add_to_blacklist(&self, ip: &str) -> Result<(), GuardError> {
        let addr = parse_ip(ip)?;
        self.sets.write().blacklist.insert(addr);
        Ok(())
    }

    pub fn remove_from_whitelist(&self, ip: &str) -> Result<(), GuardError> {
        let addr = parse_ip(ip)?;
        if self.sets.write().whitelist.remove(&addr) {
            Ok(())
        } else {
            Err(GuardError::NotPresent(ip.to_string()))
        }
    }

    pub fn remove_from_blacklist(&self, ip: &str) -> Result<(), GuardError> {
        let addr = parse_ip(ip)?;
        if self.sets.write().blacklist.remove(&addr) {
            Ok(())
        } else {
            Err(GuardError::NotPresent(ip.to_string()))
        }
    }

    pub fn whitelist_len(&self) -> usize {
        self.sets.read().whitelist.len()
    }

    pub fn blacklist_len(&self) -> usize {
        self.sets.read().blacklist.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist_precedence_and_default_allow() {
        let filter = IpFilter::new();
        filter.add_to_whitelist("10.0.0.1").unwrap();
        filter.add_to_blacklist("10.0.0.1").unwrap();
        filter.add_to_blacklist("10.0.0.2").unwrap();

        assert!(filter.is_ip_allowed("10.0.0.1"));
        assert!(!filter.is_ip_allowed("10.0.0.2"));
        assert!(filter.is_ip_allowed("10.0.0.3"));
    }

    #[test]
    fn test_add_invalid_address() {
        let filter = IpFilter::new();
        assert_eq!(
            filter.add_to_whitelist("not-an-ip"),
            Err(GuardError::InvalidAddress("not-an-ip".to_string()))
        );
        assert!(matches!(
            filter.add_to_blacklist("300.1.1.1"),
            Err(GuardError::InvalidAddress(_))
        ));
        assert_eq!(filter.whitelist_len(), 0);
        assert_eq!(filter.blacklist_len(), 0);
    }

    #[test]
    fn test_remove_absent_entry() {
        let filter = IpFilter::new();
        assert_eq!(
            filter.remove_from_whitelist("192.168.1.1"),
            Err(GuardError::NotPresent("192.168.1.1".to_string()))
        );
        assert!(matches!(
            filter.remove_from_blacklist("192.168.1.1"),
            Err(GuardError::NotPresent(_))
        ));
    }

    #[test]
    fn test_remove_restores_default() {
        let filter = IpFilter::new();
        filter.add_to_blacklist("2001:db8::1").unwrap();
        assert!(!filter.is_ip_allowed("2001:db8::1"));

        filter.remove_from_blacklist("2001:db8::1").unwrap();
        assert!(filter.is_ip_allowed("2001:db8::1"));
    }

    #[test]
    fn test_sets_are_independent() {
        let filter = IpFilter::new();
        filter.add_to_whitelist("1.1.1.1").unwrap();
        filter.add_to_blacklist("1.1.1.1").unwrap();

        filter.remove_from_whitelist("1.1.1.1").unwrap();
        assert!(!filter.is_ip_allowed("1.1.1.1"));
        assert_eq!(filter.blacklist_len(), 1);
    }

    #[test]
    fn test_ipv6_normalization() {
        let filter = IpFilter::new();
        filter.add_to_blacklist("::ffff:0:1").unwrap();
        let addr: IpAddr = "0:0:0:0:0:ffff:0:1".parse().unwrap();
        assert!(!filter.is_allowed(&addr));
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        use std::sync::Arc;
        use std::thread;

        let filter = Arc::new(IpFilter::new());
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let f = Arc::clone(&filter);
                thread::spawn(move || {
                    let ip = format!("10.0.{}.1", i);
                    for _ in 0..100 {
                        f.add_to_blacklist(&ip).unwrap();
                        assert!(!f.is_ip_allowed(&ip));
                        f.remove_from_blacklist(&ip).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(filter.blacklist_len(), 0);
    }
}
