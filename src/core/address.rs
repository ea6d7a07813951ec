//! Target address shared by every protocol handler
//!
//! Trojan and SOCKS5 carry addresses in the SOCKS binary layout
//! (ATYP + address + port); VLESS and HTTP carry them as text and are
//! converted at their own decode step.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::lookup_host;

/// SOCKS-style address type constants
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

/// Outcome of an incremental decode
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// Successfully decoded, with bytes consumed
    Ok(T, usize),
    /// Need more data
    NeedMoreData,
    /// Invalid data
    Invalid(&'static str),
}

/// Destination requested by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Address::Ipv4(ip, addr.port()),
            IpAddr::V6(ip) => Address::Ipv6(ip, addr.port()),
        }
    }
}

impl Address {
    /// Build from a host string, recognising literal IPs
    pub fn from_host(host: &str, port: u16) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Address::Ipv4(ip, port),
            Ok(IpAddr::V6(ip)) => Address::Ipv6(ip, port),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    /// Parse `host:port` / `[v6]:port` authority text
    pub fn parse_authority(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        if host.is_empty() {
            return None;
        }
        if host.contains(':') && !host.starts_with('[') {
            return None;
        }
        Some(Self::from_host(host, port))
    }

    /// Decode a SOCKS-layout address from `buf`
    pub fn decode_socks(buf: &[u8]) -> DecodeResult<Self> {
        if buf.is_empty() {
            return DecodeResult::NeedMoreData;
        }

        match buf[0] {
            ATYP_IPV4 => {
                // 1 (type) + 4 (ip) + 2 (port)
                if buf.len() < 7 {
                    return DecodeResult::NeedMoreData;
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                DecodeResult::Ok(Address::Ipv4(ip, port), 7)
            }
            ATYP_IPV6 => {
                // 1 (type) + 16 (ip) + 2 (port)
                if buf.len() < 19 {
                    return DecodeResult::NeedMoreData;
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                DecodeResult::Ok(Address::Ipv6(Ipv6Addr::from(octets), port), 19)
            }
            ATYP_DOMAIN => {
                // 1 (type) + 1 (len) + len + 2 (port)
                if buf.len() < 2 {
                    return DecodeResult::NeedMoreData;
                }
                let len = buf[1] as usize;
                let total = 2 + len + 2;
                if buf.len() < total {
                    return DecodeResult::NeedMoreData;
                }
                let domain = match std::str::from_utf8(&buf[2..2 + len]) {
                    Ok(s) if !s.is_empty() => s.to_string(),
                    Ok(_) => return DecodeResult::Invalid("empty domain"),
                    Err(_) => return DecodeResult::Invalid("invalid domain encoding"),
                };
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                DecodeResult::Ok(Address::Domain(domain, port), total)
            }
            _ => DecodeResult::Invalid("invalid address type"),
        }
    }

    /// Append the SOCKS-layout encoding; returns bytes written
    pub fn encode_socks(&self, buf: &mut Vec<u8>) -> usize {
        let start = buf.len();
        match self {
            Address::Ipv4(ip, port) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Ipv6(ip, port) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Domain(domain, port) => {
                let bytes = domain.as_bytes();
                let len = bytes.len().min(u8::MAX as usize);
                buf.push(ATYP_DOMAIN);
                buf.push(len as u8);
                buf.extend_from_slice(&bytes[..len]);
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        buf.len() - start
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) | Address::Ipv6(_, port) | Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ipv4(ip, _) => ip.to_string(),
            Address::Ipv6(ip, _) => ip.to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Resolve to a socket address (first DNS answer for domains)
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        match self {
            Address::Ipv4(ip, port) => Ok(SocketAddr::new(IpAddr::V4(*ip), *port)),
            Address::Ipv6(ip, port) => Ok(SocketAddr::new(IpAddr::V6(*ip), *port)),
            Address::Domain(domain, port) => {
                let mut addrs = lookup_host((domain.as_str(), *port)).await?;
                addrs.next().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no addresses found for {}", domain),
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_socks_ipv4() {
        let buf = [1, 192, 168, 1, 1, 0x1F, 0x90];
        match Address::decode_socks(&buf) {
            DecodeResult::Ok(addr, consumed) => {
                assert_eq!(consumed, 7);
                assert_eq!(addr, Address::Ipv4(Ipv4Addr::new(192, 168, 1, 1), 8080));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_socks_ipv6() {
        let mut buf = vec![4];
        buf.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        buf.extend_from_slice(&443u16.to_be_bytes());
        match Address::decode_socks(&buf) {
            DecodeResult::Ok(addr, consumed) => {
                assert_eq!(consumed, 19);
                assert_eq!(addr, Address::Ipv6(Ipv6Addr::LOCALHOST, 443));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_socks_domain() {
        let mut buf = vec![3, 11];
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&[0x00, 0x50]);
        match Address::decode_socks(&buf) {
            DecodeResult::Ok(addr, consumed) => {
                assert_eq!(consumed, 15);
                assert_eq!(addr, Address::Domain("example.com".to_string(), 80));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_socks_incomplete_and_invalid() {
        assert!(matches!(Address::decode_socks(&[1, 10, 0]), DecodeResult::NeedMoreData));
        assert!(matches!(Address::decode_socks(&[4, 0, 0]), DecodeResult::NeedMoreData));
        assert!(matches!(Address::decode_socks(&[3, 5, b'a']), DecodeResult::NeedMoreData));
        assert!(matches!(Address::decode_socks(&[9, 0, 0, 0, 0, 0, 0]), DecodeResult::Invalid(_)));
        assert!(matches!(Address::decode_socks(&[3, 0, 0, 80]), DecodeResult::Invalid(_)));
    }

    #[test]
    fn test_encode_matches_decode_layout() {
        let addr = Address::Domain("udp.example".to_string(), 53);
        let mut buf = Vec::new();
        let written = addr.encode_socks(&mut buf);
        assert_eq!(written, buf.len());
        assert_eq!(&buf[..2], &[3, 11]);
        assert!(matches!(Address::decode_socks(&buf), DecodeResult::Ok(ref a, n) if *a == addr && n == written));
    }

    #[test]
    fn test_display() {
        assert_eq!(Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1), 9000).to_string(), "127.0.0.1:9000");
        assert_eq!(Address::Ipv6(Ipv6Addr::LOCALHOST, 443).to_string(), "[::1]:443");
        assert_eq!(Address::Domain("example.com".into(), 80).to_string(), "example.com:80");
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            Address::parse_authority("example.com:443"),
            Some(Address::Domain("example.com".to_string(), 443))
        );
        assert_eq!(
            Address::parse_authority("10.0.0.1:22"),
            Some(Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 22))
        );
        assert_eq!(
            Address::parse_authority("[::1]:8443"),
            Some(Address::Ipv6(Ipv6Addr::LOCALHOST, 8443))
        );
        assert_eq!(Address::parse_authority("example.com"), None);
        assert_eq!(Address::parse_authority(":80"), None);
        assert_eq!(Address::parse_authority("::1:80"), None);
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let addr = Address::Ipv4(Ipv4Addr::LOCALHOST, 9000);
        assert_eq!(addr.resolve().await.unwrap(), "127.0.0.1:9000".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_localhost_domain() {
        let addr = Address::Domain("localhost".to_string(), 8080);
        let resolved = addr.resolve().await.unwrap();
        assert_eq!(resolved.port(), 8080);
        assert!(resolved.ip().is_loopback());
    }
}
