//! VLESS protocol
//!
//! Request layout on the wire:
//!
//! ```text
//! nonce(12) | seal(version(1) | command(1) | option(1) | port(2, BE)
//!                  | address-length(1) | timestamp(8, BE unix seconds))
//! address-length bytes = address-type(1) | address text
//! ```
//!
//! The sealed block is AES-256-GCM under `SHA-256(id)` with no associated
//! data, so the fixed prefix is 12 + 14 + 16 = 42 bytes. Everything after the
//! address is relayed as-is.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use super::{required_str, Session};
use crate::core::{relay, unix_now, Address};
use crate::error::{ProxyError, Result};
use crate::logger::log;

pub const VLESS_VERSION: u8 = 0;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// version + command + option + port + address-length + timestamp
pub const FIELDS_LEN: usize = 14;
pub const PREFIX_LEN: usize = NONCE_LEN + FIELDS_LEN + TAG_LEN;
/// Largest accepted clock difference between client and server
pub const TIMESTAMP_TOLERANCE_SECS: i64 = 120;

pub const CMD_TCP: u8 = 1;
pub const CMD_UDP: u8 = 2;

pub const ATYP_IPV4: u8 = 1;
pub const ATYP_DOMAIN: u8 = 2;
pub const ATYP_IPV6: u8 = 3;

/// Validated `settings.vless` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessSettings {
    pub id: String,
    pub flow: String,
    pub security: String,
}

impl VlessSettings {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            flow: String::new(),
            security: "none".to_string(),
        }
    }

    pub(crate) fn from_section(section: Option<&Map<String, Value>>) -> Result<Self> {
        let id = required_str(section, "vless", "id")?;
        let text = |key: &str, default: &str| {
            section
                .and_then(|s| s.get(key))
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        Ok(Self {
            id: id.to_string(),
            flow: text("flow", ""),
            security: text("security", "none"),
        })
    }
}

/// Decoded request header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessRequest {
    pub version: u8,
    pub command: u8,
    pub option: u8,
    pub port: u16,
    pub address_type: u8,
    pub address: String,
    /// Client clock, unix seconds
    pub timestamp: i64,
}

impl VlessRequest {
    /// Check version, timestamp window and address against `now`
    pub fn validate_at(&self, now: i64) -> Result<()> {
        if self.version != VLESS_VERSION {
            return Err(ProxyError::validation(format!(
                "unsupported version {}",
                self.version
            )));
        }
        let skew = now.saturating_sub(self.timestamp).saturating_abs();
        if skew > TIMESTAMP_TOLERANCE_SECS {
            return Err(ProxyError::validation(format!(
                "timestamp outside window ({}s skew)",
                skew
            )));
        }
        self.target().map(|_| ())
    }

    /// Target address; IP address types must carry parseable text
    pub fn target(&self) -> Result<Address> {
        match self.address_type {
            ATYP_IPV4 => self
                .address
                .parse::<Ipv4Addr>()
                .map(|ip| Address::Ipv4(ip, self.port))
                .map_err(|_| ProxyError::validation(format!("invalid IPv4 address {:?}", self.address))),
            ATYP_IPV6 => self
                .address
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<Ipv6Addr>()
                .map(|ip| Address::Ipv6(ip, self.port))
                .map_err(|_| ProxyError::validation(format!("invalid IPv6 address {:?}", self.address))),
            ATYP_DOMAIN if !self.address.is_empty() => {
                Ok(Address::Domain(self.address.clone(), self.port))
            }
            ATYP_DOMAIN => Err(ProxyError::validation("empty domain")),
            other => Err(ProxyError::validation(format!("invalid address type {}", other))),
        }
    }
}

/// Header cipher keyed by the instance id
pub struct VlessCodec {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for VlessCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VlessCodec").finish_non_exhaustive()
    }
}

impl VlessCodec {
    pub fn new(id: &str) -> Result<Self> {
        if id.is_empty() {
            return Err(ProxyError::config("vless settings: id must not be empty"));
        }
        let key = Sha256::digest(id.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| ProxyError::config("vless settings: invalid key length"))?;
        Ok(Self { cipher })
    }

    /// Open the fixed prefix; returns the fields and the address length
    fn open_prefix(&self, prefix: &[u8; PREFIX_LEN]) -> Result<(VlessRequest, usize)> {
        let (nonce, sealed) = prefix.split_at(NONCE_LEN);
        let fields = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| ProxyError::decode("header authentication failed"))?;
        if fields.len() != FIELDS_LEN {
            return Err(ProxyError::decode("malformed header block"));
        }

        let address_len = fields[5] as usize;
        if address_len == 0 {
            return Err(ProxyError::decode("missing address type"));
        }
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&fields[6..14]);

        let request = VlessRequest {
            version: fields[0],
            command: fields[1],
            option: fields[2],
            port: u16::from_be_bytes([fields[3], fields[4]]),
            address_type: 0,
            address: String::new(),
            timestamp: i64::from_be_bytes(timestamp),
        };
        Ok((request, address_len))
    }

    /// Read and decode one request header
    pub async fn read_request<R>(&self, reader: &mut R) -> Result<VlessRequest>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; PREFIX_LEN];
        reader.read_exact(&mut prefix).await.map_err(short_read)?;
        let (mut request, address_len) = self.open_prefix(&prefix)?;

        let mut address = vec![0u8; address_len];
        reader.read_exact(&mut address).await.map_err(short_read)?;
        request.address_type = address[0];
        request.address = String::from_utf8(address[1..].to_vec())
            .map_err(|_| ProxyError::decode("address is not valid UTF-8"))?;
        Ok(request)
    }

    /// Client-side encoder producing the bytes [`read_request`](Self::read_request) accepts
    pub fn seal_request(&self, request: &VlessRequest, nonce: [u8; NONCE_LEN]) -> Result<Vec<u8>> {
        let address = request.address.as_bytes();
        if address.len() + 1 > u8::MAX as usize {
            return Err(ProxyError::validation("address too long"));
        }

        let mut fields = Vec::with_capacity(FIELDS_LEN);
        fields.push(request.version);
        fields.push(request.command);
        fields.push(request.option);
        fields.extend_from_slice(&request.port.to_be_bytes());
        fields.push((address.len() + 1) as u8);
        fields.extend_from_slice(&request.timestamp.to_be_bytes());

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), fields.as_slice())
            .map_err(|_| ProxyError::decode("header encryption failed"))?;

        let mut out = Vec::with_capacity(PREFIX_LEN + 1 + address.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        out.push(request.address_type);
        out.extend_from_slice(address);
        Ok(out)
    }
}

fn short_read(e: std::io::Error) -> ProxyError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProxyError::decode("truncated header")
    } else {
        ProxyError::Io(e)
    }
}

/// VLESS inbound handler
#[derive(Debug)]
pub struct VlessHandler {
    settings: VlessSettings,
    codec: VlessCodec,
}

impl VlessHandler {
    pub fn new(settings: VlessSettings) -> Result<Self> {
        let codec = VlessCodec::new(&settings.id)?;
        Ok(Self { settings, codec })
    }

    pub fn settings(&self) -> &VlessSettings {
        &self.settings
    }

    pub fn codec(&self) -> &VlessCodec {
        &self.codec
    }

    pub(crate) async fn handle<S>(&self, mut stream: S, session: &Session) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request = tokio::time::timeout(
            session.server.conn_config.request_timeout,
            self.codec.read_request(&mut stream),
        )
        .await
        .map_err(|_| ProxyError::Timeout("request read timeout".to_string()))??;

        request.validate_at(unix_now())?;
        let target = request.target()?;

        match request.command {
            CMD_TCP => {
                log::debug!(peer = %session.peer, target = %target, "VLESS TCP request");
                let remote = session.dial(&target).await?;
                session.relay(stream, remote, &[]).await
            }
            CMD_UDP => {
                log::debug!(peer = %session.peer, target = %target, "VLESS UDP request");
                let socket = relay::open_udp(&target).await?;
                let result = relay::relay_udp(
                    stream,
                    &socket,
                    session.ledger.as_ref(),
                    session.server.conn_config.relay_options(),
                )
                .await?;
                log::trace!(peer = %session.peer, up = result.upload, down = result.download, "UDP relay finished");
                Ok(())
            }
            other => Err(ProxyError::validation(format!("unsupported command {}", other))),
        }
    }
}
