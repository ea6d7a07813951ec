//! Trojan protocol
//!
//! Implements the Trojan request format:
//! - 56-byte password (SHA224 hex encoded)
//! - CRLF
//! - Command (1 byte: CONNECT=1, UDP_ASSOCIATE=3)
//! - Address (ATYP + address + port)
//! - CRLF
//! - Payload
//!
//! UDP ASSOCIATE carries datagrams inside the stream as
//! `ATYP + address + port + length(2) + CRLF + payload`.

use bytes::{Bytes, BytesMut};
use serde_json::{Map, Value};
use sha2::{Digest, Sha224};
use subtle::ConstantTimeEq;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::{required_str, Session};
use crate::core::relay::{unspecified_for, UDP_BUFFER_SIZE};
use crate::core::{Address, DecodeResult};
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Maximum buffered UDP-over-TCP bytes to prevent memory exhaustion
const UDP_MAX_READ_BUFFER_SIZE: usize = 256 * 1024;

/// Convert password to hex (56 bytes)
pub fn password_to_hex(password: &str) -> [u8; 56] {
    let hash = Sha224::digest(password.as_bytes());
    let hex_string = hex::encode(hash);
    let mut hex_bytes = [0u8; 56];
    hex_bytes.copy_from_slice(hex_string.as_bytes());
    hex_bytes
}

/// Validated `settings.trojan` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanSettings {
    pub password: String,
}

impl TrojanSettings {
    pub(crate) fn from_section(section: Option<&Map<String, Value>>) -> Result<Self> {
        let password = required_str(section, "trojan", "password")?;
        Ok(Self {
            password: password.to_string(),
        })
    }
}

/// Trojan command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrojanCmd {
    /// TCP connect
    Connect = 1,
    /// UDP associate
    UdpAssociate = 3,
}

impl TryFrom<u8> for TrojanCmd {
    type Error = &'static str;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(TrojanCmd::Connect),
            3 => Ok(TrojanCmd::UdpAssociate),
            _ => Err("invalid trojan command"),
        }
    }
}

/// Trojan protocol request
#[derive(Debug)]
pub struct TrojanRequest {
    /// Password (56 bytes, SHA224 hex encoded)
    pub password: [u8; 56],
    pub cmd: TrojanCmd,
    pub addr: Address,
    /// Bytes that followed the header in the same read
    pub payload: Bytes,
}

impl TrojanRequest {
    /// Minimum request size: 56 (password) + 2 (CRLF) + 1 (cmd) + 7 (min addr) + 2 (CRLF) = 68
    pub const MIN_SIZE: usize = 68;

    /// Decode from `buf`. On success the header is consumed and the rest of
    /// the buffer becomes the payload; otherwise `buf` is left untouched.
    pub fn decode(buf: &mut BytesMut) -> DecodeResult<Self> {
        if buf.len() < Self::MIN_SIZE {
            return DecodeResult::NeedMoreData;
        }

        if buf[56] != b'\r' || buf[57] != b'\n' {
            return DecodeResult::Invalid("missing CRLF after password");
        }

        let cmd = match TrojanCmd::try_from(buf[58]) {
            Ok(cmd) => cmd,
            Err(msg) => return DecodeResult::Invalid(msg),
        };

        let (addr, addr_consumed) = match Address::decode_socks(&buf[59..]) {
            DecodeResult::Ok(addr, consumed) => (addr, consumed),
            DecodeResult::NeedMoreData => return DecodeResult::NeedMoreData,
            DecodeResult::Invalid(msg) => return DecodeResult::Invalid(msg),
        };

        let crlf_pos = 59 + addr_consumed;
        if buf.len() < crlf_pos + 2 {
            return DecodeResult::NeedMoreData;
        }
        if buf[crlf_pos] != b'\r' || buf[crlf_pos + 1] != b'\n' {
            return DecodeResult::Invalid("missing CRLF after address");
        }

        let header_len = crlf_pos + 2;
        let mut password = [0u8; 56];
        password.copy_from_slice(&buf[..56]);

        let _ = buf.split_to(header_len);
        let payload = buf.split().freeze();

        DecodeResult::Ok(
            TrojanRequest {
                password,
                cmd,
                addr,
                payload,
            },
            header_len,
        )
    }

    /// Client-side encoding of a request
    pub fn encode(password: &str, cmd: TrojanCmd, addr: &Address, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::MIN_SIZE + payload.len() + 32);
        buf.extend_from_slice(&password_to_hex(password));
        buf.extend_from_slice(b"\r\n");
        buf.push(cmd as u8);
        addr.encode_socks(&mut buf);
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(payload);
        buf
    }
}

/// Trojan UDP packet format (within TCP stream)
///
/// Format: ATYP(1) + DST.ADDR(variable) + DST.PORT(2) + Length(2) + CRLF(2) + Payload
#[derive(Debug)]
pub struct TrojanUdpPacket {
    pub addr: Address,
    pub payload: Bytes,
}

impl TrojanUdpPacket {
    /// Minimum packet size: 1 (atyp) + 4 (min addr IPv4) + 2 (port) + 2 (length) + 2 (CRLF) = 11
    pub const MIN_SIZE: usize = 11;

    /// Decode a single UDP packet from buffer
    pub fn decode(buf: &[u8]) -> DecodeResult<Self> {
        if buf.len() < Self::MIN_SIZE {
            return DecodeResult::NeedMoreData;
        }

        let (addr, addr_len) = match Address::decode_socks(buf) {
            DecodeResult::Ok(addr, len) => (addr, len),
            DecodeResult::NeedMoreData => return DecodeResult::NeedMoreData,
            DecodeResult::Invalid(msg) => return DecodeResult::Invalid(msg),
        };

        if buf.len() < addr_len + 4 {
            return DecodeResult::NeedMoreData;
        }

        let payload_len = u16::from_be_bytes([buf[addr_len], buf[addr_len + 1]]) as usize;

        if buf[addr_len + 2] != b'\r' || buf[addr_len + 3] != b'\n' {
            return DecodeResult::Invalid("missing CRLF in UDP packet");
        }

        let total_len = addr_len + 4 + payload_len;
        if buf.len() < total_len {
            return DecodeResult::NeedMoreData;
        }

        let payload = Bytes::copy_from_slice(&buf[addr_len + 4..total_len]);
        DecodeResult::Ok(TrojanUdpPacket { addr, payload }, total_len)
    }

    /// Encode UDP packet to buffer
    pub fn encode(addr: &Address, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + payload.len());
        addr.encode_socks(&mut buf);
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(payload);
        buf
    }
}

/// Read until a complete request is buffered
async fn read_request<S>(stream: &mut S, buffer_size: usize) -> Result<TrojanRequest>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(buffer_size);
    let mut temp_buf = vec![0u8; buffer_size];

    loop {
        match TrojanRequest::decode(&mut buf) {
            DecodeResult::Ok(request, _) => return Ok(request),
            DecodeResult::Invalid(e) => {
                return Err(ProxyError::decode(format!("invalid request: {}", e)))
            }
            DecodeResult::NeedMoreData => {}
        }

        let n = stream.read(&mut temp_buf).await?;
        if n == 0 {
            return Err(ProxyError::decode(if buf.is_empty() {
                "connection closed before receiving request"
            } else {
                "connection closed with incomplete request"
            }));
        }
        buf.extend_from_slice(&temp_buf[..n]);

        // Protection against malicious clients
        if buf.len() > buffer_size * 2 {
            return Err(ProxyError::decode("request too large"));
        }
    }
}

/// Trojan inbound handler
#[derive(Debug)]
pub struct TrojanHandler {
    password: [u8; 56],
}

impl TrojanHandler {
    pub fn new(settings: TrojanSettings) -> Self {
        Self {
            password: password_to_hex(&settings.password),
        }
    }

    /// Constant-time comparison against the configured password hash
    pub fn password_matches(&self, candidate: &[u8; 56]) -> bool {
        self.password.ct_eq(candidate).into()
    }

    pub(crate) async fn handle<S>(&self, mut stream: S, session: &Session) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let conn = &session.server.conn_config;
        let request = tokio::time::timeout(
            conn.request_timeout,
            read_request(&mut stream, conn.buffer_size),
        )
        .await
        .map_err(|_| ProxyError::Timeout("request read timeout".to_string()))??;

        if !self.password_matches(&request.password) {
            log::debug!(peer = %session.peer, "Invalid trojan password");
            return Err(ProxyError::validation("invalid password"));
        }

        match request.cmd {
            TrojanCmd::Connect => {
                log::debug!(peer = %session.peer, target = %request.addr, "Trojan CONNECT");
                let remote = session.dial(&request.addr).await?;
                session.relay(stream, remote, &request.payload).await
            }
            TrojanCmd::UdpAssociate => {
                log::debug!(peer = %session.peer, "Trojan UDP ASSOCIATE");
                relay_udp_associate(stream, request.payload, session).await
            }
        }
    }
}

/// Outbound datagram sockets, one per address family, bound on first use
#[derive(Default)]
struct UdpSockets {
    v4: Option<UdpSocket>,
    v6: Option<UdpSocket>,
}

impl UdpSockets {
    async fn send_to(&mut self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        let slot = if target.is_ipv4() {
            &mut self.v4
        } else {
            &mut self.v6
        };
        if slot.is_none() {
            *slot = Some(UdpSocket::bind(unspecified_for(&target)).await?);
        }
        match slot {
            Some(socket) => socket.send_to(payload, target).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "udp socket unavailable")),
        }
    }
}

async fn recv_opt(socket: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn relay_udp_associate<S>(stream: S, initial_payload: Bytes, session: &Session) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let idle_timeout = session.server.conn_config.idle_timeout;
    let peer = session.peer;

    let mut read_buf = BytesMut::with_capacity(8 * 1024);
    read_buf.extend_from_slice(&initial_payload);
    let mut temp_buf = vec![0u8; UDP_BUFFER_SIZE];
    let mut buf4 = vec![0u8; UDP_BUFFER_SIZE];
    let mut buf6 = vec![0u8; UDP_BUFFER_SIZE];
    let mut sockets = UdpSockets::default();
    let mut last_activity = Instant::now();

    loop {
        // Send every complete packet already buffered
        loop {
            match TrojanUdpPacket::decode(&read_buf) {
                DecodeResult::Ok(packet, consumed) => {
                    let _ = read_buf.split_to(consumed);
                    let target = match packet.addr.resolve().await {
                        Ok(target) => target,
                        Err(e) => {
                            log::debug!(peer = %peer, target = %packet.addr, error = %e, "UDP resolve failed");
                            continue;
                        }
                    };
                    match sockets.send_to(&packet.payload, target).await {
                        Ok(n) => {
                            session.ledger.update_traffic(n as u64, 0);
                            last_activity = Instant::now();
                            log::trace!(peer = %peer, target = %packet.addr, bytes = n, "UDP packet sent");
                        }
                        Err(e) => {
                            log::debug!(peer = %peer, target = %packet.addr, error = %e, "UDP send error");
                        }
                    }
                }
                DecodeResult::NeedMoreData => break,
                DecodeResult::Invalid(msg) => {
                    log::debug!(peer = %peer, error = %msg, "Invalid UDP packet");
                    read_buf.clear();
                    break;
                }
            }
        }

        let deadline = last_activity + idle_timeout;
        let idle = async move {
            if idle_timeout.is_zero() {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep_until(deadline).await
            }
        };

        tokio::select! {
            result = reader.read(&mut temp_buf) => {
                let n = result?;
                if n == 0 {
                    log::debug!(peer = %peer, "UDP client disconnected");
                    break;
                }
                if read_buf.len() + n > UDP_MAX_READ_BUFFER_SIZE {
                    log::warn!(
                        peer = %peer,
                        buffer_size = read_buf.len(),
                        "UDP read buffer exceeded limit, closing connection"
                    );
                    break;
                }
                read_buf.extend_from_slice(&temp_buf[..n]);
            }
            result = recv_opt(sockets.v4.as_ref(), &mut buf4) => {
                let (n, from) = result?;
                let response = TrojanUdpPacket::encode(&Address::from(from), &buf4[..n]);
                writer.write_all(&response).await?;
                session.ledger.update_traffic(0, n as u64);
                last_activity = Instant::now();
            }
            result = recv_opt(sockets.v6.as_ref(), &mut buf6) => {
                let (n, from) = result?;
                let response = TrojanUdpPacket::encode(&Address::from(from), &buf6[..n]);
                writer.write_all(&response).await?;
                session.ledger.update_traffic(0, n as u64);
                last_activity = Instant::now();
            }
            _ = idle => {
                log::debug!(peer = %peer, "UDP association idle timeout");
                break;
            }
        }
    }

    Ok(())
}
