//! Protocol handlers
//!
//! Each inbound speaks exactly one protocol. The set is closed: a
//! [`ProtocolKind`] tag names it, [`ProtocolSettings`] carries its validated
//! configuration and [`Protocol`] is the handler that runs per connection.

mod dokodemo;
mod http;
mod listener;
mod socks;
pub mod trojan;
pub mod vless;

use serde_json::{Map, Value};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::core::{relay, Address, Server, TrafficLedger};
use crate::error::{ProxyError, Result};
use crate::logger::log;

pub use dokodemo::{DokodemoHandler, DokodemoSettings};
pub use http::HttpHandler;
pub use listener::Inbound;
pub use socks::SocksHandler;
pub use trojan::{TrojanHandler, TrojanSettings};
pub use vless::{VlessHandler, VlessSettings};

/// Protocol tag carried by an instance descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Dokodemo,
    Socks,
    Http,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Vmess => "vmess",
            ProtocolKind::Vless => "vless",
            ProtocolKind::Trojan => "trojan",
            ProtocolKind::Shadowsocks => "shadowsocks",
            ProtocolKind::Dokodemo => "dokodemo",
            ProtocolKind::Socks => "socks",
            ProtocolKind::Http => "http",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vmess" => Ok(ProtocolKind::Vmess),
            "vless" => Ok(ProtocolKind::Vless),
            "trojan" => Ok(ProtocolKind::Trojan),
            "shadowsocks" => Ok(ProtocolKind::Shadowsocks),
            "dokodemo" | "dokodemo-door" => Ok(ProtocolKind::Dokodemo),
            "socks" => Ok(ProtocolKind::Socks),
            "http" => Ok(ProtocolKind::Http),
            other => Err(ProxyError::config(format!("unknown protocol: {}", other))),
        }
    }
}

/// Validated per-protocol settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolSettings {
    Vless(VlessSettings),
    Trojan(TrojanSettings),
    Dokodemo(DokodemoSettings),
    Socks,
    Http,
}

impl ProtocolSettings {
    /// Validate the descriptor settings map for `kind`.
    ///
    /// Each protocol reads its own section, e.g. `settings.vless.id`.
    pub fn from_map(kind: ProtocolKind, settings: &Map<String, Value>) -> Result<Self> {
        let section = settings.get(kind.as_str()).and_then(Value::as_object);
        match kind {
            ProtocolKind::Vless => VlessSettings::from_section(section).map(Self::Vless),
            ProtocolKind::Trojan => TrojanSettings::from_section(section).map(Self::Trojan),
            ProtocolKind::Dokodemo => DokodemoSettings::from_section(section).map(Self::Dokodemo),
            ProtocolKind::Socks => Ok(Self::Socks),
            ProtocolKind::Http => Ok(Self::Http),
            ProtocolKind::Vmess | ProtocolKind::Shadowsocks => Err(ProxyError::config(format!(
                "{} framing not implemented",
                kind
            ))),
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            Self::Vless(_) => ProtocolKind::Vless,
            Self::Trojan(_) => ProtocolKind::Trojan,
            Self::Dokodemo(_) => ProtocolKind::Dokodemo,
            Self::Socks => ProtocolKind::Socks,
            Self::Http => ProtocolKind::Http,
        }
    }
}

/// Required non-empty string field of a settings section
pub(crate) fn required_str<'a>(
    section: Option<&'a Map<String, Value>>,
    protocol: &str,
    key: &str,
) -> Result<&'a str> {
    match section.and_then(|s| s.get(key)) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::String(_)) => Err(ProxyError::config(format!(
            "{} settings: {} must not be empty",
            protocol, key
        ))),
        Some(_) => Err(ProxyError::config(format!(
            "{} settings: {} must be a string",
            protocol, key
        ))),
        None => Err(ProxyError::config(format!(
            "{} settings: missing {}",
            protocol, key
        ))),
    }
}

/// Per-connection context handed to a handler
pub struct Session {
    pub peer: SocketAddr,
    pub ledger: Arc<TrafficLedger>,
    pub server: Arc<Server>,
}

impl Session {
    pub fn new(peer: SocketAddr, ledger: Arc<TrafficLedger>, server: Arc<Server>) -> Self {
        Self {
            peer,
            ledger,
            server,
        }
    }

    /// Dial `target` using the node's connect timeout
    pub async fn dial(&self, target: &Address) -> Result<tokio::net::TcpStream> {
        let conn = &self.server.conn_config;
        let stream = relay::dial_tcp(target, conn.connect_timeout, conn.tcp_nodelay).await?;
        log::debug!(peer = %self.peer, target = %target, "Connected to remote");
        Ok(stream)
    }

    /// Relay `client` and `remote`, forwarding `initial_payload` first
    pub async fn relay<C, R>(&self, client: C, mut remote: R, initial_payload: &[u8]) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        R: AsyncRead + AsyncWrite + Unpin,
    {
        if !initial_payload.is_empty() {
            remote.write_all(initial_payload).await?;
            self.ledger.update_traffic(initial_payload.len() as u64, 0);
        }

        let result = relay::relay_tcp(
            client,
            remote,
            self.ledger.as_ref(),
            self.server.conn_config.relay_options(),
        )
        .await?;

        if result.completed {
            log::trace!(peer = %self.peer, up = result.upload, down = result.download, "Relay completed");
        } else {
            log::debug!(peer = %self.peer, up = result.upload, down = result.download, "Connection idle timeout");
        }
        Ok(())
    }
}

/// Handler for one inbound
#[derive(Debug)]
pub enum Protocol {
    Vless(VlessHandler),
    Trojan(TrojanHandler),
    Dokodemo(DokodemoHandler),
    Socks(SocksHandler),
    Http(HttpHandler),
}

impl Protocol {
    /// Build the handler for validated settings
    pub fn new(settings: &ProtocolSettings) -> Result<Self> {
        Ok(match settings {
            ProtocolSettings::Vless(s) => Protocol::Vless(VlessHandler::new(s.clone())?),
            ProtocolSettings::Trojan(s) => Protocol::Trojan(TrojanHandler::new(s.clone())),
            ProtocolSettings::Dokodemo(s) => Protocol::Dokodemo(DokodemoHandler::new(s.clone())),
            ProtocolSettings::Socks => Protocol::Socks(SocksHandler),
            ProtocolSettings::Http => Protocol::Http(HttpHandler),
        })
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            Protocol::Vless(_) => ProtocolKind::Vless,
            Protocol::Trojan(_) => ProtocolKind::Trojan,
            Protocol::Dokodemo(_) => ProtocolKind::Dokodemo,
            Protocol::Socks(_) => ProtocolKind::Socks,
            Protocol::Http(_) => ProtocolKind::Http,
        }
    }

    /// Run the protocol state machine for one accepted stream
    pub async fn handle<S>(&self, stream: S, session: &Session) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match self {
            Protocol::Vless(h) => h.handle(stream, session).await,
            Protocol::Trojan(h) => h.handle(stream, session).await,
            Protocol::Dokodemo(h) => h.handle(stream, session).await,
            Protocol::Socks(h) => h.handle(stream, session).await,
            Protocol::Http(h) => h.handle(stream, session).await,
        }
    }
}
