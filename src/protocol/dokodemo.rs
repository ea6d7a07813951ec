//! Dokodemo ("any door"): every connection goes to one configured target

use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{required_str, Session};
use crate::core::Address;
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Validated `settings.dokodemo` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DokodemoSettings {
    pub address: String,
    pub port: u16,
}

impl DokodemoSettings {
    pub(crate) fn from_section(section: Option<&Map<String, Value>>) -> Result<Self> {
        let address = required_str(section, "dokodemo", "address")?;
        let port = match section.and_then(|s| s.get("port")).map(Value::as_u64) {
            Some(Some(port)) if (1..=u16::MAX as u64).contains(&port) => port as u16,
            Some(_) => {
                return Err(ProxyError::config(
                    "dokodemo settings: port must be an integer in 1..=65535",
                ))
            }
            None => return Err(ProxyError::config("dokodemo settings: missing port")),
        };
        Ok(Self {
            address: address.to_string(),
            port,
        })
    }
}

#[derive(Debug)]
pub struct DokodemoHandler {
    target: Address,
}

impl DokodemoHandler {
    pub fn new(settings: DokodemoSettings) -> Self {
        Self {
            target: Address::from_host(&settings.address, settings.port),
        }
    }

    pub fn target(&self) -> &Address {
        &self.target
    }

    pub(crate) async fn handle<S>(&self, stream: S, session: &Session) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        log::debug!(peer = %session.peer, target = %self.target, "Dokodemo forward");
        let remote = session.dial(&self.target).await?;
        session.relay(stream, remote, &[]).await
    }
}
