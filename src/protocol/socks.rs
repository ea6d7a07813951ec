//! SOCKS5 inbound: no-auth method, CONNECT command only

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Session;
use crate::core::{Address, DecodeResult};
use crate::error::{ProxyError, Result};
use crate::logger::log;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Reply with an all-zero IPv4 bound address
fn reply(rep: u8) -> [u8; 10] {
    [SOCKS_VERSION, rep, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
}

/// Read the SOCKS-layout destination that follows VER CMD RSV
async fn read_address<S>(stream: &mut S) -> Result<Option<Address>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 2];
    stream.read_exact(&mut buf).await?;
    loop {
        match Address::decode_socks(&buf) {
            DecodeResult::Ok(addr, _) => return Ok(Some(addr)),
            DecodeResult::Invalid(_) => return Ok(None),
            DecodeResult::NeedMoreData => {
                let missing = match buf[0] {
                    0x01 => 7 - buf.len(),
                    0x04 => 19 - buf.len(),
                    _ => 2 + buf[1] as usize + 2 - buf.len(),
                };
                let start = buf.len();
                buf.resize(start + missing, 0);
                stream.read_exact(&mut buf[start..]).await?;
            }
        }
    }
}

#[derive(Debug)]
pub struct SocksHandler;

impl SocksHandler {
    pub(crate) async fn handle<S>(&self, mut stream: S, session: &Session) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let target = tokio::time::timeout(
            session.server.conn_config.request_timeout,
            Self::negotiate(&mut stream),
        )
        .await
        .map_err(|_| ProxyError::Timeout("request read timeout".to_string()))??;

        log::debug!(peer = %session.peer, target = %target, "SOCKS5 CONNECT");
        let remote = match session.dial(&target).await {
            Ok(remote) => remote,
            Err(e) => {
                let _ = stream.write_all(&reply(REP_GENERAL_FAILURE)).await;
                return Err(e);
            }
        };

        let mut response = vec![SOCKS_VERSION, REP_SUCCEEDED, 0x00];
        match remote.local_addr() {
            Ok(bound) => {
                Address::from(bound).encode_socks(&mut response);
            }
            Err(_) => response.extend_from_slice(&[0x01, 0, 0, 0, 0, 0, 0]),
        }
        stream.write_all(&response).await?;

        session.relay(stream, remote, &[]).await
    }

    /// Method selection plus request; returns the CONNECT target
    async fn negotiate<S>(stream: &mut S) -> Result<Address>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(ProxyError::decode(format!(
                "unsupported SOCKS version {}",
                header[0]
            )));
        }
        let mut methods = vec![0u8; header[1] as usize];
        stream.read_exact(&mut methods).await?;
        if !methods.contains(&METHOD_NO_AUTH) {
            stream
                .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
                .await?;
            return Err(ProxyError::validation("no acceptable SOCKS auth method"));
        }
        stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

        let mut request = [0u8; 3];
        stream.read_exact(&mut request).await?;
        if request[0] != SOCKS_VERSION {
            return Err(ProxyError::decode("bad SOCKS request version"));
        }
        if request[1] != CMD_CONNECT {
            stream.write_all(&reply(REP_COMMAND_NOT_SUPPORTED)).await?;
            return Err(ProxyError::validation(format!(
                "unsupported SOCKS command {}",
                request[1]
            )));
        }

        match read_address(stream).await? {
            Some(addr) => Ok(addr),
            None => {
                stream.write_all(&reply(REP_ADDRESS_NOT_SUPPORTED)).await?;
                Err(ProxyError::validation("unsupported SOCKS address type"))
            }
        }
    }
}
