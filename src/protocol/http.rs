//! HTTP CONNECT tunnelling
//!
//! Only `CONNECT host:port` is served. Any other method gets a 405 and the
//! connection is closed.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Session;
use crate::core::Address;
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// Largest request head accepted
const MAX_HEADER_SIZE: usize = 8 * 1024;

const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const RESPONSE_BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const RESPONSE_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\nAllow: CONNECT\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const RESPONSE_BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Offset of the blank line ending the request head
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parsed request line
#[derive(Debug, PartialEq, Eq)]
struct RequestLine<'a> {
    method: &'a str,
    target: &'a str,
}

fn parse_request_line(head: &[u8]) -> Option<RequestLine<'_>> {
    let line_end = head.windows(2).position(|w| w == b"\r\n").unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end]).ok()?;
    let mut parts = line.split_ascii_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") || parts.next().is_some() {
        return None;
    }
    Some(RequestLine { method, target })
}

/// Read the request head; returns it with any bytes that followed it
async fn read_head<S>(stream: &mut S) -> Result<(Vec<u8>, usize)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::decode("connection closed before request head"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_header_end(&buf) {
            return Ok((buf, end + 4));
        }
        if buf.len() > MAX_HEADER_SIZE {
            return Err(ProxyError::decode("request head too large"));
        }
    }
}

#[derive(Debug)]
pub struct HttpHandler;

impl HttpHandler {
    pub(crate) async fn handle<S>(&self, mut stream: S, session: &Session) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (buf, head_len) = tokio::time::timeout(
            session.server.conn_config.request_timeout,
            read_head(&mut stream),
        )
        .await
        .map_err(|_| ProxyError::Timeout("request read timeout".to_string()))??;

        let Some(line) = parse_request_line(&buf[..head_len]) else {
            stream.write_all(RESPONSE_BAD_REQUEST).await?;
            return Err(ProxyError::decode("malformed request line"));
        };

        if !line.method.eq_ignore_ascii_case("CONNECT") {
            log::debug!(peer = %session.peer, method = line.method, "HTTP method not allowed");
            stream.write_all(RESPONSE_NOT_ALLOWED).await?;
            let _ = stream.shutdown().await;
            return Ok(());
        }

        let Some(target) = Address::parse_authority(line.target) else {
            stream.write_all(RESPONSE_BAD_REQUEST).await?;
            return Err(ProxyError::validation(format!(
                "invalid CONNECT target {:?}",
                line.target
            )));
        };

        log::debug!(peer = %session.peer, target = %target, "HTTP CONNECT");
        let remote = match session.dial(&target).await {
            Ok(remote) => remote,
            Err(e) => {
                let _ = stream.write_all(RESPONSE_BAD_GATEWAY).await;
                return Err(e);
            }
        };

        stream.write_all(RESPONSE_ESTABLISHED).await?;
        session.relay(stream, remote, &buf[head_len..]).await
    }
}
