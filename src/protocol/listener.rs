//! Inbound listener and accept loop
//!
//! An [`Inbound`] owns one TCP listener for one proxy instance. Accepted
//! peers pass the admission guard and then run the instance's protocol in
//! their own task.

use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Protocol, ProtocolKind, Session};
use crate::core::{unix_now, Server, TrafficLedger};
use crate::error::{ProxyError, Result};
use crate::logger::log;

/// TCP keepalive interval. Dead peers are detected in ~45s (3 probes x 15s).
const TCP_KEEPALIVE_SECS: u64 = 15;

/// State shared between an inbound and its accept loop
struct Shared {
    instance_id: i64,
    port: u16,
    protocol: Protocol,
    server: Arc<Server>,
    ledger: Arc<TrafficLedger>,
    active: AtomicUsize,
}

impl Shared {
    async fn handle_connection<S>(&self, stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let session = Session::new(peer, Arc::clone(&self.ledger), Arc::clone(&self.server));
        self.ledger.update_last_active(unix_now());
        let result = self.protocol.handle(stream, &session).await;
        self.ledger.update_last_active(unix_now());
        result
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Listener for one proxy instance
pub struct Inbound {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("instance_id", &self.shared.instance_id)
            .field("protocol", &self.shared.protocol.kind())
            .field("port", &self.shared.port)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl Inbound {
    pub fn new(
        instance_id: i64,
        port: u16,
        protocol: Protocol,
        server: Arc<Server>,
        ledger: Arc<TrafficLedger>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                instance_id,
                port,
                protocol,
                server,
                ledger,
                active: AtomicUsize::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    /// Configured port (0 = OS-assigned)
    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.shared.protocol.kind()
    }

    /// Bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Connections currently being handled
    pub fn active_connections(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Bind the listener and spawn the accept loop.
    ///
    /// Starting a running inbound returns its current address.
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let conn = &self.shared.server.conn_config;
        let addr = conn
            .listen_addr(self.shared.port)
            .map_err(|e| ProxyError::config(format!("invalid listen host {}: {}", conn.listen_host, e)))?;
        let listener = bind_listener(addr, conn.tcp_backlog)?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            cancel.clone(),
        ));

        let mut running = self.running.lock();
        if let Some(existing) = running.as_ref() {
            // Lost a concurrent start; keep the first listener
            cancel.cancel();
            return Ok(existing.local_addr);
        }
        *running = Some(Running {
            cancel,
            task,
            local_addr,
        });
        drop(running);

        log::info!(
            instance = self.shared.instance_id,
            protocol = %self.protocol(),
            address = %local_addr,
            "Inbound started"
        );
        Ok(local_addr)
    }

    /// Stop accepting, cancel in-flight connections and wait for the accept
    /// loop to exit. Stopping a stopped inbound does nothing.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.task.await {
            log::warn!(instance = self.shared.instance_id, error = %e, "Accept loop panicked");
        }
        log::info!(
            instance = self.shared.instance_id,
            protocol = %self.protocol(),
            "Inbound stopped"
        );
    }
    /// Run the protocol state machine on an already accepted stream,
    /// bypassing the listener and the admission guard
    pub async fn handle_connection<S>(&self, stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.shared.handle_connection(stream, peer).await
    }
}

impl Drop for Inbound {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

/// Bind a TCP listener with SO_REUSEADDR for fast restarts
fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into())?)
}

fn tune_stream(stream: &TcpStream, nodelay: bool) {
    if nodelay {
        let _ = stream.set_nodelay(true);
    }
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    let protocol = shared.protocol.kind();
    log::inbound(shared.instance_id, protocol.as_str(), "accepting");

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let peer_str = peer.to_string();
                if let Err(rejection) = shared.server.guard.admit(&peer.ip()) {
                    log::admission(&peer_str, rejection.as_str());
                    continue;
                }
                log::connection(&peer_str, "new");
                tune_stream(&stream, shared.server.conn_config.tcp_nodelay);

                let shared = Arc::clone(&shared);
                let conn_cancel = cancel.child_token();
                shared.active.fetch_add(1, Ordering::AcqRel);

                tokio::spawn(async move {
                    let _active = scopeguard::guard(Arc::clone(&shared), |shared| {
                        shared.active.fetch_sub(1, Ordering::AcqRel);
                    });

                    let result = tokio::select! {
                        result = shared.handle_connection(stream, peer) => result,
                        _ = conn_cancel.cancelled() => {
                            log::debug!(peer = %peer_str, "Connection cancelled");
                            Ok(())
                        }
                    };

                    if let Err(e) = result {
                        log::debug!(peer = %peer_str, error = %e, "Connection error");
                    }
                    log::connection(&peer_str, "closed");
                });
            }
            Err(e) => {
                log::error!(error = %e, "Failed to accept connection");
                // Continue accepting unless it's a fatal error
                if e.kind() == std::io::ErrorKind::Other {
                    break;
                }
            }
        }
    }

    log::inbound(shared.instance_id, protocol.as_str(), "stopped accepting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn echo_target() -> (SocketAddr, JoinHandle<()>) {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let addr = std_listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let listener = TcpListener::from_std(std_listener).unwrap();
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        (addr, handle)
    }

    fn dokodemo_inbound(target: SocketAddr, server: Arc<Server>) -> Inbound {
        let settings = crate::protocol::DokodemoSettings {
            address: target.ip().to_string(),
            port: target.port(),
        };
        let protocol = Protocol::Dokodemo(crate::protocol::DokodemoHandler::new(settings));
        Inbound::new(1, 0, protocol, server, Arc::new(TrafficLedger::new()))
    }

    fn loopback_server() -> Arc<Server> {
        Arc::new(Server::builder().conn_config(ConnConfig::loopback()).build())
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (target, _echo) = echo_target();
        let inbound = dokodemo_inbound(target, loopback_server());
        assert!(!inbound.is_running());
        assert_eq!(inbound.port(), 0);
        assert_eq!(inbound.protocol(), ProtocolKind::Dokodemo);

        let addr = inbound.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(inbound.local_addr(), Some(addr));
        assert_eq!(inbound.start().await.unwrap(), addr);

        inbound.stop().await;
        assert!(!inbound.is_running());
        inbound.stop().await;

        // Listener is released
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_accepts_and_relays() {
        let (target, _echo) = echo_target();
        let inbound = dokodemo_inbound(target, loopback_server());
        let addr = inbound.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"through the door").await.unwrap();
        let mut buf = [0u8; 16];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the door");
        assert_eq!(inbound.active_connections(), 1);

        drop(client);
        inbound.stop().await;
    }

    #[tokio::test]
    async fn test_handle_connection_on_duplex() {
        let (target, _echo) = echo_target();
        let inbound = dokodemo_inbound(target, loopback_server());
        let (mut client, server_side) = tokio::io::duplex(1024);
        let peer: SocketAddr = "192.0.2.7:5000".parse().unwrap();

        let task = tokio::spawn(async move {
            let result = inbound.handle_connection(server_side, peer).await;
            (result, inbound)
        });
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(client);

        let (result, inbound) = task.await.unwrap();
        assert!(result.is_ok());
        let ledger = inbound.shared.ledger.snapshot();
        assert_eq!((ledger.upload, ledger.download), (4, 4));
        assert!(ledger.last_active > 0);
    }

    #[tokio::test]
    async fn test_blacklisted_peer_is_dropped() {
        let (target, _echo) = echo_target();
        let server = loopback_server();
        server.guard.add_to_blacklist("127.0.0.1").unwrap();
        let inbound = dokodemo_inbound(target, server);
        let addr = inbound.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = client.write_all(b"hello").await;
        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        inbound.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_connections() {
        let (target, _echo) = echo_target();
        let inbound = dokodemo_inbound(target, loopback_server());
        let addr = inbound.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut byte = [0u8; 1];
        client.read_exact(&mut byte).await.unwrap();

        inbound.stop().await;
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut byte))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        for _ in 0..50 {
            if inbound.active_connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(inbound.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let (target, _echo) = echo_target();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let settings = crate::protocol::DokodemoSettings {
            address: target.ip().to_string(),
            port: target.port(),
        };
        let protocol = Protocol::Dokodemo(crate::protocol::DokodemoHandler::new(settings));
        let inbound = Inbound::new(2, port, protocol, loopback_server(), Arc::new(TrafficLedger::new()));
        assert!(matches!(inbound.start().await, Err(ProxyError::Io(_))));
        assert!(!inbound.is_running());
    }

    #[test]
    fn test_tcp_keepalive_interval() {
        assert_eq!(TCP_KEEPALIVE_SECS, 15);
        assert!(TCP_KEEPALIVE_SECS * 3 <= 60, "keepalive detection should be under 60s");
    }
}
