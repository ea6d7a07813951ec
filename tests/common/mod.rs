#![allow(dead_code)]

use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use server_proxy_r::config::ConnConfig;
use server_proxy_r::core::{AdmissionGuard, Server};
use server_proxy_r::manager::{InstanceDescriptor, InstanceManager};

/// TCP echo server on loopback
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// UDP echo server on loopback
pub async fn udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

pub fn manager_with_guard(guard: Arc<AdmissionGuard>) -> Arc<InstanceManager> {
    let server = Server::builder()
        .guard(guard)
        .conn_config(ConnConfig::loopback())
        .build();
    Arc::new(InstanceManager::new(Arc::new(server)))
}

pub fn manager() -> Arc<InstanceManager> {
    manager_with_guard(Arc::new(AdmissionGuard::new()))
}

pub fn descriptor(id: i64, protocol: &str, settings: Value) -> InstanceDescriptor {
    InstanceDescriptor {
        id,
        user_id: 1,
        protocol: protocol.to_string(),
        port: 0,
        settings: settings.as_object().cloned().unwrap_or_else(Map::new),
        enabled: true,
    }
}

/// Create and start an instance; returns its bound address
pub async fn start_instance(manager: &InstanceManager, descriptor: InstanceDescriptor) -> SocketAddr {
    let id = descriptor.id;
    manager.create(descriptor).await.unwrap();
    manager.start(id).await.unwrap()
}
