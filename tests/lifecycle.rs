//! Instance manager lifecycle against live listeners

mod common;

use serde_json::json;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use server_proxy_r::config::NodeFile;
use server_proxy_r::core::AdmissionGuard;
use server_proxy_r::error::ProxyError;

use common::{descriptor, echo_server, manager, start_instance};

#[tokio::test]
async fn test_stop_closes_listener_and_connections() {
    let echo = echo_server().await;
    let manager = manager();
    let addr = start_instance(
        &manager,
        descriptor(
            1,
            "dokodemo",
            json!({"dokodemo": {"address": "127.0.0.1", "port": echo.port()}}),
        ),
    )
    .await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hi").await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(manager.snapshot(1).await.unwrap().active_connections, 1);

    manager.stop(1).await.unwrap();

    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(TcpStream::connect(addr).await.is_err());

    let snapshot = manager.snapshot(1).await.unwrap();
    assert!(!snapshot.enabled);
    assert!(!snapshot.is_running());
    assert_eq!(snapshot.upload, 2);
}

#[tokio::test]
async fn test_restart_on_fixed_port() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let manager = manager();
    let mut http = descriptor(1, "http", json!({}));
    http.port = port;
    let addr = start_instance(&manager, http).await;
    assert_eq!(addr.port(), port);

    manager.stop(1).await.unwrap();
    let again = manager.start(1).await.unwrap();
    assert_eq!(again.port(), port);

    // A second enabled instance may not claim the same port
    let mut clash = descriptor(2, "socks", json!({}));
    clash.port = port;
    assert!(matches!(manager.create(clash).await, Err(ProxyError::Config(_))));

    manager.remove(1).await.unwrap();
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_node_file_to_running_instances() {
    let echo = echo_server().await;
    let yaml = format!(
        r#"
settings:
  traffic_warning_threshold: 0
guard:
  blacklist: ["192.0.2.10"]
instances:
  - id: 10
    protocol: dokodemo
    settings:
      dokodemo:
        address: 127.0.0.1
        port: {}
  - id: 11
    protocol: socks
    enabled: false
"#,
        echo.port()
    );
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.yaml");
    std::fs::File::create(&path)
        .unwrap()
        .write_all(yaml.as_bytes())
        .unwrap();

    let node = NodeFile::load(&path).unwrap();
    let guard = AdmissionGuard::new();
    node.guard.apply(&guard).unwrap();
    assert!(!guard.is_ip_allowed("192.0.2.10"));

    let manager = manager();
    for descriptor in node.instances {
        manager.create(descriptor).await.unwrap();
    }
    assert!(manager.start_all().await.is_empty());

    let snapshots = manager.snapshots().await;
    assert!(snapshots[0].is_running());
    assert!(!snapshots[1].is_running());

    let addr = snapshots[0].local_addr.unwrap();
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ok").await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ok");

    manager.stop_all().await;
}
