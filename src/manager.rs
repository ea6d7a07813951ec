//! Proxy instance lifecycle
//!
//! The manager is the composition root for inbounds: it validates instance
//! descriptors, builds one [`Inbound`] per instance and owns its traffic
//! ledger.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::{unix_now, LedgerSnapshot, Server, TrafficLedger};
use crate::error::{ProxyError, Result};
use crate::logger::log;
use crate::protocol::{Inbound, Protocol, ProtocolKind, ProtocolSettings};

fn default_enabled() -> bool {
    true
}

/// Instance description as stored by the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub id: i64,
    #[serde(default)]
    pub user_id: i64,
    pub protocol: String,
    /// 0 lets the OS pick a port
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A configured proxy instance
pub struct ProxyInstance {
    pub id: i64,
    pub user_id: i64,
    pub port: u16,
    pub settings: ProtocolSettings,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
    ledger: Arc<TrafficLedger>,
    inbound: Inbound,
}

impl ProxyInstance {
    pub fn protocol(&self) -> ProtocolKind {
        self.settings.kind()
    }

    pub fn ledger(&self) -> &Arc<TrafficLedger> {
        &self.ledger
    }

    pub fn inbound(&self) -> &Inbound {
        &self.inbound
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let traffic = self.ledger.snapshot();
        InstanceSnapshot {
            id: self.id,
            user_id: self.user_id,
            protocol: self.protocol().to_string(),
            port: self.port,
            enabled: self.enabled,
            local_addr: self.inbound.local_addr(),
            active_connections: self.inbound.active_connections(),
            upload: traffic.upload,
            download: traffic.download,
            last_active: traffic.last_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Point-in-time view of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSnapshot {
    pub id: i64,
    pub user_id: i64,
    pub protocol: String,
    pub port: u16,
    pub enabled: bool,
    /// Bound address while the inbound is running
    pub local_addr: Option<SocketAddr>,
    pub active_connections: usize,
    pub upload: u64,
    pub download: u64,
    pub last_active: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl InstanceSnapshot {
    pub fn is_running(&self) -> bool {
        self.local_addr.is_some()
    }

    pub fn total_traffic(&self) -> u64 {
        self.upload.saturating_add(self.download)
    }
}

/// Owner of every proxy instance on the node
pub struct InstanceManager {
    server: Arc<Server>,
    instances: RwLock<HashMap<i64, ProxyInstance>>,
}

fn unknown(id: i64) -> ProxyError {
    ProxyError::config(format!("unknown instance {}", id))
}

/// Another enabled instance already holding `port`
fn port_holder(instances: &HashMap<i64, ProxyInstance>, id: i64, port: u16) -> Option<i64> {
    if port == 0 {
        return None;
    }
    instances
        .values()
        .find(|other| other.id != id && other.enabled && other.port == port)
        .map(|other| other.id)
}

impl InstanceManager {
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Validate a descriptor and register its instance without starting it
    pub async fn create(&self, descriptor: InstanceDescriptor) -> Result<InstanceSnapshot> {
        let kind: ProtocolKind = descriptor.protocol.parse()?;
        let settings = ProtocolSettings::from_map(kind, &descriptor.settings)?;
        let protocol = Protocol::new(&settings)?;

        let mut instances = self.instances.write().await;
        if instances.contains_key(&descriptor.id) {
            return Err(ProxyError::config(format!(
                "instance {} already exists",
                descriptor.id
            )));
        }
        if descriptor.enabled {
            if let Some(holder) = port_holder(&instances, descriptor.id, descriptor.port) {
                return Err(ProxyError::config(format!(
                    "port {} already used by instance {}",
                    descriptor.port, holder
                )));
            }
        }

        let ledger = Arc::new(TrafficLedger::new());
        let inbound = Inbound::new(
            descriptor.id,
            descriptor.port,
            protocol,
            Arc::clone(&self.server),
            Arc::clone(&ledger),
        );
        let now = unix_now();
        let instance = ProxyInstance {
            id: descriptor.id,
            user_id: descriptor.user_id,
            port: descriptor.port,
            settings,
            enabled: descriptor.enabled,
            created_at: now,
            updated_at: now,
            ledger,
            inbound,
        };
        let snapshot = instance.snapshot();
        instances.insert(descriptor.id, instance);

        log::inbound(descriptor.id, kind.as_str(), "created");
        Ok(snapshot)
    }

    /// Start an instance's inbound and mark it enabled
    pub async fn start(&self, id: i64) -> Result<SocketAddr> {
        let mut instances = self.instances.write().await;
        let port = instances.get(&id).ok_or_else(|| unknown(id))?.port;
        if let Some(holder) = port_holder(&instances, id, port) {
            return Err(ProxyError::config(format!(
                "port {} already used by instance {}",
                port, holder
            )));
        }

        let instance = instances.get_mut(&id).ok_or_else(|| unknown(id))?;
        let addr = instance.inbound.start().await?;
        if !instance.enabled {
            instance.enabled = true;
            instance.updated_at = unix_now();
        }
        Ok(addr)
    }

    /// Stop an instance's inbound and mark it disabled; the record is kept
    pub async fn stop(&self, id: i64) -> Result<()> {
        let mut instances = self.instances.write().await;
        let instance = instances.get_mut(&id).ok_or_else(|| unknown(id))?;
        instance.inbound.stop().await;
        if instance.enabled {
            instance.enabled = false;
            instance.updated_at = unix_now();
        }
        Ok(())
    }

    /// Stop and discard an instance; returns its final snapshot
    pub async fn remove(&self, id: i64) -> Result<InstanceSnapshot> {
        let mut instances = self.instances.write().await;
        let instance = instances.remove(&id).ok_or_else(|| unknown(id))?;
        instance.inbound.stop().await;
        log::inbound(id, instance.protocol().as_str(), "removed");
        Ok(instance.snapshot())
    }

    /// Start every enabled instance; returns the ones that failed
    pub async fn start_all(&self) -> Vec<(i64, ProxyError)> {
        let instances = self.instances.read().await;
        let mut ids: Vec<i64> = instances
            .values()
            .filter(|i| i.enabled)
            .map(|i| i.id)
            .collect();
        ids.sort_unstable();

        let mut failures = Vec::new();
        for id in ids {
            if let Some(instance) = instances.get(&id) {
                if let Err(e) = instance.inbound.start().await {
                    log::error!(instance = id, error = %e, "Failed to start inbound");
                    failures.push((id, e));
                }
            }
        }
        failures
    }

    /// Stop every running inbound. Enabled flags are left as they are so a
    /// later `start_all` brings the same set back.
    pub async fn stop_all(&self) {
        let instances = self.instances.read().await;
        for instance in instances.values() {
            instance.inbound.stop().await;
        }
    }

    pub async fn ledger(&self, id: i64) -> Option<Arc<TrafficLedger>> {
        let instances = self.instances.read().await;
        instances.get(&id).map(|i| Arc::clone(&i.ledger))
    }

    pub async fn snapshot(&self, id: i64) -> Option<InstanceSnapshot> {
        let instances = self.instances.read().await;
        instances.get(&id).map(ProxyInstance::snapshot)
    }

    /// Snapshots of every instance, ordered by id
    pub async fn snapshots(&self) -> Vec<InstanceSnapshot> {
        let instances = self.instances.read().await;
        let mut all: Vec<_> = instances.values().map(ProxyInstance::snapshot).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Zero an instance's counters; returns the totals before the reset
    pub async fn reset_traffic(&self, id: i64) -> Result<LedgerSnapshot> {
        let instances = self.instances.read().await;
        let instance = instances.get(&id).ok_or_else(|| unknown(id))?;
        Ok(instance.ledger.reset())
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }
}
