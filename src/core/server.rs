//! Shared server context
//!
//! The Server struct carries what every inbound needs: the admission guard
//! and the connection tuning.

use std::sync::Arc;

use super::guard::AdmissionGuard;
use crate::config::ConnConfig;

/// Context shared by every inbound of a node
#[derive(Debug)]
pub struct Server {
    /// Admission guard consulted by every accept loop
    pub guard: Arc<AdmissionGuard>,
    /// Connection performance configuration
    pub conn_config: ConnConfig,
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }
}

/// Builder for constructing a Server
#[derive(Default)]
pub struct ServerBuilder {
    guard: Option<Arc<AdmissionGuard>>,
    conn_config: Option<ConnConfig>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set admission guard
    pub fn guard(mut self, guard: Arc<AdmissionGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Set connection configuration
    pub fn conn_config(mut self, config: ConnConfig) -> Self {
        self.conn_config = Some(config);
        self
    }

    /// Build the server; unset parts fall back to a fresh guard and default tuning
    pub fn build(self) -> Server {
        Server {
            guard: self.guard.unwrap_or_default(),
            conn_config: self.conn_config.unwrap_or_default(),
        }
    }
}
