//! Configuration module for the proxy node
//!
//! CLI arguments (with environment variable fallbacks) tune the runtime; the
//! node file named by `--config` carries the notification settings, the
//! admission guard seed lists and the proxy instance descriptors.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::relay::RelayOptions;
use crate::core::{AdmissionGuard, GuardError};
use crate::manager::InstanceDescriptor;
use crate::notify::Settings;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    // Plain seconds
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// CLI arguments for the proxy node
///
/// Supports environment variables with PROXY_NODE_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Multi-protocol proxy node")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Node file with settings, guard lists and instances (.yaml/.yml/.json)
    #[arg(long = "config", env = "PROXY_NODE_CONFIG")]
    pub config: PathBuf,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "PROXY_NODE_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    /// Address every inbound listens on (default: 0.0.0.0)
    #[arg(long, env = "PROXY_NODE_LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Interval for checking instance traffic against the warning threshold
    #[arg(long, env = "PROXY_NODE_TRAFFIC_CHECK_INTERVAL", default_value = "60s", value_parser = parse_duration)]
    pub traffic_check_interval: Duration,

    // ==================== Performance Tuning ====================
    /// Connection idle timeout - disconnect if no data transferred (default: 5m)
    #[arg(long, env = "PROXY_NODE_CONN_IDLE_TIMEOUT", default_value = "5m", value_parser = parse_duration, help_heading = "Performance")]
    pub conn_idle_timeout: Duration,

    /// TCP connect timeout to target server (default: 5s)
    #[arg(long, env = "PROXY_NODE_TCP_CONNECT_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub tcp_connect_timeout: Duration,

    /// Timeout for reading the protocol request header (default: 5s)
    #[arg(long, env = "PROXY_NODE_REQUEST_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub request_timeout: Duration,

    /// Buffer size for data transfer in bytes (default: 32KB)
    #[arg(long, env = "PROXY_NODE_BUFFER_SIZE", default_value_t = 32 * 1024, help_heading = "Performance")]
    pub buffer_size: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "PROXY_NODE_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(
        long,
        env = "PROXY_NODE_TCP_NODELAY",
        default_value_t = true,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if !self.config.exists() {
            return Err(anyhow!("Node config file not found: {}", self.config.display()));
        }
        NodeFormat::from_path(&self.config)?;

        if self.listen_host.parse::<IpAddr>().is_err() {
            return Err(anyhow!("Invalid listen host: {}", self.listen_host));
        }

        if self.traffic_check_interval.is_zero() {
            return Err(anyhow!("traffic_check_interval must be greater than 0"));
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("request_timeout must be greater than 0"));
        }
        if self.tcp_connect_timeout.is_zero() {
            return Err(anyhow!("tcp_connect_timeout must be greater than 0"));
        }
        if self.buffer_size < 1024 {
            return Err(anyhow!("buffer_size must be at least 1024 bytes"));
        }

        Ok(())
    }
}

/// Connection performance configuration
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Connection idle timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Request header read timeout
    pub request_timeout: Duration,
    /// Buffer size for data transfer
    pub buffer_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
    /// Host address inbounds bind to
    pub listen_host: String,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            buffer_size: 32 * 1024,
            tcp_backlog: 1024,
            tcp_nodelay: true,
            listen_host: "0.0.0.0".to_string(),
        }
    }
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            idle_timeout: cli.conn_idle_timeout,
            connect_timeout: cli.tcp_connect_timeout,
            request_timeout: cli.request_timeout,
            buffer_size: cli.buffer_size,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
            listen_host: cli.listen_host.clone(),
        }
    }

    /// Loopback-only config, used by tests and local tooling
    pub fn loopback() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            ..Self::default()
        }
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            buffer_size: self.buffer_size,
            idle_timeout: self.idle_timeout,
        }
    }

    /// Socket address an inbound on `port` binds to
    pub fn listen_addr(&self, port: u16) -> Result<SocketAddr, std::net::AddrParseError> {
        let ip: IpAddr = self.listen_host.parse()?;
        Ok(SocketAddr::new(ip, port))
    }
}

/// Seed entry for a rate-limited key
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RateLimitSeed {
    pub key: String,
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_limit() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

/// Admission guard lists loaded at startup
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GuardSeed {
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub rate_limits: Vec<RateLimitSeed>,
}

impl GuardSeed {
    /// Load the lists into `guard`; stops at the first malformed address
    pub fn apply(&self, guard: &AdmissionGuard) -> Result<(), GuardError> {
        for ip in &self.whitelist {
            guard.add_to_whitelist(ip)?;
        }
        for ip in &self.blacklist {
            guard.add_to_blacklist(ip)?;
        }
        for seed in &self.rate_limits {
            guard.set_rate_limit(&seed.key, seed.limit, Duration::from_secs(seed.window_secs));
        }
        Ok(())
    }
}

/// Contents of the node file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeFile {
    pub settings: Settings,
    pub guard: GuardSeed,
    pub instances: Vec<InstanceDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeFormat {
    Yaml,
    Json,
}

impl NodeFormat {
    fn from_path(path: &Path) -> Result<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") {
            Ok(NodeFormat::Yaml)
        } else if ext.eq_ignore_ascii_case("json") {
            Ok(NodeFormat::Json)
        } else {
            Err(anyhow!(
                "Invalid node config file format: expected .yaml, .yml or .json extension"
            ))
        }
    }
}

impl NodeFile {
    /// Read and parse a node file; format follows the extension
    pub fn load(path: &Path) -> Result<Self> {
        let format = NodeFormat::from_path(path)?;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read node config {}", path.display()))?;
        Self::parse(&content, format)
            .with_context(|| format!("Failed to parse node config {}", path.display()))
    }

    fn parse(content: &str, format: NodeFormat) -> Result<Self> {
        let node = match format {
            NodeFormat::Yaml => serde_yaml::from_str(content)?,
            NodeFormat::Json => serde_json::from_str(content)?,
        };
        Ok(node)
    }
}
