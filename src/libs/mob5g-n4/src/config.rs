//! N4 Configuration
//!
//! YAML configuration for an N4 node. Durations are given in milliseconds.
//!
//! ```yaml
//! node_id: smf-1
//! addr: 0.0.0.0
//! port: 8805
//! xact:
//!   t1_ms: 3000
//!   n1: 3
//! heartbeat:
//!   interval_ms: 10000
//!   miss_threshold: 3
//! store:
//!   backend: memory
//!   ttl_secs: 86400
//! peers:
//!   - node_id: upf-1
//!     addr: 127.0.0.7:8805
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use mob5g_pfcp::types::NodeId;
use mob5g_pfcp::PFCP_UDP_PORT;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Retry timer: `duration` between attempts, `max_count` retransmissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    pub max_count: u32,
    pub duration: Duration,
}

impl TimerConfig {
    pub fn new_millis(max_count: u32, duration_millis: u64) -> Self {
        Self {
            max_count,
            duration: Duration::from_millis(duration_millis),
        }
    }
}

/// Request correlator (transaction) timers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct XactConfig {
    /// Response wait time per attempt
    pub t1_ms: u64,
    /// Retransmissions after the first attempt
    pub n1: u32,
}

impl Default for XactConfig {
    fn default() -> Self {
        Self { t1_ms: 3000, n1: 3 }
    }
}

impl XactConfig {
    pub fn timer(&self) -> TimerConfig {
        TimerConfig::new_millis(self.n1, self.t1_ms)
    }
}

/// Heartbeat supervision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Consecutive missed heartbeats before the association is released
    pub miss_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            miss_threshold: 3,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Keyed store backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Mongo,
}

/// Persistence settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub db_uri: Option<String>,
    /// Record time-to-live; 0 keeps records until deleted
    pub ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            db_uri: None,
            ttl_secs: 24 * 60 * 60,
        }
    }
}

impl StoreConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

/// A PFCP peer to associate with at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub addr: SocketAddr,
}

/// N4 HTTP API settings (control plane only)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApiConfig {
    pub addr: SocketAddr,
    /// Usage reports are POSTed here as JSON when set
    pub upstream_url: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            upstream_url: None,
        }
    }
}

/// N4 node configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct N4Config {
    pub node_id: NodeId,
    pub addr: IpAddr,
    pub port: u16,
    pub xact: XactConfig,
    pub heartbeat: HeartbeatConfig,
    /// Upper bound for handling one inbound datagram
    pub handler_timeout_ms: u64,
    /// Retry period for association setup towards configured peers
    pub association_interval_ms: u64,
    /// User plane usage report period; 0 disables periodic reports
    pub report_interval_ms: u64,
    /// Fixed recovery time stamp; defaults to process start time
    pub recovery_time_stamp: Option<u32>,
    pub store: StoreConfig,
    pub peers: Vec<PeerConfig>,
    pub api: Option<ApiConfig>,
}

impl Default for N4Config {
    fn default() -> Self {
        Self {
            node_id: NodeId::new("mob5g"),
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: PFCP_UDP_PORT,
            xact: XactConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            handler_timeout_ms: 5000,
            association_interval_ms: 3000,
            report_interval_ms: 0,
            recovery_time_stamp: None,
            store: StoreConfig::default(),
            peers: Vec::new(),
            api: None,
        }
    }
}

impl N4Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.as_str().is_empty() {
            return Err(ConfigError::Validation("`node_id` must not be empty".to_string()));
        }
        if self.xact.t1_ms == 0 {
            return Err(ConfigError::Validation("`xact.t1_ms` must be positive".to_string()));
        }
        if self.heartbeat.enabled && (self.heartbeat.interval_ms == 0 || self.heartbeat.miss_threshold == 0) {
            return Err(ConfigError::Validation(
                "`heartbeat.interval_ms` and `heartbeat.miss_threshold` must be positive".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Mongo && self.store.db_uri.is_none() {
            return Err(ConfigError::Validation("mongo store requires `store.db_uri`".to_string()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn association_interval(&self) -> Duration {
        Duration::from_millis(self.association_interval_ms)
    }

    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_ms > 0).then(|| Duration::from_millis(self.report_interval_ms))
    }
}
