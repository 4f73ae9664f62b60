//! Configuration file support for ifmgrd
//!
//! Loads and validates ifmgrd configuration from TOML files.
//! Default location: /etc/ifmgrd/ifmgrd.toml

use crate::error::{IfmgrError, Result};
use crate::shell::OVS_VSCTL_CMD;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ifmgrd/ifmgrd.toml";

/// Controller port used when the address carries none
pub const DEFAULT_CONTROLLER_PORT: u16 = 9999;

/// Netlink socket configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetlinkConfig {
    /// Receive buffer for a single datagram, in bytes
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,

    /// Kernel socket receive buffer (SO_RCVBUF), in bytes
    #[serde(default = "default_socket_rcvbuf")]
    pub socket_rcvbuf: usize,
}

/// Controller connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// `host[:port]`; events go to stdout when unset
    #[serde(default)]
    pub address: Option<String>,

    /// Events buffered while the controller is unreachable; newer events
    /// are dropped once full
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

/// Reconciliation timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncConfig {
    /// Forced full resync period in seconds; 0 disables periodic resync
    #[serde(default = "default_resync_interval")]
    pub interval_secs: u64,

    /// Fallback drain period in milliseconds; socket readiness normally
    /// wakes the drain first
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Name allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingConfig {
    /// Reserve names held by Open vSwitch
    #[serde(default = "default_query_ovs")]
    pub query_ovs: bool,

    /// ovs-vsctl binary
    #[serde(default = "default_ovs_vsctl_path")]
    pub ovs_vsctl_path: String,
}

/// Complete ifmgrd configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfmgrConfig {
    #[serde(default)]
    pub netlink: NetlinkConfig,

    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub resync: ResyncConfig,

    #[serde(default)]
    pub naming: NamingConfig,
}

fn default_recv_buffer_size() -> usize {
    65536
}

fn default_socket_rcvbuf() -> usize {
    3 * 1024 * 1024
}

fn default_queue_depth() -> usize {
    1024
}

fn default_resync_interval() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_query_ovs() -> bool {
    true
}

fn default_ovs_vsctl_path() -> String {
    OVS_VSCTL_CMD.to_string()
}

impl Default for NetlinkConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: default_recv_buffer_size(),
            socket_rcvbuf: default_socket_rcvbuf(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            address: None,
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_resync_interval(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            query_ovs: default_query_ovs(),
            ovs_vsctl_path: default_ovs_vsctl_path(),
        }
    }
}

impl IfmgrConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let config = toml::from_str(&content).map_err(|e| {
                    IfmgrError::Configuration(format!(
                        "Failed to parse config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(IfmgrError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            IfmgrError::Configuration(format!("Failed to serialize config: {}", e))
        })
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path.as_ref(), self.to_toml()?).map_err(IfmgrError::Io)
    }

    /// Get poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.resync.poll_interval_ms)
    }

    /// Get forced resync interval; None when disabled
    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync.interval_secs > 0).then(|| Duration::from_secs(self.resync.interval_secs))
    }

    /// Controller endpoint as `host:port`, with the default port filled in
    pub fn controller_endpoint(&self) -> Result<Option<String>> {
        self.controller
            .address
            .as_deref()
            .map(parse_endpoint)
            .transpose()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.netlink.recv_buffer_size == 0 {
            return Err(IfmgrError::Configuration(
                "recv_buffer_size must be > 0".to_string(),
            ));
        }

        if self.netlink.socket_rcvbuf == 0 {
            return Err(IfmgrError::Configuration(
                "socket_rcvbuf must be > 0".to_string(),
            ));
        }

        if self.controller.queue_depth == 0 {
            return Err(IfmgrError::Configuration(
                "queue_depth must be > 0".to_string(),
            ));
        }

        if self.resync.poll_interval_ms == 0 {
            return Err(IfmgrError::Configuration(
                "poll_interval_ms must be > 0".to_string(),
            ));
        }

        if self.naming.query_ovs && self.naming.ovs_vsctl_path.trim().is_empty() {
            return Err(IfmgrError::Configuration(
                "ovs_vsctl_path must not be empty".to_string(),
            ));
        }

        self.controller_endpoint()?;

        Ok(())
    }
}

fn parse_endpoint(address: &str) -> Result<String> {
    let address = address.trim();
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr.to_string());
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_CONTROLLER_PORT).to_string());
    }

    let invalid = || IfmgrError::Configuration(format!("Invalid controller address: {}", address));
    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (address, DEFAULT_CONTROLLER_PORT),
    };
    if host.is_empty() || port == 0 || host.contains(char::is_whitespace) {
        return Err(invalid());
    }
    Ok(format!("{}:{}", host, port))
}
