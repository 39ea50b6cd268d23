//! Node configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Only `server_id` is required — every other field has a default suitable
//! for a flat-LAN deployment.
//!
//! ```toml
//! server_id = "S1"
//!
//! [network]
//! udp_port = 9999
//! tcp_port = 9998
//! peer_ports = [65432, 65433, 65434, 65435, 9999]
//!
//! [heartbeat]
//! interval_secs = 10
//! timeout_secs = 30
//!
//! [mesh]
//! dial_backoff_min_ms = 500
//! dial_backoff_max_ms = 2000
//! connect_timeout_secs = 10
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identifier of this node within the federation.
    pub server_id: String,
    pub network: NetworkConfig,
    pub heartbeat: HeartbeatConfig,
    pub mesh: MeshConfig,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Local UDP port for discovery.
    pub udp_port: u16,
    /// Local TCP port for both client and peer sessions.
    pub tcp_port: u16,
    /// UDP ports probed at discovery time (LAN bootstrap set).
    pub peer_ports: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Random delay range before an outbound dial, to de-synchronize
    /// mutual dial attempts.
    pub dial_backoff_min: Duration,
    pub dial_backoff_max: Duration,
    pub connect_timeout: Duration,
}

impl NodeConfig {
    /// A config with every default and the given server id.  Used by tests
    /// and by embedding callers that configure programmatically.
    pub fn with_server_id(server_id: impl Into<String>) -> Self {
        NodeConfig {
            server_id: server_id.into(),
            network: NetworkConfig {
                udp_port: 9999,
                tcp_port: 9998,
                peer_ports: default_peer_ports(),
            },
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(30),
            },
            mesh: MeshConfig {
                dial_backoff_min: Duration::from_millis(500),
                dial_backoff_max: Duration::from_millis(2000),
                connect_timeout: Duration::from_secs(10),
            },
        }
    }
}

/// The bootstrap probe set used when the config does not list peer ports.
pub fn default_peer_ports() -> Vec<u16> {
    vec![65432, 65433, 65434, 65435, 9999]
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    server_id: Option<String>,
    network: Option<RawNetworkConfig>,
    heartbeat: Option<RawHeartbeatConfig>,
    mesh: Option<RawMeshConfig>,
}

#[derive(Debug, Deserialize)]
struct RawNetworkConfig {
    udp_port: Option<u16>,
    tcp_port: Option<u16>,
    peer_ports: Option<Vec<u16>>,
}

#[derive(Debug, Deserialize)]
struct RawHeartbeatConfig {
    interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawMeshConfig {
    dial_backoff_min_ms: Option<u64>,
    dial_backoff_max_ms: Option<u64>,
    connect_timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load node config from a file path.
pub fn load_config_from_path(path: &Path) -> Result<NodeConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load node config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<NodeConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let server_id = raw
        .server_id
        .ok_or_else(|| ConfigError::MissingField("server_id".to_owned()))?;
    if server_id.is_empty() {
        return Err(ConfigError::InvalidValue("server_id must not be empty".to_owned()));
    }

    let network = match raw.network {
        Some(n) => NetworkConfig {
            udp_port: n.udp_port.unwrap_or(9999),
            tcp_port: n.tcp_port.unwrap_or(9998),
            peer_ports: n.peer_ports.unwrap_or_else(default_peer_ports),
        },
        None => NetworkConfig {
            udp_port: 9999,
            tcp_port: 9998,
            peer_ports: default_peer_ports(),
        },
    };
    if network.peer_ports.is_empty() {
        return Err(ConfigError::InvalidValue(
            "network.peer_ports must not be empty".to_owned(),
        ));
    }

    let heartbeat = match raw.heartbeat {
        Some(h) => HeartbeatConfig {
            interval: Duration::from_secs(h.interval_secs.unwrap_or(10)),
            timeout: Duration::from_secs(h.timeout_secs.unwrap_or(30)),
        },
        None => HeartbeatConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        },
    };
    if heartbeat.timeout <= heartbeat.interval {
        return Err(ConfigError::InvalidValue(format!(
            "heartbeat.timeout_secs ({}) must exceed interval_secs ({})",
            heartbeat.timeout.as_secs(),
            heartbeat.interval.as_secs()
        )));
    }

    let mesh = match raw.mesh {
        Some(m) => MeshConfig {
            dial_backoff_min: Duration::from_millis(m.dial_backoff_min_ms.unwrap_or(500)),
            dial_backoff_max: Duration::from_millis(m.dial_backoff_max_ms.unwrap_or(2000)),
            connect_timeout: Duration::from_secs(m.connect_timeout_secs.unwrap_or(10)),
        },
        None => MeshConfig {
            dial_backoff_min: Duration::from_millis(500),
            dial_backoff_max: Duration::from_millis(2000),
            connect_timeout: Duration::from_secs(10),
        },
    };
    if mesh.dial_backoff_min > mesh.dial_backoff_max {
        return Err(ConfigError::InvalidValue(format!(
            "mesh.dial_backoff_min_ms ({}) must not exceed dial_backoff_max_ms ({})",
            mesh.dial_backoff_min.as_millis(),
            mesh.dial_backoff_max.as_millis()
        )));
    }

    Ok(NodeConfig {
        server_id,
        network,
        heartbeat,
        mesh,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
