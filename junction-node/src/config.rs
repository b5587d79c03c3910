use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use junction_net::protocol::{
    BOOTSTRAP_PEER_IDS, DEFAULT_DISCOVERY_INTERVAL, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_REQUEST_TIMEOUT, DELEGATED_ROUTING_ENDPOINT, QUIC_LISTEN_ADDR,
    WEBRTC_DIRECT_LISTEN_ADDR,
};
use junction_net::{Multiaddr, PeerConfig};

use crate::error::NodeError;

/// Name of the file written by `junction init`.
pub const CONFIG_FILE_NAME: &str = "junction.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub files: FilesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub listen_addrs: Vec<String>,
    pub bootstrap_peer_ids: Vec<String>,
    pub routing_endpoint: String,
    /// Resolve relay circuit addresses from the bootstrap peers at startup.
    pub resolve_relays: bool,
    pub max_connections: usize,
    /// Hex-encoded 32-byte seed for a deterministic peer identity.
    #[serde(default)]
    pub keypair_seed: Option<String>,
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_discovery_interval_secs() -> u64 {
    DEFAULT_DISCOVERY_INTERVAL.as_secs()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Where fetched files are written.
    pub download_dir: String,
    /// Fetch every announced file automatically.
    pub auto_fetch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                listen_addrs: vec![
                    WEBRTC_DIRECT_LISTEN_ADDR.to_string(),
                    QUIC_LISTEN_ADDR.to_string(),
                ],
                bootstrap_peer_ids: BOOTSTRAP_PEER_IDS.iter().map(|s| s.to_string()).collect(),
                routing_endpoint: DELEGATED_ROUTING_ENDPOINT.to_string(),
                resolve_relays: true,
                max_connections: DEFAULT_MAX_CONNECTIONS,
                keypair_seed: None,
                discovery_interval_secs: default_discovery_interval_secs(),
                request_timeout_secs: default_request_timeout_secs(),
            },
            files: FilesConfig {
                download_dir: dirs::download_dir()
                    .or_else(dirs::home_dir)
                    .map(|d| d.join("junction").to_string_lossy().into_owned())
                    .unwrap_or_else(|| "./junction-downloads".to_string()),
                auto_fetch: false,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, NodeError> {
        let contents = std::fs::read_to_string(path).map_err(|e| NodeError::ConfigError {
            reason: format!("failed to read config file '{}': {}", path, e),
        })?;
        let config: NodeConfig = toml::from_str(&contents).map_err(|e| NodeError::ConfigError {
            reason: format!("failed to parse config file '{}': {}", path, e),
        })?;
        Ok(config)
    }

    /// Initialize a default configuration file in the given directory.
    pub fn init(dir: &str) -> Result<std::path::PathBuf, NodeError> {
        let dir_path = Path::new(dir);
        if !dir_path.exists() {
            std::fs::create_dir_all(dir_path)?;
        }

        let config = NodeConfig::default();
        let toml_str = toml::to_string_pretty(&config).map_err(|e| NodeError::ConfigError {
            reason: format!("failed to serialize default config: {}", e),
        })?;

        let config_path = dir_path.join(CONFIG_FILE_NAME);
        std::fs::write(&config_path, toml_str)?;

        Ok(config_path)
    }

    /// Translate into the networking layer's configuration.
    pub fn to_peer_config(&self) -> Result<PeerConfig, NodeError> {
        let listen_addrs = self
            .network
            .listen_addrs
            .iter()
            .map(|s| {
                s.parse::<Multiaddr>().map_err(|e| NodeError::ConfigError {
                    reason: format!("invalid listen address '{}': {}", s, e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let keypair_seed = self
            .network
            .keypair_seed
            .as_deref()
            .map(parse_seed)
            .transpose()?;

        Ok(PeerConfig {
            listen_addrs,
            bootstrap_peer_ids: self.network.bootstrap_peer_ids.clone(),
            routing_endpoint: self.network.routing_endpoint.clone(),
            resolve_relays: self.network.resolve_relays,
            max_connections: self.network.max_connections,
            keypair_seed,
            discovery_interval: Duration::from_secs(self.network.discovery_interval_secs.max(1)),
            request_timeout: Duration::from_secs(self.network.request_timeout_secs.max(1)),
            ..PeerConfig::default()
        })
    }
}

/// Decode a hex-encoded 32-byte keypair seed.
pub fn parse_seed(hex_seed: &str) -> Result<[u8; 32], NodeError> {
    let bytes = hex::decode(hex_seed.trim()).map_err(|e| NodeError::ConfigError {
        reason: format!("keypair seed is not valid hex: {}", e),
    })?;
    bytes.try_into().map_err(|b: Vec<u8>| NodeError::ConfigError {
        reason: format!("keypair seed must be 32 bytes, got {}", b.len()),
    })
}
