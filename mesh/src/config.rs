//! Configuration management for the mesh node.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tandem_engine::MergeStrategy;

use crate::protocol::PeerId;

/// A statically configured peer, written as `id@host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPeer {
    pub id: PeerId,
    pub address: String,
}

impl FromStr for SeedPeer {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('@') {
            Some((id, address)) if !id.is_empty() && address.contains(':') => Ok(Self {
                id: id.to_string(),
                address: address.to_string(),
            }),
            _ => Err(ConfigError::InvalidSeedPeer(s.to_string())),
        }
    }
}

/// Parse a comma-separated `SEED_PEERS` value. Empty entries are skipped.
pub fn parse_seed_peers(value: &str) -> Result<Vec<SeedPeer>, ConfigError> {
    value
        .split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(SeedPeer::from_str)
        .collect()
}

/// Timers driving peer discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// How often our presence is broadcast
    pub presence_interval: Duration,
    /// How often discovery sources are scanned
    pub scan_interval: Duration,
    /// How often connected peers get a heartbeat
    pub heartbeat_interval: Duration,
    /// Silence after which a peer becomes unreachable
    pub stale_after: Duration,
    /// Silence after which a peer is forgotten
    pub evict_after: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            presence_interval: Duration::from_secs(5),
            scan_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(30),
            evict_after: Duration::from_secs(300),
        }
    }
}

/// Sync cycle settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Period of the background `sync_with_all_peers` cycle
    pub interval: Duration,
    /// Upper bound for one per-peer cycle
    pub timeout: Duration,
    /// Policy for conflicts left open by the automatic rules
    pub merge_strategy: MergeStrategy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(20),
            merge_strategy: MergeStrategy::Manual,
        }
    }
}

/// Node configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Stable identifier of this device
    pub node_id: PeerId,
    /// `NODE_ID` was set rather than generated
    pub node_id_configured: bool,
    /// Human-readable name announced to peers
    pub node_name: String,
    /// Mesh TCP listen address
    pub listen_addr: String,
    /// HTTP control surface address
    pub http_addr: String,
    pub seed_peers: Vec<SeedPeer>,
    pub discovery: DiscoveryConfig,
    pub sync: SyncConfig,
    /// Snapshot restored at start and written on shutdown
    pub state_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let configured = env::var("NODE_ID").ok();
        let node_id_configured = configured.is_some();
        let node_id = configured.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let node_name = env::var("NODE_NAME").unwrap_or_else(|_| node_id.clone());

        let listen_addr = env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:7400".to_string());
        let http_addr = env::var("HTTP_ADDR").unwrap_or_else(|_| "127.0.0.1:7401".to_string());

        let seed_peers = match env::var("SEED_PEERS") {
            Ok(value) => parse_seed_peers(&value)?,
            Err(_) => Vec::new(),
        };

        let defaults = DiscoveryConfig::default();
        let discovery = DiscoveryConfig {
            presence_interval: secs("PRESENCE_INTERVAL_SECS", defaults.presence_interval)?,
            scan_interval: secs("SCAN_INTERVAL_SECS", defaults.scan_interval)?,
            heartbeat_interval: secs("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            stale_after: secs("PEER_STALE_SECS", defaults.stale_after)?,
            evict_after: secs("PEER_EVICT_SECS", defaults.evict_after)?,
        };

        let defaults = SyncConfig::default();
        let merge_strategy = match env::var("MERGE_STRATEGY") {
            Ok(value) => value
                .parse()
                .map_err(|_| ConfigError::InvalidMergeStrategy(value))?,
            Err(_) => defaults.merge_strategy,
        };
        let sync = SyncConfig {
            interval: secs("SYNC_INTERVAL_SECS", defaults.interval)?,
            timeout: secs("SYNC_TIMEOUT_SECS", defaults.timeout)?,
            merge_strategy,
        };

        let state_file = env::var("STATE_FILE").ok().map(PathBuf::from);

        Ok(Self {
            node_id,
            node_id_configured,
            node_name,
            listen_addr,
            http_addr,
            seed_peers,
            discovery,
            sync,
            state_file,
        })
    }
}

impl Config {
    /// Take the device id of a restored snapshot.
    ///
    /// A generated id yields to the stored one so local edits, resolutions
    /// and the announced identity keep using a single device id. An explicit
    /// `NODE_ID` that disagrees with the snapshot is refused.
    pub fn restore_identity(&mut self, stored: &str) -> Result<(), ConfigError> {
        if self.node_id == stored {
            return Ok(());
        }
        if self.node_id_configured {
            return Err(ConfigError::NodeIdMismatch {
                configured: self.node_id.clone(),
                stored: stored.to_string(),
            });
        }
        if self.node_name == self.node_id {
            self.node_name = stored.to_string();
        }
        self.node_id = stored.to_string();
        Ok(())
    }
}

fn secs(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidNumber(var)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be a whole number of seconds")]
    InvalidNumber(&'static str),

    #[error("Invalid seed peer '{0}', expected id@host:port")]
    InvalidSeedPeer(String),

    #[error("Invalid MERGE_STRATEGY '{0}'")]
    InvalidMergeStrategy(String),

    #[error("NODE_ID '{configured}' does not match the stored replica '{stored}'")]
    NodeIdMismatch { configured: String, stored: String },
}
