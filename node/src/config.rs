use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NodeConfigValidationError {
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct NodeConfig {
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

/// Knobs of the sync state machine. None of them carry behavior.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SyncConfig {
    /// Peers to wait for before deciding how to sync
    pub expected_peers: usize,
    #[serde(with = "duration_serde")]
    pub timeout_waiting_peers: Duration,
    #[serde(with = "duration_serde")]
    pub timeout_waiting_request: Duration,
    /// Inactivity after which a peer's status stops counting
    #[serde(with = "duration_serde")]
    pub expiration_time_peer_status: Duration,
    /// Skeleton links consumed in a single attempt
    pub max_skeleton_chunks: usize,
    /// Blocks per chunk, also the skeleton stride
    pub chunk_size: u32,
    pub max_requested_bodies: usize,
    /// Distance in blocks that justifies a forward sync
    pub long_sync_limit: u64,
    /// Percentage of ranked candidates to draw the sync peer from, 0 picks the best
    pub top_best: f64,
    pub snap_sync_enabled: bool,
    pub snapshot_sync_limit: u64,
    pub snap_checkpoint_distance: u64,
    /// Hex node ids of peers trusted to serve snapshots
    pub snap_boot_nodes: Vec<String>,
    pub max_pending_requests: usize,
    pub tick_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            expected_peers: 5,
            timeout_waiting_peers: Duration::from_secs(60),
            timeout_waiting_request: Duration::from_secs(30),
            expiration_time_peer_status: Duration::from_secs(600),
            max_skeleton_chunks: 20,
            chunk_size: 192,
            max_requested_bodies: 20,
            long_sync_limit: 10,
            top_best: 0.0,
            snap_sync_enabled: false,
            snapshot_sync_limit: 10_000,
            snap_checkpoint_distance: 5_000,
            snap_boot_nodes: Vec::new(),
            max_pending_requests: 1024,
            tick_interval_ms: 1000,
        }
    }
}

impl SyncConfig {
    /// Settings that decide on the first peer and give up quickly
    pub fn immediate_for_testing() -> Self {
        Self {
            expected_peers: 1,
            timeout_waiting_peers: Duration::from_secs(1),
            timeout_waiting_request: Duration::from_secs(3),
            expiration_time_peer_status: Duration::from_secs(60),
            max_skeleton_chunks: 5,
            chunk_size: 192,
            max_requested_bodies: 20,
            long_sync_limit: 10,
            top_best: 0.0,
            snap_sync_enabled: false,
            snapshot_sync_limit: 10_000,
            snap_checkpoint_distance: 5_000,
            snap_boot_nodes: Vec::new(),
            max_pending_requests: 1024,
            tick_interval_ms: 10,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<(), NodeConfigValidationError> {
        if self.expected_peers == 0 {
            return Err(NodeConfigValidationError::InvalidValue(
                "sync.expected_peers must be > 0".to_string(),
            ));
        }
        if self.timeout_waiting_request.is_zero() {
            return Err(NodeConfigValidationError::InvalidValue(
                "sync.timeout_waiting_request must be > 0".to_string(),
            ));
        }
        if self.expiration_time_peer_status.is_zero() {
            return Err(NodeConfigValidationError::InvalidValue(
                "sync.expiration_time_peer_status must be > 0".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(NodeConfigValidationError::InvalidValue(
                "sync.chunk_size must be > 0".to_string(),
            ));
        }
        if self.max_skeleton_chunks == 0 {
            return Err(NodeConfigValidationError::InvalidValue(
                "sync.max_skeleton_chunks must be > 0".to_string(),
            ));
        }
        if self.max_requested_bodies == 0 {
            return Err(NodeConfigValidationError::InvalidValue(
                "sync.max_requested_bodies must be > 0".to_string(),
            ));
        }
        if self.max_pending_requests == 0 {
            return Err(NodeConfigValidationError::InvalidValue(
                "sync.max_pending_requests must be > 0".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(NodeConfigValidationError::InvalidValue(
                "sync.tick_interval_ms must be > 0".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.top_best) {
            return Err(NodeConfigValidationError::InvalidValue(
                "sync.top_best must be between 0 and 100".to_string(),
            ));
        }
        for node in &self.snap_boot_nodes {
            if crate::network::PeerId::from_hex(node).is_err() {
                return Err(NodeConfigValidationError::InvalidValue(format!(
                    "sync.snap_boot_nodes entry {} is not a 32-byte hex node id",
                    node
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG
    pub level: String,
    pub with_target: bool,
    pub with_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
            with_thread_ids: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), NodeConfigValidationError> {
        if self.level.trim().is_empty() {
            return Err(NodeConfigValidationError::InvalidValue(
                "logging.level must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl NodeConfig {
    pub const DEFAULT_PATH: &'static str = "chainsync.toml";

    /// Defaults, then an optional TOML file, then `CHAINSYNC_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::builder();
        config = config.add_source(Config::try_from(&Self::default())?);

        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_PATH));
        if path.exists() {
            info!("Loading configuration from: {:?}", path);
            config = config.add_source(File::from(path.as_path()));
        } else {
            warn!("No configuration file at {:?}, using defaults", path);
        }

        config = config.add_source(
            Environment::with_prefix("CHAINSYNC")
                .separator("__")
                .try_parsing(true),
        );

        let config: NodeConfig = config.build()?.try_deserialize()?;
        if let Err(e) = config.validate() {
            return Err(ConfigError::Message(format!("Configuration validation error: {e}")));
        }

        info!(
            "Configuration loaded: expected_peers={} chunk_size={} timeout_waiting_request={}s",
            config.sync.expected_peers,
            config.sync.chunk_size,
            config.sync.timeout_waiting_request.as_secs()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NodeConfigValidationError> {
        self.sync.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn save(&self, path: &Path) -> Result<(), NodeConfigValidationError> {
        let contents = self
            .to_toml()
            .map_err(|e| NodeConfigValidationError::InvalidValue(e.to_string()))?;
        std::fs::write(path, contents)
            .map_err(|e| NodeConfigValidationError::InvalidPath(format!("{}: {}", path.display(), e)))
    }
}
