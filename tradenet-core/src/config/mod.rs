//! Configuration management for tradenet
//!
//! A node is configured from a TOML file, with `TRADENET_<SECTION>_<KEY>`
//! environment variables applied on top. Every loaded configuration is
//! validated before use.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::core_router::{DelayWindow, PeerGuardConfig, RouterConfig};
use crate::logging::LogLevel;

/// Main node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub store: StoreConfig,
    pub broadcast: BroadcastConfig,
    pub persistence: PersistenceConfig,
    pub statistics: StatisticsConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Node identity and networking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human readable node name, used in logs
    pub node_id: String,

    /// Address to accept peer connections on (none: outbound only)
    pub listen_address: Option<String>,

    /// Peers dialed at startup
    pub bootstrap_peers: Vec<String>,

    /// Upper bound for graceful shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Record store limits and housekeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Inbound records expiring further out than this are invalid
    #[serde(with = "humantime_serde")]
    pub max_ttl: Duration,

    /// How often expired records are swept
    #[serde(with = "humantime_serde")]
    pub expiry_sweep_interval: Duration,

    /// Expired sequence entries older than this are purged
    #[serde(with = "humantime_serde")]
    pub sequence_retention: Duration,
}

/// Gossip and back-pressure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Pending sends per peer before the oldest is dropped
    pub max_in_flight_per_peer: usize,

    pub seen_cache_capacity: usize,

    /// Records per snapshot response envelope
    pub snapshot_chunk: usize,

    /// Undecodable envelopes tolerated from one peer in a burst
    pub decode_error_burst: u32,

    pub decode_error_refill_per_sec: f64,
}

/// Snapshot blobs on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub data_dir: PathBuf,

    #[serde(with = "humantime_serde")]
    pub snapshot_interval: Duration,

    /// Delay between a sequence commit and the sequence map write
    #[serde(with = "humantime_serde")]
    pub sequence_write_delay: Duration,
}

/// Trade statistics republication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub republish_on_start: bool,

    /// Only trades younger than this are republished
    #[serde(with = "humantime_serde")]
    pub republish_window: Duration,

    /// Added delay per republished trade
    #[serde(with = "humantime_serde")]
    pub republish_step: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
    /// Extra `EnvFilter` directives
    pub directives: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Describe metrics on startup
    pub enabled: bool,

    /// Serve a Prometheus scrape endpoint here (none: no exporter)
    pub prometheus_address: Option<String>,
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "tradenet-node".to_string(),
            listen_address: None,
            bootstrap_peers: vec![],
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_ttl: 30 * DAY,
            expiry_sweep_interval: Duration::from_secs(60),
            sequence_retention: 10 * DAY,
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            max_in_flight_per_peer: 256,
            seen_cache_capacity: 65_536,
            snapshot_chunk: 1_000,
            decode_error_burst: 20,
            decode_error_refill_per_sec: 0.5,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            snapshot_interval: Duration::from_secs(300),
            sequence_write_delay: Duration::from_secs(1),
        }
    }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            republish_on_start: true,
            republish_window: 10 * DAY,
            republish_step: Duration::from_secs(5),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            with_timestamp: true,
            with_target: true,
            directives: vec![],
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prometheus_address: None,
        }
    }
}

impl BroadcastConfig {
    pub fn delay_window(&self) -> DelayWindow {
        DelayWindow::new(self.min_delay, self.max_delay)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            delay_window: self.delay_window(),
            max_in_flight_per_peer: self.max_in_flight_per_peer,
            seen_cache_capacity: self.seen_cache_capacity,
            snapshot_chunk: self.snapshot_chunk,
            peer_guard: PeerGuardConfig {
                error_burst: self.decode_error_burst,
                refill_per_sec: self.decode_error_refill_per_sec,
            },
        }
    }
}

impl StatisticsConfig {
    /// Window used for batch position `i`: `[step * (i + 1), step * (i + 2)]`
    pub fn delay_window(&self) -> DelayWindow {
        DelayWindow::new(self.republish_step, self.republish_step.saturating_mul(2))
    }
}

impl Config {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// File (or defaults when `path` is None), then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TRADENET_*` overrides read through `lookup`
    ///
    /// Variables follow the pattern TRADENET_<SECTION>_<KEY>, for example
    /// `TRADENET_PERSISTENCE_DATA_DIR=/var/lib/tradenet`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Node
        if let Some(id) = lookup("TRADENET_NODE_ID") {
            self.node.node_id = id;
        }
        if let Some(addr) = lookup("TRADENET_NODE_LISTEN_ADDRESS") {
            self.node.listen_address = Some(addr);
        }
        if let Some(peers) = lookup("TRADENET_NODE_BOOTSTRAP_PEERS") {
            self.node.bootstrap_peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }

        // Store
        if let Some(ttl) = lookup("TRADENET_STORE_MAX_TTL") {
            self.store.max_ttl = parse_duration("TRADENET_STORE_MAX_TTL", &ttl)?;
        }
        if let Some(interval) = lookup("TRADENET_STORE_EXPIRY_SWEEP_INTERVAL") {
            self.store.expiry_sweep_interval =
                parse_duration("TRADENET_STORE_EXPIRY_SWEEP_INTERVAL", &interval)?;
        }

        // Broadcast
        if let Some(delay) = lookup("TRADENET_BROADCAST_MIN_DELAY") {
            self.broadcast.min_delay = parse_duration("TRADENET_BROADCAST_MIN_DELAY", &delay)?;
        }
        if let Some(delay) = lookup("TRADENET_BROADCAST_MAX_DELAY") {
            self.broadcast.max_delay = parse_duration("TRADENET_BROADCAST_MAX_DELAY", &delay)?;
        }
        if let Some(max) = lookup("TRADENET_BROADCAST_MAX_IN_FLIGHT_PER_PEER") {
            self.broadcast.max_in_flight_per_peer = max.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("Invalid max in-flight per peer: {}", e))
            })?;
        }

        // Persistence
        if let Some(dir) = lookup("TRADENET_PERSISTENCE_DATA_DIR") {
            self.persistence.data_dir = PathBuf::from(dir);
        }
        if let Some(interval) = lookup("TRADENET_PERSISTENCE_SNAPSHOT_INTERVAL") {
            self.persistence.snapshot_interval =
                parse_duration("TRADENET_PERSISTENCE_SNAPSHOT_INTERVAL", &interval)?;
        }

        // Logging
        if let Some(level) = lookup("TRADENET_LOG_LEVEL") {
            self.logging.level = level
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid log level: {}", e)))?;
        }
        if let Some(json) = lookup("TRADENET_LOG_JSON") {
            self.logging.json_format = json
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid JSON flag: {}", e)))?;
        }

        // Metrics
        if let Some(enabled) = lookup("TRADENET_METRICS_ENABLED") {
            self.metrics.enabled = enabled
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid metrics flag: {}", e)))?;
        }
        if let Some(addr) = lookup("TRADENET_METRICS_PROMETHEUS_ADDRESS") {
            self.metrics.prometheus_address = Some(addr);
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.node_id.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "node_id must not be empty".to_string(),
            ));
        }

        if self.store.max_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "max_ttl must be greater than 0".to_string(),
            ));
        }
        if self.store.expiry_sweep_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "expiry_sweep_interval must be greater than 0".to_string(),
            ));
        }

        if self.broadcast.min_delay > self.broadcast.max_delay {
            return Err(ConfigError::ValidationFailed(format!(
                "min_delay ({:?}) exceeds max_delay ({:?})",
                self.broadcast.min_delay, self.broadcast.max_delay
            )));
        }
        if self.broadcast.max_in_flight_per_peer == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_in_flight_per_peer must be greater than 0".to_string(),
            ));
        }
        if self.broadcast.seen_cache_capacity == 0 || self.broadcast.snapshot_chunk == 0 {
            return Err(ConfigError::ValidationFailed(
                "seen_cache_capacity and snapshot_chunk must be greater than 0".to_string(),
            ));
        }
        if self.broadcast.decode_error_burst == 0 {
            return Err(ConfigError::ValidationFailed(
                "decode_error_burst must be greater than 0".to_string(),
            ));
        }
        if !self.broadcast.decode_error_refill_per_sec.is_finite()
            || self.broadcast.decode_error_refill_per_sec < 0.0
        {
            return Err(ConfigError::ValidationFailed(
                "decode_error_refill_per_sec must be a non-negative number".to_string(),
            ));
        }

        if self.persistence.snapshot_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "snapshot_interval must be greater than 0".to_string(),
            ));
        }

        if let Some(addr) = &self.metrics.prometheus_address {
            addr.parse::<std::net::SocketAddr>().map_err(|e| {
                ConfigError::ValidationFailed(format!("prometheus_address '{}': {}", addr, e))
            })?;
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(())
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(value)
        .map_err(|e| ConfigError::InvalidValue(format!("{key}: {e}")))
}
