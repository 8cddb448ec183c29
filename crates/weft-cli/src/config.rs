//! Configuration file for the `weft` binary.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use weft_core::{MAX_MESSAGE_SIZE, PIECE_CHUNK_HEADER_SIZE};
use weft_files::{ChunkOptions, FIXED_PIECE_SIZE, PieceDigest, PieceSizePolicy, ReassemblyLimits};
use weft_mesh::{BootstrapConfig, HubConfig, NodeConfig};

/// WEFT configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Hub configuration
    #[serde(default)]
    pub hub: HubSection,
    /// Bootstrap configuration
    #[serde(default)]
    pub bootstrap: BootstrapSection,
    /// Node timing
    #[serde(default)]
    pub node: NodeSection,
    /// Chunking and reassembly
    #[serde(default)]
    pub transfer: TransferSection,
    /// WebRTC configuration
    #[serde(default)]
    pub rtc: RtcSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// WebSocket listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Idle registrations are evicted after this many seconds
    #[serde(default = "default_signaling_secs")]
    pub registration_timeout_secs: u64,
    /// Registration sweep period in seconds
    #[serde(default = "default_registration_sweep_secs")]
    pub registration_sweep_secs: u64,
}

/// Bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapSection {
    /// Hub WebSocket URL
    #[serde(default = "default_hub_url")]
    pub hub_url: String,
    /// Attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed retry delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Retry delay added per attempt in milliseconds
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,
    /// Seconds to wait for the hub to reach us
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Node timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Seconds a signaling peer has to finish its handshake
    #[serde(default = "default_signaling_secs")]
    pub handshake_timeout_secs: u64,
    /// Seconds between worker load reports
    #[serde(default = "default_load_report_secs")]
    pub load_report_interval_secs: u64,
}

/// Chunking and reassembly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    /// Piece size in bytes when not graduated
    #[serde(default = "default_piece_size")]
    pub piece_size: u32,
    /// Pick the piece size from the file size
    #[serde(default)]
    pub graduated: bool,
    /// Piece digest: "sha256" or "blake3"
    #[serde(default)]
    pub digest: PieceDigest,
    /// Also record SHA-1 piece hashes
    #[serde(default)]
    pub legacy_digest: bool,
    /// Payload bytes per piece frame
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    /// Content directory for workers
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    /// Bytes one incoming transfer may buffer, in MiB
    #[serde(default = "default_max_buffered_mib")]
    pub max_buffered_mib: u64,
    /// Seconds an incoming transfer may stall
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcSection {
    /// STUN and TURN server URLs
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    "0.0.0.0:8421".to_string()
}

fn default_signaling_secs() -> u64 {
    10
}

fn default_registration_sweep_secs() -> u64 {
    10
}

fn default_hub_url() -> String {
    "ws://127.0.0.1:8421".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_step_ms() -> u64 {
    2000
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_load_report_secs() -> u64 {
    5
}

fn default_piece_size() -> u32 {
    FIXED_PIECE_SIZE
}

fn default_frame_size() -> usize {
    weft_files::DEFAULT_FRAME_SIZE
}

fn default_store_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("weft/store")
}

fn default_max_buffered_mib() -> u64 {
    512
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            registration_timeout_secs: default_signaling_secs(),
            registration_sweep_secs: default_registration_sweep_secs(),
        }
    }
}

impl Default for BootstrapSection {
    fn default() -> Self {
        Self {
            hub_url: default_hub_url(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_step_ms: default_backoff_step_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_signaling_secs(),
            load_report_interval_secs: default_load_report_secs(),
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            piece_size: default_piece_size(),
            graduated: false,
            digest: PieceDigest::default(),
            legacy_digest: false,
            frame_size: default_frame_size(),
            store_dir: default_store_dir(),
            max_buffered_mib: default_max_buffered_mib(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for RtcSection {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("weft/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse the hub listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.hub.listen_addr.parse()?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        let url = &self.bootstrap.hub_url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            anyhow::bail!("Hub URL '{url}' must start with ws:// or wss://");
        }
        if self.bootstrap.max_attempts == 0 {
            anyhow::bail!("Bootstrap needs at least one attempt");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.transfer.piece_size == 0 || self.transfer.piece_size > 64 * 1024 * 1024 {
            anyhow::bail!("Piece size must be between 1 byte and 64MB");
        }
        let max_frame = MAX_MESSAGE_SIZE - 1 - PIECE_CHUNK_HEADER_SIZE;
        if self.transfer.frame_size < 1024 || self.transfer.frame_size > max_frame {
            anyhow::bail!("Frame size must be between 1024 and {max_frame} bytes");
        }
        if self.transfer.max_buffered_mib == 0 {
            anyhow::bail!("Transfer buffer limit must be positive");
        }

        for server in &self.rtc.ice_servers {
            if !(server.starts_with("stun:") || server.starts_with("turn:")) {
                anyhow::bail!("ICE server '{server}' must be a stun: or turn: URL");
            }
        }

        Ok(())
    }

    /// Chunking options for uploads and hashing
    #[must_use]
    pub fn chunk_options(&self) -> ChunkOptions {
        let policy = if self.transfer.graduated {
            PieceSizePolicy::Graduated
        } else {
            PieceSizePolicy::Fixed(self.transfer.piece_size)
        };
        ChunkOptions {
            policy,
            digest: self.transfer.digest,
            legacy: self.transfer.legacy_digest,
        }
    }

    /// Node actor configuration
    #[must_use]
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            handshake_timeout: Duration::from_secs(self.node.handshake_timeout_secs),
            load_report_interval: Duration::from_secs(self.node.load_report_interval_secs),
            frame_size: self.transfer.frame_size,
            chunk: self.chunk_options(),
            reassembly: ReassemblyLimits {
                max_buffered_bytes: self.transfer.max_buffered_mib * 1024 * 1024,
                idle_timeout: Duration::from_secs(self.transfer.idle_timeout_secs),
            },
            ..NodeConfig::default()
        }
    }

    /// Hub configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be parsed.
    pub fn hub_config(&self) -> anyhow::Result<HubConfig> {
        Ok(HubConfig {
            listen_addr: self.parse_listen_addr()?,
            registration_timeout: Duration::from_secs(self.hub.registration_timeout_secs),
            registration_sweep: Duration::from_secs(self.hub.registration_sweep_secs),
        })
    }

    /// Bootstrap configuration for a client or worker
    #[must_use]
    pub fn bootstrap_config(&self, worker: bool) -> BootstrapConfig {
        BootstrapConfig {
            hub_url: self.bootstrap.hub_url.clone(),
            worker,
            max_attempts: self.bootstrap.max_attempts,
            backoff_base: Duration::from_millis(self.bootstrap.backoff_base_ms),
            backoff_step: Duration::from_millis(self.bootstrap.backoff_step_ms),
            connect_timeout: Duration::from_secs(self.bootstrap.connect_timeout_secs),
            ..BootstrapConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.hub.listen_addr, "0.0.0.0:8421");
        assert_eq!(config.bootstrap.max_attempts, 5);
        assert_eq!(config.transfer.piece_size, 5 * 1024 * 1024);
        assert_eq!(config.transfer.digest, PieceDigest::Sha256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.bootstrap.hub_url = "http://hub.example:8421".to_string();
        assert!(config.validate().is_err());

        config.bootstrap.hub_url = "wss://hub.example".to_string();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        config.transfer.piece_size = 0;
        assert!(config.validate().is_err());

        config.transfer.piece_size = 1024 * 1024;
        config.rtc.ice_servers = vec!["stun.example:3478".to_string()];
        assert!(config.validate().is_err());

        config.rtc.ice_servers.clear();
        // a full 64 KiB payload plus its header overflows one message
        config.transfer.frame_size = 64 * 1024;
        assert!(config.validate().is_err());

        config.transfer.frame_size = MAX_MESSAGE_SIZE - 1 - PIECE_CHUNK_HEADER_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [bootstrap]
            hub_url = "ws://10.0.0.2:9000"

            [transfer]
            graduated = true
            digest = "blake3"
            "#,
        )
        .unwrap();
        assert_eq!(config.bootstrap.hub_url, "ws://10.0.0.2:9000");
        assert_eq!(config.bootstrap.max_attempts, 5);
        assert_eq!(config.hub.listen_addr, "0.0.0.0:8421");

        let chunk = config.chunk_options();
        assert_eq!(chunk.policy, PieceSizePolicy::Graduated);
        assert_eq!(chunk.digest, PieceDigest::Blake3);
        assert!(!chunk.legacy);
    }

    #[test]
    fn test_runtime_configs() {
        let mut config = Config::default();
        config.hub.listen_addr = "127.0.0.1:0".to_string();
        config.transfer.max_buffered_mib = 8;

        let hub = config.hub_config().unwrap();
        assert_eq!(hub.listen_addr.port(), 0);
        assert_eq!(hub.registration_timeout, Duration::from_secs(10));

        let node = config.node_config();
        assert_eq!(node.reassembly.max_buffered_bytes, 8 * 1024 * 1024);
        assert_eq!(node.reassembly.idle_timeout, Duration::from_secs(120));

        let bootstrap = config.bootstrap_config(true);
        assert!(bootstrap.worker);
        assert_eq!(bootstrap.backoff(1), Duration::from_millis(3000));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.transfer.legacy_digest = true;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.transfer.legacy_digest);
        assert_eq!(loaded.hub.listen_addr, config.hub.listen_addr);
        assert_eq!(loaded.rtc.ice_servers, config.rtc.ice_servers);
    }
}
