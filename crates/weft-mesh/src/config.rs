//! Mesh configuration

use std::net::SocketAddr;
use std::time::Duration;

use weft_files::{ChunkOptions, DEFAULT_FRAME_SIZE, ReassemblyLimits};

use crate::DEFAULT_SIGNALING_TIMEOUT;

/// Per-node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Time a signaling peer has to complete the Ahoy exchange
    pub handshake_timeout: Duration,

    /// How often handshake and transfer timeouts are checked
    pub sweep_interval: Duration,

    /// How often a worker reports its connection count to the hub
    pub load_report_interval: Duration,

    /// Payload bytes per `PieceChunk` frame
    pub frame_size: usize,

    /// Bulk frames a link buffers before the sender waits
    pub data_queue_depth: usize,

    /// Commands buffered for the node actor
    pub command_capacity: usize,

    /// Summary events buffered per subscriber
    pub event_capacity: usize,

    /// Chunking for uploads and download responses
    pub chunk: ChunkOptions,

    /// Receiver-side session limits
    pub reassembly: ReassemblyLimits,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_SIGNALING_TIMEOUT,
            sweep_interval: Duration::from_secs(1),
            load_report_interval: Duration::from_secs(5),
            frame_size: DEFAULT_FRAME_SIZE,
            data_queue_depth: 64,
            command_capacity: 256,
            event_capacity: 256,
            chunk: ChunkOptions::default(),
            reassembly: ReassemblyLimits::default(),
        }
    }
}

/// Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// WebSocket listen address
    pub listen_addr: SocketAddr,

    /// Queued registrations idle longer than this are evicted
    pub registration_timeout: Duration,

    /// How often the registration queue is swept
    pub registration_sweep: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8421)),
            registration_timeout: DEFAULT_SIGNALING_TIMEOUT,
            registration_sweep: Duration::from_secs(10),
        }
    }
}

/// Client and worker bootstrap configuration
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Hub WebSocket URL
    pub hub_url: String,

    /// Register as a worker
    pub worker: bool,

    /// Attempts before giving up
    pub max_attempts: u32,

    /// Fixed part of the retry delay
    pub backoff_base: Duration,

    /// Added to the retry delay per attempt
    pub backoff_step: Duration,

    /// Time allowed for the hub's register reply
    pub reply_timeout: Duration,

    /// Time allowed from registration to the first Ahoy
    pub connect_timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://127.0.0.1:8421".to_string(),
            worker: false,
            max_attempts: 5,
            backoff_base: Duration::from_millis(1000),
            backoff_step: Duration::from_millis(2000),
            reply_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl BootstrapConfig {
    /// Delay before retry `attempt` (`base + attempt * step`)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base + self.backoff_step * attempt
    }
}
