//! # WEFT Mesh
//!
//! Turns the WEFT wire schema into a running peer mesh.
//!
//! This crate provides:
//! - The hub registry: registration queue with idle eviction, connected
//!   client and worker tables, and least-loaded worker selection
//! - The per-peer negotiation state machine, with early candidates held
//!   back until the first offer or answer has gone out
//! - Peer links behind the [`Connector`] trait: in-process links for tests
//!   and local simulation, WebRTC data channels with the `rtc` feature
//! - The [`MeshNode`] actor that owns every peer table and drives signaling,
//!   relay and piece transfer from a single task
//! - The hub's WebSocket control server and the client bootstrap loop
//!
//! ## Bootstrap and relay
//!
//! ```text
//!  client                    hub                     worker
//!    │── register (ws) ──────▶│                         │
//!    │◀─ register ok ─────────│                         │
//!    │══ offer/candidates ═══▶│  first link signaled    │
//!    │◀═ answer/candidates ═══│  over the control ws    │
//!    │── Ahoy ───────────────▶│── ConnectionInitiation ▶│
//!    │                        │◀─ RelaySignal ──────────│
//!    │◀─ Signal ──────────────│                         │
//!    │── RelaySignal ────────▶│── Signal ──────────────▶│
//!    │◀════════════ direct data channel ═══════════════▶│
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod balancer;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod hub;
pub mod link;
pub mod memory;
pub mod negotiation;
pub mod node;
pub mod queue;
#[cfg(feature = "rtc")]
pub mod rtc;
pub mod server;

pub use balancer::WorkerBalancer;
pub use bootstrap::{bootstrap, pump_control};
pub use config::{BootstrapConfig, HubConfig, NodeConfig};
pub use error::{MeshError, Result};
pub use hub::{HubSnapshot, HubState};
pub use link::{
    Connector, LinkCommand, LinkEvent, LinkQueues, LinkReport, LinkRequest, LinkSink, PeerLink,
};
pub use memory::MemoryConnector;
pub use negotiation::{Negotiation, NegotiationState, SignalRoute};
pub use node::{ControlSink, MeshNode, NodeEvent, NodeHandle, NodeSnapshot, RegisterOutcome};
pub use queue::TimeoutQueue;
#[cfg(feature = "rtc")]
pub use rtc::RtcConnector;
pub use server::HubServer;

/// Handshake and registration deadline used by hubs and nodes (10 s)
pub const DEFAULT_SIGNALING_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
