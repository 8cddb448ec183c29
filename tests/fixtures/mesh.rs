//! In-process mesh fixture with a real WebSocket hub
//!
//! The hub's control server listens on a loopback port and every member
//! bootstraps through it exactly as a deployed node would. Peer links use
//! the in-process connector, so no STUN or network interfaces are needed.
//!
//! # Example
//!
//! ```no_run
//! use weft_core::Role;
//! use weft_integration_tests::fixtures::MeshFixture;
//!
//! # async fn demo() {
//! let mesh = MeshFixture::start().await.unwrap();
//! let worker = mesh.join(Role::Worker).await.unwrap();
//! let client = mesh.join(Role::Client).await.unwrap();
//! // ... exercise the mesh ...
//! mesh.shutdown().await;
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use weft_core::{PeerId, Role};
use weft_files::{ChunkOptions, MemoryStore, PieceSizePolicy};
use weft_mesh::{
    BootstrapConfig, HubConfig, HubServer, MemoryConnector, MeshError, MeshNode, NodeConfig,
    NodeEvent, NodeHandle, bootstrap,
};

use crate::test_helpers::wait_for;

/// Hub plus the connector its members share
pub struct MeshFixture {
    /// Hub node handle
    pub hub: NodeHandle,
    /// Hub peer id
    pub hub_id: PeerId,
    /// Control server URL
    pub url: String,
    connector: MemoryConnector,
    members: std::sync::Mutex<Vec<NodeHandle>>,
}

/// One bootstrapped client or worker
pub struct Member {
    /// Node handle
    pub handle: NodeHandle,
    /// Events subscribed before bootstrap
    pub events: broadcast::Receiver<NodeEvent>,
    /// Content the node has imported
    pub store: Arc<MemoryStore>,
    /// Peer id, reassigned by bootstrap
    pub id: PeerId,
    /// Role the node registered with
    pub role: Role,
}

impl MeshFixture {
    /// Node settings tuned for quick tests
    pub fn node_config() -> NodeConfig {
        NodeConfig {
            sweep_interval: Duration::from_millis(50),
            load_report_interval: Duration::from_millis(50),
            frame_size: 4096,
            chunk: ChunkOptions {
                policy: PieceSizePolicy::Fixed(16 * 1024),
                ..ChunkOptions::default()
            },
            ..NodeConfig::default()
        }
    }

    /// Bootstrap settings pointing at `url`
    pub fn bootstrap_config(url: &str, worker: bool) -> BootstrapConfig {
        BootstrapConfig {
            hub_url: url.to_string(),
            worker,
            max_attempts: 3,
            backoff_base: Duration::from_millis(50),
            backoff_step: Duration::from_millis(50),
            reply_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Start a hub on a loopback port
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Io` if no loopback port can be bound.
    pub async fn start() -> Result<Self, MeshError> {
        Self::start_on(SocketAddr::from(([127, 0, 0, 1], 0)), MemoryConnector::new()).await
    }

    /// Start a hub on `addr` whose links go through `connector`
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Io` if `addr` cannot be bound.
    pub async fn start_on(addr: SocketAddr, connector: MemoryConnector) -> Result<Self, MeshError> {
        let hub_config = HubConfig {
            listen_addr: addr,
            ..HubConfig::default()
        };
        let node = MeshNode::hub(
            Self::node_config(),
            &hub_config,
            Arc::new(connector.clone()),
            Arc::new(MemoryStore::new()),
        );
        let hub_id = node.id();
        let (hub, _) = node.spawn();
        let server = HubServer::bind(&hub_config, hub.clone()).await?;
        let url = format!("ws://{}", server.local_addr()?);
        tokio::spawn(server.run());
        Ok(Self {
            hub,
            hub_id,
            url,
            connector,
            members: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Spawn a node of `role` without joining the mesh
    pub fn spawn(&self, role: Role) -> Member {
        let store = Arc::new(MemoryStore::new());
        let node = MeshNode::new(
            role,
            Self::node_config(),
            Arc::new(self.connector.clone()),
            store.clone(),
        );
        let id = node.id();
        let (handle, _) = node.spawn();
        let events = handle.subscribe();
        if let Ok(mut members) = self.members.lock() {
            members.push(handle.clone());
        }
        Member {
            handle,
            events,
            store,
            id,
            role,
        }
    }

    /// Spawn a node and bootstrap it through the hub.
    ///
    /// Returns once both ends have promoted the hub link.
    ///
    /// # Errors
    ///
    /// Returns the bootstrap error, or `MeshError::Timeout` if the hub never
    /// reports the member as connected.
    pub async fn join(&self, role: Role) -> Result<Member, MeshError> {
        let mut hub_events = self.hub.subscribe();
        let mut member = self.spawn(role);
        let config = Self::bootstrap_config(&self.url, role == Role::Worker);
        bootstrap(&config, &member.handle).await?;
        let id = member.handle.snapshot().await?.id;
        member.id = id;
        wait_for(&mut hub_events, |e| {
            matches!(e, NodeEvent::PeerConnected { peer } if *peer == id).then_some(())
        })
        .await
        .ok_or_else(|| MeshError::timeout("hub promotion"))?;
        Ok(member)
    }

    /// Stop the hub and every spawned member
    pub async fn shutdown(self) {
        let members = self.members.lock().map(|m| m.clone()).unwrap_or_default();
        for member in members {
            let _ = member.shutdown().await;
        }
        let _ = self.hub.shutdown().await;
    }
}
