//! Message-passing surface of the node actor.

use std::path::PathBuf;

use tokio::sync::{broadcast, mpsc, oneshot};
use weft_core::{PeerId, RootHash, Role, SignalData};

use crate::error::{MeshError, Result};
use crate::hub::HubSnapshot;

/// Signals a node routes over a control channel
pub type ControlSink = mpsc::UnboundedSender<SignalData>;

/// Hub's answer to a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// Hub id to put in the reply
    pub hub: PeerId,
    /// Whether the id was accepted
    pub accepted: bool,
}

/// Summary events for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Ahoy exchanged; peer is in the connected table
    PeerConnected {
        /// Remote peer
        peer: PeerId,
    },
    /// Peer removed from every table
    PeerClosed {
        /// Remote peer
        peer: PeerId,
    },
    /// First link to the hub is up
    BootstrapComplete {
        /// Hub id
        hub: PeerId,
    },
    /// Incoming content verified and stored
    ImportComplete {
        /// Content root
        root: RootHash,
        /// File name from the metadata
        name: String,
        /// Bytes stored
        size: u64,
    },
    /// Receiver acknowledged another piece
    UploadProgress {
        /// Receiving peer
        peer: PeerId,
        /// Content root
        root: RootHash,
        /// Pieces acknowledged so far
        acked: u32,
        /// Pieces in the upload
        total: u32,
    },
    /// Receiver already holds the content
    UploadRejected {
        /// Receiving peer
        peer: PeerId,
        /// Content root
        root: RootHash,
    },
    /// Responder does not hold the requested content
    DownloadMissing {
        /// Responding peer
        peer: PeerId,
        /// Requested root
        root: RootHash,
    },
    /// Transfer ended without a stored file
    TransferFailed {
        /// Content root
        root: RootHash,
        /// What went wrong
        reason: String,
    },
}

/// Peer tables at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// Node id
    pub id: PeerId,
    /// Node role
    pub role: Role,
    /// Peers still negotiating
    pub signaling: Vec<PeerId>,
    /// Peers past the Ahoy exchange
    pub connected: Vec<PeerId>,
    /// Hub the node bootstrapped through
    pub hub_peer: Option<PeerId>,
    /// Hub tables, on hubs only
    pub hub: Option<HubSnapshot>,
    /// Open receive sessions
    pub sessions: usize,
    /// Uploads awaiting acknowledgment
    pub uploads: usize,
}

pub(crate) enum NodeCommand {
    Register {
        id: Option<PeerId>,
        worker: bool,
        sink: ControlSink,
        reply: oneshot::Sender<RegisterOutcome>,
    },
    ControlSignal {
        id: PeerId,
        signal: SignalData,
    },
    ControlClosed {
        id: PeerId,
    },
    DialHub {
        local: PeerId,
        hub: PeerId,
        route: ControlSink,
        reply: oneshot::Sender<Result<()>>,
    },
    HubSignal {
        signal: SignalData,
    },
    Connect {
        target: PeerId,
        via: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    Upload {
        peer: PeerId,
        path: PathBuf,
        reply: oneshot::Sender<Result<RootHash>>,
    },
    Download {
        peer: PeerId,
        root: RootHash,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<NodeSnapshot>,
    },
    Close {
        peer: PeerId,
    },
    Shutdown,
}

/// Cloneable handle to a running [`MeshNode`](super::MeshNode)
#[derive(Debug, Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<NodeCommand>,
    events: broadcast::Sender<NodeEvent>,
}

impl std::fmt::Debug for NodeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeCommand::Register { .. } => "Register",
            NodeCommand::ControlSignal { .. } => "ControlSignal",
            NodeCommand::ControlClosed { .. } => "ControlClosed",
            NodeCommand::DialHub { .. } => "DialHub",
            NodeCommand::HubSignal { .. } => "HubSignal",
            NodeCommand::Connect { .. } => "Connect",
            NodeCommand::Upload { .. } => "Upload",
            NodeCommand::Download { .. } => "Download",
            NodeCommand::Snapshot { .. } => "Snapshot",
            NodeCommand::Close { .. } => "Close",
            NodeCommand::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl NodeHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<NodeCommand>,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self { commands, events }
    }

    async fn send(&self, cmd: NodeCommand) -> Result<()> {
        self.commands.send(cmd).await?;
        Ok(())
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> NodeCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        Ok(rx.await?)
    }

    /// Subscribe to summary events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Whether the actor is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Claim `id` on this hub. Signals for the node go to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::NodeStopped`] if the node has exited.
    pub async fn register(
        &self,
        id: Option<PeerId>,
        worker: bool,
        sink: ControlSink,
    ) -> Result<RegisterOutcome> {
        self.request(|reply| NodeCommand::Register {
            id,
            worker,
            sink,
            reply,
        })
        .await
    }

    /// Hand the hub a signal received on `id`'s control channel.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::NodeStopped`] if the node has exited.
    pub async fn control_signal(&self, id: PeerId, signal: SignalData) -> Result<()> {
        self.send(NodeCommand::ControlSignal { id, signal }).await
    }

    /// Report that `id`'s control channel is gone.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::NodeStopped`] if the node has exited.
    pub async fn control_closed(&self, id: PeerId) -> Result<()> {
        self.send(NodeCommand::ControlClosed { id }).await
    }

    /// Adopt `local` as this node's id and start the first link to `hub`,
    /// sending its signals to `route`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::InvalidState`] if the node already has peers.
    pub async fn dial_hub(&self, local: PeerId, hub: PeerId, route: ControlSink) -> Result<()> {
        self.request(|reply| NodeCommand::DialHub {
            local,
            hub,
            route,
            reply,
        })
        .await?
    }

    /// Hand the node a signal the hub sent over the control channel.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::NodeStopped`] if the node has exited.
    pub async fn hub_signal(&self, signal: SignalData) -> Result<()> {
        self.send(NodeCommand::HubSignal { signal }).await
    }

    /// Negotiate a link to `target`, relaying signals through `via`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::PeerNotFound`] if `via` is not connected.
    pub async fn connect(&self, target: PeerId, via: PeerId) -> Result<()> {
        self.request(|reply| NodeCommand::Connect { target, via, reply })
            .await?
    }

    /// Chunk the file at `path` and offer it to `peer`.
    ///
    /// Resolves once the upload intent is sent; progress arrives as events.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::PeerNotFound`] if `peer` is not connected, or the
    /// chunking error.
    pub async fn upload(&self, peer: PeerId, path: impl Into<PathBuf>) -> Result<RootHash> {
        let path = path.into();
        self.request(|reply| NodeCommand::Upload { peer, path, reply })
            .await?
    }

    /// Ask `peer` to send the content named by `root`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::PeerNotFound`] if `peer` is not connected.
    pub async fn download(&self, peer: PeerId, root: RootHash) -> Result<()> {
        self.request(|reply| NodeCommand::Download { peer, root, reply })
            .await?
    }

    /// Current peer tables.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::NodeStopped`] if the node has exited.
    pub async fn snapshot(&self) -> Result<NodeSnapshot> {
        self.request(|reply| NodeCommand::Snapshot { reply }).await
    }

    /// Close the link to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::NodeStopped`] if the node has exited.
    pub async fn close(&self, peer: PeerId) -> Result<()> {
        self.send(NodeCommand::Close { peer }).await
    }

    /// Close every link and stop the actor.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::NodeStopped`] if the node has already exited.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(NodeCommand::Shutdown).await
    }
}

impl From<broadcast::error::RecvError> for MeshError {
    fn from(err: broadcast::error::RecvError) -> Self {
        match err {
            broadcast::error::RecvError::Closed => MeshError::NodeStopped,
            broadcast::error::RecvError::Lagged(n) => {
                MeshError::InvalidState(format!("event receiver lagged by {n}").into())
            }
        }
    }
}
