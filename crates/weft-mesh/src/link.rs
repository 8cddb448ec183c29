//! Peer link abstraction.
//!
//! A link is one data channel to one remote peer, driven by its own task.
//! The node talks to it through two queues: an unbounded control queue for
//! signaling and small protocol messages, so the node never waits on a link,
//! and a bounded data queue that upload tasks push `PieceChunk` frames into.
//! The link reports back through a [`LinkSink`] tagged with the peer id and a
//! per-link serial, which lets the node ignore events from links it already
//! replaced.

use bytes::Bytes;
use tokio::sync::mpsc;
use weft_core::{PeerId, SignalData};

use crate::error::Result;

/// Something a link reports to its node
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Local signaling data to deliver to the remote peer
    Signal(SignalData),
    /// Data channel is open
    Open,
    /// Binary message from the remote peer
    Message(Bytes),
    /// Link is gone
    Closed,
}

/// Something the node asks of a link
#[derive(Debug, Clone)]
pub enum LinkCommand {
    /// Apply signaling data from the remote peer
    Remote(SignalData),
    /// Send a message ahead of queued bulk frames
    Send(Bytes),
    /// Tear the link down
    Close,
}

/// Event tagged with its link
#[derive(Debug, Clone)]
pub struct LinkReport {
    /// Remote peer
    pub peer: PeerId,
    /// Link serial assigned by the node
    pub serial: u64,
    /// What happened
    pub event: LinkEvent,
}

/// Where a link sends its events
#[derive(Debug, Clone)]
pub struct LinkSink {
    peer: PeerId,
    serial: u64,
    tx: mpsc::UnboundedSender<LinkReport>,
}

impl LinkSink {
    /// Create a sink for link `serial` to `peer`
    #[must_use]
    pub fn new(peer: PeerId, serial: u64, tx: mpsc::UnboundedSender<LinkReport>) -> Self {
        Self { peer, serial, tx }
    }

    /// Remote peer
    #[must_use]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Report an event. Returns `false` once the node has stopped.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(LinkReport {
                peer: self.peer,
                serial: self.serial,
                event,
            })
            .is_ok()
    }
}

/// Parameters for opening a link
#[derive(Debug, Clone)]
pub struct LinkRequest {
    /// Local node id
    pub local: PeerId,
    /// Remote peer id
    pub remote: PeerId,
    /// Whether this side creates the offer
    pub initiator: bool,
    /// Bulk frames buffered before senders wait
    pub data_capacity: usize,
    /// Event destination
    pub sink: LinkSink,
}

/// Node-side handle to a link task
#[derive(Debug, Clone)]
pub struct PeerLink {
    control: mpsc::UnboundedSender<LinkCommand>,
    data: mpsc::Sender<Bytes>,
}

/// Receiving ends handed to the link task
#[derive(Debug)]
pub struct LinkQueues {
    /// Control commands
    pub control: mpsc::UnboundedReceiver<LinkCommand>,
    /// Bulk frames
    pub data: mpsc::Receiver<Bytes>,
}

impl PeerLink {
    /// Create a handle and the queues its task drains
    #[must_use]
    pub fn channel(data_capacity: usize) -> (Self, LinkQueues) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(data_capacity.max(1));
        (
            Self {
                control: control_tx,
                data: data_tx,
            },
            LinkQueues {
                control: control_rx,
                data: data_rx,
            },
        )
    }

    /// Apply remote signaling data
    pub fn signal(&self, signal: SignalData) -> bool {
        self.control.send(LinkCommand::Remote(signal)).is_ok()
    }

    /// Queue a message ahead of bulk frames
    pub fn send(&self, msg: Bytes) -> bool {
        self.control.send(LinkCommand::Send(msg)).is_ok()
    }

    /// Sender for bulk frames
    #[must_use]
    pub fn data(&self) -> mpsc::Sender<Bytes> {
        self.data.clone()
    }

    /// Ask the link to close
    pub fn close(&self) {
        let _ = self.control.send(LinkCommand::Close);
    }

    /// Whether the link task is still running
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.control.is_closed()
    }
}

/// Opens links to remote peers
pub trait Connector: Send + Sync + 'static {
    /// Spawn a link task and return its handle.
    ///
    /// An initiator starts producing signals immediately; an answerer waits
    /// for the remote offer through [`PeerLink::signal`].
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be created.
    fn open(&self, request: LinkRequest) -> Result<PeerLink>;
}
