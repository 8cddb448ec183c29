//! Mesh node actor.
//!
//! One task owns every table a node has: peers still negotiating, connected
//! peers, the handshake deadlines, control channels, the hub registry (on
//! hubs), open receive sessions and outgoing uploads. Everything reaches it
//! as a message: commands from [`NodeHandle`], events from link tasks, and
//! completions from background chunking, streaming and storage tasks. No
//! table is shared, so no handler can observe another half-way through.
//!
//! A peer is in exactly one of `signaling` or `connected`. Closing a peer
//! removes it from both, from the handshake queue, from its control channel
//! and from the hub registry before anything else runs.

mod handle;
mod signaling;
mod transfer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, trace, warn};
use weft_core::{Arg, PeerId, Reason, Role, RootHash, encode};
use weft_files::{ContentStore, Reassembler};

use crate::config::{HubConfig, NodeConfig};
use crate::error::{MeshError, Result};
use crate::hub::HubState;
use crate::link::{Connector, LinkEvent, LinkReport, LinkRequest, LinkSink, PeerLink};
use crate::negotiation::{Negotiation, SignalRoute};
use crate::queue::TimeoutQueue;

pub use handle::{ControlSink, NodeEvent, NodeHandle, NodeSnapshot, RegisterOutcome};
use handle::NodeCommand;
use transfer::{PendingUpload, TaskReport};

struct SignalingPeer {
    negotiation: Negotiation,
    link: PeerLink,
    serial: u64,
    ahoy_sent: bool,
}

struct ConnectedPeer {
    link: PeerLink,
    serial: u64,
    ahoy_sent: bool,
}

/// A hub, worker or client in the mesh
pub struct MeshNode {
    id: PeerId,
    role: Role,
    config: NodeConfig,
    connector: Arc<dyn Connector>,
    store: Arc<dyn ContentStore>,

    signaling: HashMap<PeerId, SignalingPeer>,
    connected: HashMap<PeerId, ConnectedPeer>,
    handshakes: TimeoutQueue<PeerId>,
    controls: HashMap<PeerId, ControlSink>,
    next_serial: u64,

    hub: Option<HubState>,
    hub_sweep: Duration,
    hub_peer: Option<PeerId>,

    reassembler: Reassembler,
    uploads: HashMap<(PeerId, RootHash), PendingUpload>,

    events: broadcast::Sender<NodeEvent>,
    link_tx: mpsc::UnboundedSender<LinkReport>,
    link_rx: mpsc::UnboundedReceiver<LinkReport>,
    task_tx: mpsc::UnboundedSender<TaskReport>,
    task_rx: mpsc::UnboundedReceiver<TaskReport>,
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("signaling", &self.signaling.len())
            .field("connected", &self.connected.len())
            .field("sessions", &self.reassembler.len())
            .finish_non_exhaustive()
    }
}

impl MeshNode {
    /// Create a node with a fresh id.
    ///
    /// A node created with [`Role::Hub`] uses the default [`HubConfig`].
    #[must_use]
    pub fn new(
        role: Role,
        config: NodeConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn ContentStore>,
    ) -> Self {
        let hub = (role == Role::Hub).then(HubConfig::default);
        Self::build(role, config, hub.as_ref(), connector, store)
    }

    /// Create a hub node
    #[must_use]
    pub fn hub(
        config: NodeConfig,
        hub: &HubConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn ContentStore>,
    ) -> Self {
        Self::build(Role::Hub, config, Some(hub), connector, store)
    }

    fn build(
        role: Role,
        config: NodeConfig,
        hub: Option<&HubConfig>,
        connector: Arc<dyn Connector>,
        store: Arc<dyn ContentStore>,
    ) -> Self {
        let id = PeerId::random();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let reassembler = Reassembler::new(config.reassembly);
        Self {
            id,
            role,
            connector,
            store,
            signaling: HashMap::new(),
            connected: HashMap::new(),
            handshakes: TimeoutQueue::new(),
            controls: HashMap::new(),
            next_serial: 0,
            hub: hub.map(|h| HubState::new(id, h.registration_timeout)),
            hub_sweep: hub.map_or(Duration::from_secs(10), |h| h.registration_sweep),
            hub_peer: None,
            reassembler,
            uploads: HashMap::new(),
            events,
            link_tx,
            link_rx,
            task_tx,
            task_rx,
            config,
        }
    }

    /// Node id
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Node role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Start the actor
    pub fn spawn(self) -> (NodeHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.command_capacity.max(1));
        let handle = NodeHandle::new(tx, self.events.clone());
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<NodeCommand>) {
        let tick = |period: Duration| {
            let mut t = interval(period.max(Duration::from_millis(1)));
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        };
        let mut sweep = tick(self.config.sweep_interval);
        let mut hub_sweep = tick(self.hub_sweep);
        let mut load_report = tick(self.config.load_report_interval);
        let is_hub = self.hub.is_some();
        let is_worker = self.role == Role::Worker;

        info!(id = %self.id, role = ?self.role, "mesh node started");

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    None | Some(NodeCommand::Shutdown) => break,
                    Some(cmd) => self.on_command(cmd),
                },
                Some(report) = self.link_rx.recv() => self.on_link(report),
                Some(report) = self.task_rx.recv() => self.on_task(report),
                _ = sweep.tick() => self.sweep(Instant::now()),
                _ = hub_sweep.tick(), if is_hub => self.sweep_registrations(Instant::now()),
                _ = load_report.tick(), if is_worker => self.report_load(),
            }
        }

        for peer in self.signaling.values() {
            peer.link.close();
        }
        for peer in self.connected.values() {
            peer.link.close();
        }
        info!(id = %self.id, "mesh node stopped");
    }

    fn emit(&self, event: NodeEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn on_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Register {
                id,
                worker,
                sink,
                reply,
            } => {
                let outcome = self.register(id, worker, sink);
                let _ = reply.send(outcome);
            }
            NodeCommand::ControlSignal { id, signal } => self.control_signal(id, signal),
            NodeCommand::ControlClosed { id } => self.control_closed(id),
            NodeCommand::DialHub {
                local,
                hub,
                route,
                reply,
            } => {
                let _ = reply.send(self.dial_hub(local, hub, route));
            }
            NodeCommand::HubSignal { signal } => self.hub_signal(signal),
            NodeCommand::Connect { target, via, reply } => {
                let _ = reply.send(self.connect(target, via));
            }
            NodeCommand::Upload { peer, path, reply } => self.start_upload(peer, path, reply),
            NodeCommand::Download { peer, root, reply } => {
                let _ = reply.send(self.start_download(peer, root));
            }
            NodeCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            NodeCommand::Close { peer } => self.close_peer(peer, "closed locally"),
            NodeCommand::Shutdown => {}
        }
    }

    fn snapshot(&self) -> NodeSnapshot {
        let mut signaling: Vec<PeerId> = self.signaling.keys().copied().collect();
        let mut connected: Vec<PeerId> = self.connected.keys().copied().collect();
        signaling.sort();
        connected.sort();
        NodeSnapshot {
            id: self.id,
            role: self.role,
            signaling,
            connected,
            hub_peer: self.hub_peer,
            hub: self.hub.as_ref().map(HubState::snapshot),
            sessions: self.reassembler.len(),
            uploads: self.uploads.len(),
        }
    }

    // ============ Links ============

    fn open_link(
        &mut self,
        peer: PeerId,
        initiator: bool,
        route: SignalRoute,
        now: Instant,
    ) -> Result<()> {
        if peer == self.id {
            return Err(MeshError::invalid_state("cannot link to self"));
        }
        if self.signaling.contains_key(&peer) || self.connected.contains_key(&peer) {
            return Err(MeshError::invalid_state("peer already linked"));
        }

        self.next_serial += 1;
        let serial = self.next_serial;
        let link = self.connector.open(LinkRequest {
            local: self.id,
            remote: peer,
            initiator,
            data_capacity: self.config.data_queue_depth,
            sink: LinkSink::new(peer, serial, self.link_tx.clone()),
        })?;

        let negotiation = if initiator {
            Negotiation::initiator(peer, route, now)
        } else {
            Negotiation::answerer(peer, route, now)
        };
        debug!(peer = %peer.short(), initiator, ?route, "negotiation started");
        self.signaling.insert(
            peer,
            SignalingPeer {
                negotiation,
                link,
                serial,
                ahoy_sent: false,
            },
        );
        self.handshakes.push(peer, now);
        Ok(())
    }

    fn serial_of(&self, peer: &PeerId) -> Option<u64> {
        self.signaling
            .get(peer)
            .map(|p| p.serial)
            .or_else(|| self.connected.get(peer).map(|p| p.serial))
    }

    fn on_link(&mut self, report: LinkReport) {
        let LinkReport {
            peer,
            serial,
            event,
        } = report;
        if self.serial_of(&peer) != Some(serial) {
            trace!(peer = %peer.short(), serial, "event from replaced link ignored");
            return;
        }
        match event {
            LinkEvent::Signal(signal) => self.local_signal(peer, signal),
            LinkEvent::Open => self.link_open(peer),
            LinkEvent::Message(msg) => self.on_message(peer, msg),
            LinkEvent::Closed => self.close_peer(peer, "link closed"),
        }
    }

    /// Our Ahoy goes out once per link, on `Open` or on promotion,
    /// whichever the link reports first.
    fn send_ahoy(link: &PeerLink, sent: &mut bool) {
        if !*sent {
            *sent = link.send(encode(Reason::Ahoy, &[]));
        }
    }

    fn link_open(&mut self, peer: PeerId) {
        if let Some(entry) = self.signaling.get_mut(&peer) {
            entry.negotiation.mark_open();
            Self::send_ahoy(&entry.link, &mut entry.ahoy_sent);
            debug!(peer = %peer.short(), "data channel open, ahoy sent");
        } else if let Some(entry) = self.connected.get_mut(&peer) {
            Self::send_ahoy(&entry.link, &mut entry.ahoy_sent);
            trace!(peer = %peer.short(), "data channel open after remote ahoy");
        }
    }

    /// Ahoy received: the peer leaves `signaling` for `connected`.
    ///
    /// The remote Ahoy can overtake our own `Open` event, so promotion also
    /// sends our Ahoy if it has not gone out yet.
    fn promote(&mut self, peer: PeerId) {
        let Some(mut entry) = self.signaling.remove(&peer) else {
            trace!(peer = %peer.short(), "repeated ahoy ignored");
            return;
        };
        Self::send_ahoy(&entry.link, &mut entry.ahoy_sent);
        self.handshakes.remove(&peer);
        self.controls.remove(&peer);
        self.connected.insert(
            peer,
            ConnectedPeer {
                link: entry.link,
                serial: entry.serial,
                ahoy_sent: entry.ahoy_sent,
            },
        );
        info!(peer = %peer.short(), "peer connected");
        self.emit(NodeEvent::PeerConnected { peer });

        if self.hub.is_some() {
            self.hub_promote(peer);
        }
        if self.hub_peer == Some(peer) {
            info!(hub = %peer.short(), "bootstrap complete");
            self.emit(NodeEvent::BootstrapComplete { hub: peer });
        }
    }

    fn hub_promote(&mut self, peer: PeerId) {
        let Some(hub) = self.hub.as_mut() else {
            return;
        };
        match hub.promote(peer) {
            Some(Role::Worker) => {
                for client in hub.take_unmeshed() {
                    self.enmesh(client);
                }
            }
            Some(Role::Client) => self.enmesh(peer),
            _ => debug!(peer = %peer.short(), "connected peer was not registered"),
        }
    }

    fn enmesh(&mut self, client: PeerId) {
        let Some(worker) = self.hub.as_mut().and_then(|h| h.enmesh(client)) else {
            return;
        };
        let msg = encode(Reason::ConnectionInitiation, &[Arg::Bytes(client.as_bytes())]);
        if !self.send_to(&worker, msg) {
            warn!(worker = %worker.short(), "connection initiation not delivered");
        }
    }

    fn send_to(&self, peer: &PeerId, msg: Bytes) -> bool {
        match self.connected.get(peer) {
            Some(entry) => entry.link.send(msg),
            None => false,
        }
    }

    /// Remove `peer` from every table. Safe to call more than once.
    fn close_peer(&mut self, peer: PeerId, why: &'static str) {
        let mut known = false;
        if let Some(mut entry) = self.signaling.remove(&peer) {
            entry.negotiation.close();
            entry.link.close();
            known = true;
        }
        if let Some(entry) = self.connected.remove(&peer) {
            entry.link.close();
            known = true;
        }
        self.handshakes.remove(&peer);
        self.controls.remove(&peer);
        if let Some(hub) = self.hub.as_mut() {
            hub.remove(&peer);
        }
        self.uploads.retain(|(p, _), _| *p != peer);

        if known {
            info!(peer = %peer.short(), reason = why, "peer closed");
            self.emit(NodeEvent::PeerClosed { peer });
        }
    }

    // ============ Timers ============

    fn sweep(&mut self, now: Instant) {
        for peer in self
            .handshakes
            .expire(now, self.config.handshake_timeout)
        {
            warn!(peer = %peer.short(), "handshake timed out");
            self.close_peer(peer, "handshake timeout");
        }
        for (root, err) in self.reassembler.expire(now) {
            warn!(root = %hex::encode(root), error = %err, "transfer expired");
            self.emit(NodeEvent::TransferFailed {
                root,
                reason: err.to_string(),
            });
        }
    }

    fn sweep_registrations(&mut self, now: Instant) {
        let Some(hub) = self.hub.as_mut() else {
            return;
        };
        for id in hub.sweep(now) {
            // dropping the sink closes the control connection
            self.controls.remove(&id);
            self.close_peer(id, "registration expired");
        }
    }

    fn report_load(&self) {
        let Some(hub) = self.hub_peer else {
            return;
        };
        if !self.connected.contains_key(&hub) {
            return;
        }
        let count = (self.connected.len() - 1) as u64;
        trace!(count, "reporting load");
        self.send_to(
            &hub,
            encode(Reason::ConnectionCountCheck, &[Arg::Number(count)]),
        );
    }
}
