//! Registration, negotiation routing and relay.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};
use weft_core::codec::decode_number;
use weft_core::{Arg, PeerId, Reason, RelayEnvelope, Role, SignalData, decode, encode};

use super::{ControlSink, MeshNode, RegisterOutcome};
use crate::error::{MeshError, Result};
use crate::negotiation::SignalRoute;

impl MeshNode {
    // ============ Control channel ============

    pub(super) fn register(
        &mut self,
        id: Option<PeerId>,
        worker: bool,
        sink: ControlSink,
    ) -> RegisterOutcome {
        let linked = id.is_some_and(|id| {
            self.signaling.contains_key(&id) || self.connected.contains_key(&id)
        });
        let Some(hub) = self.hub.as_mut() else {
            warn!("register request on a node that is not a hub");
            return RegisterOutcome {
                hub: self.id,
                accepted: false,
            };
        };
        let accepted = match id {
            Some(id) if !linked => hub.register(id, Role::from_worker_flag(worker), Instant::now()),
            _ => false,
        };
        if let (Some(id), true) = (id, accepted) {
            self.controls.insert(id, sink);
        }
        RegisterOutcome {
            hub: hub.id(),
            accepted,
        }
    }

    pub(super) fn control_signal(&mut self, id: PeerId, signal: SignalData) {
        let now = Instant::now();
        let Some(hub) = self.hub.as_mut() else {
            return;
        };
        if !hub.touch(id, now) {
            debug!(peer = %id.short(), "control signal from unregistered id dropped");
            return;
        }
        self.handshakes.touch(id, now);
        if let Err(e) = self.deliver_remote_signal(id, signal, SignalRoute::Control, now) {
            warn!(peer = %id.short(), error = %e, "control signal rejected");
        }
    }

    pub(super) fn control_closed(&mut self, id: PeerId) {
        if self.controls.remove(&id).is_none() {
            return;
        }
        let queued = self.hub.as_ref().is_some_and(|h| h.is_queued(&id));
        if queued {
            debug!(peer = %id.short(), "control channel closed before first link");
            self.close_peer(id, "control channel closed");
        }
    }

    pub(super) fn dial_hub(&mut self, local: PeerId, hub: PeerId, route: ControlSink) -> Result<()> {
        if self.hub.is_some() {
            return Err(MeshError::invalid_state("hub nodes do not dial hubs"));
        }
        if !self.signaling.is_empty() || !self.connected.is_empty() {
            return Err(MeshError::invalid_state("node already has peers"));
        }
        self.id = local;
        self.hub_peer = Some(hub);
        self.controls.insert(hub, route);
        if let Err(e) = self.open_link(hub, true, SignalRoute::Control, Instant::now()) {
            self.controls.remove(&hub);
            self.hub_peer = None;
            return Err(e);
        }
        info!(id = %local, hub = %hub.short(), "dialing hub");
        Ok(())
    }

    pub(super) fn hub_signal(&mut self, signal: SignalData) {
        let Some(hub) = self.hub_peer else {
            debug!("hub signal with no hub dialed");
            return;
        };
        if let Err(e) = self.deliver_remote_signal(hub, signal, SignalRoute::Control, Instant::now())
        {
            warn!(hub = %hub.short(), error = %e, "hub signal rejected");
        }
    }

    pub(super) fn connect(&mut self, target: PeerId, via: PeerId) -> Result<()> {
        if !self.connected.contains_key(&via) {
            return Err(MeshError::PeerNotFound(via));
        }
        self.open_link(target, true, SignalRoute::Relay(via), Instant::now())
    }

    // ============ Negotiation ============

    /// Signal produced by our side of a link
    pub(super) fn local_signal(&mut self, peer: PeerId, signal: SignalData) {
        let Some(entry) = self.signaling.get_mut(&peer) else {
            trace!(peer = %peer.short(), "late local signal dropped");
            return;
        };
        let route = entry.negotiation.route();
        for signal in entry.negotiation.outgoing(signal) {
            self.route_signal(peer, route, signal);
        }
    }

    fn route_signal(&self, peer: PeerId, route: SignalRoute, signal: SignalData) {
        match route {
            SignalRoute::Control => match self.controls.get(&peer) {
                Some(sink) if sink.send(signal).is_ok() => {}
                _ => warn!(peer = %peer.short(), "no control channel for signal"),
            },
            SignalRoute::Relay(relay) => {
                let envelope = RelayEnvelope::new(self.id, peer, signal);
                match envelope.to_message(Reason::RelaySignal) {
                    Ok(msg) => {
                        if !self.send_to(&relay, msg) {
                            warn!(relay = %relay.short(), "relay not connected, signal dropped");
                        }
                    }
                    Err(e) => warn!(error = %e, "signal not encodable"),
                }
            }
        }
    }

    /// Signal produced by `sender`'s side of a link
    fn deliver_remote_signal(
        &mut self,
        sender: PeerId,
        signal: SignalData,
        route: SignalRoute,
        now: Instant,
    ) -> Result<()> {
        if self.connected.contains_key(&sender) {
            trace!(peer = %sender.short(), "signal for connected peer ignored");
            return Ok(());
        }
        if let Some(entry) = self.signaling.get(&sender) {
            entry.negotiation.incoming(&signal)?;
            entry.link.signal(signal);
            return Ok(());
        }
        if !matches!(signal, SignalData::Offer { .. }) {
            return Err(MeshError::invalid_state("signal before offer"));
        }
        self.open_link(sender, false, route, now)?;
        if let Some(entry) = self.signaling.get(&sender) {
            entry.link.signal(signal);
        }
        Ok(())
    }

    // ============ Data channel messages ============

    pub(super) fn on_message(&mut self, from: PeerId, msg: Bytes) {
        let reason = match decode(&msg) {
            Ok((reason, _)) => reason,
            Err(e) => {
                warn!(peer = %from.short(), error = %e, "undecodable message dropped");
                return;
            }
        };
        let payload = msg.slice(1..);

        if reason == Reason::Ahoy {
            self.promote(from);
            return;
        }
        if !self.connected.contains_key(&from) {
            warn!(peer = %from.short(), %reason, "message before ahoy dropped");
            return;
        }
        trace!(peer = %from.short(), %reason, len = payload.len(), "message");
        if let Err(e) = self.dispatch(from, reason, payload) {
            warn!(peer = %from.short(), %reason, error = %e, "message dropped");
        }
    }

    fn dispatch(&mut self, from: PeerId, reason: Reason, payload: Bytes) -> Result<()> {
        match reason {
            Reason::Ahoy => Ok(()),
            Reason::ConnectionInitiation => {
                let client = PeerId::from_slice(&payload)?;
                info!(client = %client.short(), via = %from.short(), "initiating to client");
                self.open_link(client, true, SignalRoute::Relay(from), Instant::now())
            }
            Reason::RelaySignal => self.relay(from, &payload),
            Reason::Signal => {
                let envelope = RelayEnvelope::parse(&payload)?;
                if envelope.receiver != self.id {
                    return Err(MeshError::invalid_state("signal addressed to another peer"));
                }
                self.deliver_remote_signal(
                    envelope.sender,
                    envelope.signal,
                    SignalRoute::Relay(from),
                    Instant::now(),
                )
            }
            Reason::ConnectionCountCheck => {
                let count = decode_number(&payload)?;
                match self.hub.as_mut().map(|hub| hub.update_load(from, count)) {
                    Some(true) => {
                        debug!(worker = %from.short(), count, "worker load updated");
                    }
                    _ => debug!(peer = %from.short(), "load report ignored"),
                }
                Ok(())
            }
            Reason::Redirection => {
                let target = PeerId::from_slice(&payload)?;
                info!(peer = %from.short(), target = %target.short(), "redirection received");
                Ok(())
            }
            Reason::Report => {
                let text = String::from_utf8_lossy(&payload);
                info!(peer = %from.short(), report = %text, "report received");
                Ok(())
            }
            Reason::Upload => self.on_upload(from, &payload),
            Reason::UploadResponse => self.on_upload_response(from, &payload),
            Reason::Download => self.on_download(from, &payload),
            Reason::DownloadResponse => self.on_download_response(from, &payload),
            Reason::TorrentInit => self.on_torrent_init(from, &payload),
            Reason::PieceChunk => self.on_piece_chunk(from, payload),
            Reason::PieceAck => self.on_piece_ack(from, &payload),
        }
    }

    /// `RelaySignal` from `from`: forward as `Signal`, or process it if it is for us
    fn relay(&mut self, from: PeerId, payload: &[u8]) -> Result<()> {
        let envelope = RelayEnvelope::parse(payload)?;
        if envelope.sender != from {
            return Err(MeshError::invalid_state("relay sender does not match link"));
        }
        if envelope.receiver == self.id {
            return self.deliver_remote_signal(
                envelope.sender,
                envelope.signal,
                SignalRoute::Relay(from),
                Instant::now(),
            );
        }
        let forwarded = encode(Reason::Signal, &[Arg::Bytes(payload)]);
        if self.send_to(&envelope.receiver, forwarded) {
            trace!(
                sender = %envelope.sender.short(),
                receiver = %envelope.receiver.short(),
                "signal relayed"
            );
            Ok(())
        } else {
            Err(MeshError::PeerNotFound(envelope.receiver))
        }
    }
}
