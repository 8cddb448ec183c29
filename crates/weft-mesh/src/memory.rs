//! In-process links.
//!
//! Links opened through the same [`MemoryConnector`] (or its clones) can
//! reach each other. The offer carries a switchboard token; the answerer
//! claims it and both sides swap channel senders. The initiator produces a
//! candidate before its offer, the way trickle ICE often does, so the
//! node's candidate buffering is exercised in every in-process test.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use weft_core::{IceCandidate, PeerId, SignalData};

use crate::error::Result;
use crate::link::{Connector, LinkCommand, LinkEvent, LinkQueues, LinkRequest, LinkSink, PeerLink};

const OFFER_PREFIX: &str = "weft-memory-offer:";
const ANSWER_PREFIX: &str = "weft-memory-answer:";

struct PendingOffer {
    to_initiator: mpsc::Sender<Bytes>,
    reply: oneshot::Sender<mpsc::Sender<Bytes>>,
}

/// Connector for links inside one process
#[derive(Clone)]
pub struct MemoryConnector {
    switchboard: Arc<DashMap<String, PendingOffer>>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnector")
            .field("pending_offers", &self.switchboard.len())
            .finish()
    }
}

impl MemoryConnector {
    /// Create a connector with an empty switchboard
    #[must_use]
    pub fn new() -> Self {
        Self {
            switchboard: Arc::new(DashMap::new()),
        }
    }

    /// Offers not yet claimed by an answerer
    #[must_use]
    pub fn pending_offers(&self) -> usize {
        self.switchboard.len()
    }
}

impl Connector for MemoryConnector {
    fn open(&self, request: LinkRequest) -> Result<PeerLink> {
        let (link, queues) = PeerLink::channel(request.data_capacity);
        let task = MemoryLink::new(request, self.switchboard.clone());
        tokio::spawn(task.run(queues));
        Ok(link)
    }
}

enum Step {
    Continue,
    Stop,
}

struct MemoryLink {
    local: PeerId,
    initiator: bool,
    sink: LinkSink,
    switchboard: Arc<DashMap<String, PendingOffer>>,
    inbound_tx: Option<mpsc::Sender<Bytes>>,
    inbound_rx: mpsc::Receiver<Bytes>,
    outbound: Option<mpsc::Sender<Bytes>>,
    answer_rx: Option<oneshot::Receiver<mpsc::Sender<Bytes>>>,
    token: Option<String>,
    backlog: Vec<Bytes>,
}

impl MemoryLink {
    fn new(request: LinkRequest, switchboard: Arc<DashMap<String, PendingOffer>>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(request.data_capacity.max(1));
        Self {
            local: request.local,
            initiator: request.initiator,
            sink: request.sink,
            switchboard,
            inbound_tx: Some(inbound_tx),
            inbound_rx,
            outbound: None,
            answer_rx: None,
            token: None,
            backlog: Vec::new(),
        }
    }

    fn publish_offer(&mut self) {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let (reply, answer_rx) = oneshot::channel();
        if let Some(to_initiator) = self.inbound_tx.take() {
            self.switchboard.insert(
                token.clone(),
                PendingOffer {
                    to_initiator,
                    reply,
                },
            );
        }
        self.answer_rx = Some(answer_rx);

        self.sink.emit(LinkEvent::Signal(SignalData::Candidate {
            candidate: IceCandidate {
                candidate: format!("candidate:memory {token} {}", self.local),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        }));
        self.sink.emit(LinkEvent::Signal(SignalData::Offer {
            sdp: format!("{OFFER_PREFIX}{token}"),
        }));
        self.token = Some(token);
    }

    async fn run(mut self, mut queues: LinkQueues) {
        if self.initiator {
            self.publish_offer();
        }

        loop {
            let open = self.outbound.is_some();
            let step = tokio::select! {
                biased;
                cmd = queues.control.recv() => match cmd {
                    None | Some(LinkCommand::Close) => Step::Stop,
                    Some(LinkCommand::Remote(signal)) => self.on_remote(signal).await,
                    Some(LinkCommand::Send(msg)) => self.deliver(msg).await,
                },
                frame = queues.data.recv(), if open => match frame {
                    Some(frame) => self.deliver(frame).await,
                    None => Step::Stop,
                },
                msg = self.inbound_rx.recv(), if open => match msg {
                    Some(msg) => {
                        self.sink.emit(LinkEvent::Message(msg));
                        Step::Continue
                    }
                    None => Step::Stop,
                },
            };
            if matches!(step, Step::Stop) {
                break;
            }
        }

        if let Some(token) = self.token.take() {
            self.switchboard.remove(&token);
        }
        debug!(peer = %self.sink.peer().short(), "memory link closed");
        self.sink.emit(LinkEvent::Closed);
    }

    async fn on_remote(&mut self, signal: SignalData) -> Step {
        match signal {
            SignalData::Offer { sdp } if !self.initiator && self.outbound.is_none() => {
                let Some(token) = sdp.strip_prefix(OFFER_PREFIX) else {
                    warn!("offer is not an in-process offer");
                    return Step::Stop;
                };
                let Some((_, offer)) = self.switchboard.remove(token) else {
                    warn!(token, "offer token unknown or already claimed");
                    return Step::Stop;
                };
                let Some(inbound) = self.inbound_tx.take() else {
                    return Step::Stop;
                };
                if offer.reply.send(inbound).is_err() {
                    return Step::Stop;
                }
                self.outbound = Some(offer.to_initiator);
                self.sink.emit(LinkEvent::Signal(SignalData::Answer {
                    sdp: format!("{ANSWER_PREFIX}{token}"),
                }));
                self.opened().await
            }
            SignalData::Answer { .. } if self.initiator && self.outbound.is_none() => {
                let Some(answer_rx) = self.answer_rx.take() else {
                    return Step::Stop;
                };
                match answer_rx.await {
                    Ok(outbound) => {
                        self.outbound = Some(outbound);
                        self.token = None;
                        self.opened().await
                    }
                    Err(_) => Step::Stop,
                }
            }
            SignalData::Candidate { candidate } => {
                trace!(candidate = %candidate.candidate, "candidate ignored by in-process link");
                Step::Continue
            }
            other => {
                warn!(?other, "unexpected signal for in-process link");
                Step::Continue
            }
        }
    }

    async fn opened(&mut self) -> Step {
        self.sink.emit(LinkEvent::Open);
        for msg in std::mem::take(&mut self.backlog) {
            if let Step::Stop = self.deliver(msg).await {
                return Step::Stop;
            }
        }
        Step::Continue
    }

    async fn deliver(&mut self, msg: Bytes) -> Step {
        match &self.outbound {
            Some(tx) => {
                if tx.send(msg).await.is_err() {
                    Step::Stop
                } else {
                    Step::Continue
                }
            }
            None => {
                self.backlog.push(msg);
                Step::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkReport;
    use std::time::Duration;

    fn request(
        local: PeerId,
        remote: PeerId,
        initiator: bool,
    ) -> (LinkRequest, mpsc::UnboundedReceiver<LinkReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            LinkRequest {
                local,
                remote,
                initiator,
                data_capacity: 8,
                sink: LinkSink::new(remote, 1, tx),
            },
            rx,
        )
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<LinkReport>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .event
    }

    #[tokio::test]
    async fn test_pair_exchanges_messages() {
        let connector = MemoryConnector::new();
        let (a, b) = (PeerId::random(), PeerId::random());
        let (req_a, mut ev_a) = request(a, b, true);
        let (req_b, mut ev_b) = request(b, a, false);
        let link_a = connector.open(req_a).unwrap();
        let link_b = connector.open(req_b).unwrap();

        // candidate is produced before the offer
        let LinkEvent::Signal(candidate) = next(&mut ev_a).await else {
            panic!("expected candidate");
        };
        assert!(!candidate.is_description());
        let LinkEvent::Signal(offer) = next(&mut ev_a).await else {
            panic!("expected offer");
        };
        assert!(matches!(offer, SignalData::Offer { .. }));
        assert_eq!(connector.pending_offers(), 1);

        link_b.signal(offer);
        link_b.signal(candidate);
        let LinkEvent::Signal(answer) = next(&mut ev_b).await else {
            panic!("expected answer");
        };
        assert!(matches!(next(&mut ev_b).await, LinkEvent::Open));

        link_a.signal(answer);
        assert!(matches!(next(&mut ev_a).await, LinkEvent::Open));
        assert_eq!(connector.pending_offers(), 0);

        link_a.send(Bytes::from_static(b"ping"));
        let LinkEvent::Message(msg) = next(&mut ev_b).await else {
            panic!("expected message");
        };
        assert_eq!(msg, "ping");

        link_b.data().send(Bytes::from_static(b"bulk")).await.unwrap();
        let LinkEvent::Message(msg) = next(&mut ev_a).await else {
            panic!("expected message");
        };
        assert_eq!(msg, "bulk");

        link_a.close();
        assert!(matches!(next(&mut ev_a).await, LinkEvent::Closed));
        assert!(matches!(next(&mut ev_b).await, LinkEvent::Closed));
    }

    #[tokio::test]
    async fn test_sends_before_open_are_held() {
        let connector = MemoryConnector::new();
        let (a, b) = (PeerId::random(), PeerId::random());
        let (req_a, mut ev_a) = request(a, b, true);
        let (req_b, mut ev_b) = request(b, a, false);
        let link_a = connector.open(req_a).unwrap();
        let link_b = connector.open(req_b).unwrap();

        link_a.send(Bytes::from_static(b"early"));
        next(&mut ev_a).await;
        let LinkEvent::Signal(offer) = next(&mut ev_a).await else {
            panic!("expected offer");
        };
        link_b.signal(offer);
        let LinkEvent::Signal(answer) = next(&mut ev_b).await else {
            panic!("expected answer");
        };
        next(&mut ev_b).await;
        link_a.signal(answer);
        assert!(matches!(next(&mut ev_a).await, LinkEvent::Open));

        let LinkEvent::Message(msg) = next(&mut ev_b).await else {
            panic!("expected held message");
        };
        assert_eq!(msg, "early");
    }

    #[tokio::test]
    async fn test_unknown_offer_closes() {
        let connector = MemoryConnector::new();
        let (req, mut ev) = request(PeerId::random(), PeerId::random(), false);
        let link = connector.open(req).unwrap();
        link.signal(SignalData::Offer {
            sdp: format!("{OFFER_PREFIX}nope"),
        });
        assert!(matches!(next(&mut ev).await, LinkEvent::Closed));
    }
}
