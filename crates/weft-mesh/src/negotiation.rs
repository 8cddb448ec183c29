//! Per-peer negotiation state machine.
//!
//! ```text
//!        initiator          answerer
//!         Offering          Answering
//!             │ offer sent      │ answer sent
//!             ▼                 │
//!        IceExchange ◀──────────┘
//!             │ data channel open
//!             ▼
//!         Connected ──▶ Closed   (explicit close, link error, timeout)
//! ```
//!
//! Trickled candidates can be produced before the local offer or answer has
//! been sent. Those are held in a FIFO and released right behind the first
//! description, so the remote side always sees the description first and
//! candidates in production order.

use std::collections::VecDeque;
use std::time::Instant;

use weft_core::{PeerId, SignalData};

use crate::error::{MeshError, Result};

/// Negotiation progress for one remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Initiator, local offer not yet sent
    Offering,
    /// Answerer, local answer not yet sent
    Answering,
    /// Description sent, candidates flowing
    IceExchange,
    /// Data channel open
    Connected,
    /// Torn down
    Closed,
}

/// Path outgoing signals take to reach the remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalRoute {
    /// The hub control channel (first contact only)
    Control,
    /// Wrapped in `RelaySignal` to this connected peer
    Relay(PeerId),
}

/// State machine for one remote peer
#[derive(Debug, Clone)]
pub struct Negotiation {
    peer: PeerId,
    initiator: bool,
    state: NegotiationState,
    route: SignalRoute,
    pending: VecDeque<SignalData>,
    started: Instant,
}

impl Negotiation {
    fn new(peer: PeerId, initiator: bool, route: SignalRoute, now: Instant) -> Self {
        let state = if initiator {
            NegotiationState::Offering
        } else {
            NegotiationState::Answering
        };
        Self {
            peer,
            initiator,
            state,
            route,
            pending: VecDeque::new(),
            started: now,
        }
    }

    /// Start as the side that produces the offer
    #[must_use]
    pub fn initiator(peer: PeerId, route: SignalRoute, now: Instant) -> Self {
        Self::new(peer, true, route, now)
    }

    /// Start as the side that answers a remote offer
    #[must_use]
    pub fn answerer(peer: PeerId, route: SignalRoute, now: Instant) -> Self {
        Self::new(peer, false, route, now)
    }

    /// Remote peer
    #[must_use]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Whether this side offers
    #[must_use]
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Signal route
    #[must_use]
    pub fn route(&self) -> SignalRoute {
        self.route
    }

    /// When negotiation began
    #[must_use]
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Candidates held back
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn described(&self) -> bool {
        matches!(
            self.state,
            NegotiationState::IceExchange | NegotiationState::Connected
        )
    }

    /// Take a locally produced signal and return what may be sent now, in order.
    ///
    /// The first local description moves the machine to `IceExchange` and
    /// flushes any held candidates behind it.
    pub fn outgoing(&mut self, signal: SignalData) -> Vec<SignalData> {
        match self.state {
            NegotiationState::Closed => Vec::new(),
            _ if signal.is_description() => {
                if self.described() {
                    return vec![signal];
                }
                self.state = NegotiationState::IceExchange;
                let mut ready = Vec::with_capacity(1 + self.pending.len());
                ready.push(signal);
                ready.extend(self.pending.drain(..));
                ready
            }
            _ if self.described() => vec![signal],
            _ => {
                self.pending.push_back(signal);
                Vec::new()
            }
        }
    }

    /// Check a remote signal before it is applied to the link.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::InvalidState`] for an offer sent to the initiator,
    /// an answer sent to the answerer, or anything after close.
    pub fn incoming(&self, signal: &SignalData) -> Result<()> {
        match (self.state, signal) {
            (NegotiationState::Closed, _) => Err(MeshError::invalid_state("negotiation closed")),
            (_, SignalData::Offer { .. }) if self.initiator => {
                Err(MeshError::invalid_state("offer received by initiator"))
            }
            (_, SignalData::Answer { .. }) if !self.initiator => {
                Err(MeshError::invalid_state("answer received by answerer"))
            }
            _ => Ok(()),
        }
    }

    /// Data channel is open
    pub fn mark_open(&mut self) {
        if self.state != NegotiationState::Closed {
            self.state = NegotiationState::Connected;
            self.pending.clear();
        }
    }

    /// Tear down. Returns `false` if already closed.
    pub fn close(&mut self) -> bool {
        if self.state == NegotiationState::Closed {
            return false;
        }
        self.state = NegotiationState::Closed;
        self.pending.clear();
        true
    }
}
