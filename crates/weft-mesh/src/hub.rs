//! Hub registry.
//!
//! Tracks every node the hub knows about in exactly one of three places:
//! the registration queue (registered, first link not yet up), the clients
//! table, or the workers table. Identity claims are first-writer-wins across
//! all three, and against the hub's own id.
//!
//! All methods take the current time explicitly, so the registry can be
//! driven by the node actor and tested without a clock.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, info};
use weft_core::{PeerId, Role};

use crate::balancer::WorkerBalancer;
use crate::queue::TimeoutQueue;

/// Table membership at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubSnapshot {
    /// Registered, awaiting their first link
    pub queued: Vec<PeerId>,
    /// Connected clients
    pub clients: Vec<PeerId>,
    /// Connected workers
    pub workers: Vec<PeerId>,
    /// Clients waiting for a worker
    pub unmeshed: Vec<PeerId>,
}

/// Registration queue, peer tables and worker balancer of one hub
#[derive(Debug)]
pub struct HubState {
    id: PeerId,
    timeout: Duration,
    queue: TimeoutQueue<PeerId>,
    queued: HashMap<PeerId, Role>,
    clients: HashSet<PeerId>,
    workers: HashSet<PeerId>,
    balancer: WorkerBalancer,
    unmeshed: Vec<PeerId>,
}

impl HubState {
    /// Create a registry for hub `id` evicting queued entries after `timeout`
    #[must_use]
    pub fn new(id: PeerId, timeout: Duration) -> Self {
        Self {
            id,
            timeout,
            queue: TimeoutQueue::new(),
            queued: HashMap::new(),
            clients: HashSet::new(),
            workers: HashSet::new(),
            balancer: WorkerBalancer::new(),
            unmeshed: Vec::new(),
        }
    }

    /// Hub id sent in register replies
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Whether `id` is claimed anywhere
    #[must_use]
    pub fn is_known(&self, id: &PeerId) -> bool {
        *id == self.id
            || self.queue.contains(id)
            || self.clients.contains(id)
            || self.workers.contains(id)
    }

    /// Whether `id` is waiting in the registration queue
    #[must_use]
    pub fn is_queued(&self, id: &PeerId) -> bool {
        self.queue.contains(id)
    }

    /// Whether `id` is a connected worker
    #[must_use]
    pub fn is_worker(&self, id: &PeerId) -> bool {
        self.workers.contains(id)
    }

    /// Whether `id` is a connected client
    #[must_use]
    pub fn is_client(&self, id: &PeerId) -> bool {
        self.clients.contains(id)
    }

    /// Claim `id` for a new registration. Returns `false` on collision.
    pub fn register(&mut self, id: PeerId, role: Role, now: Instant) -> bool {
        if role == Role::Hub || self.is_known(&id) {
            debug!(peer = %id.short(), "registration refused");
            return false;
        }
        self.queue.push(id, now);
        self.queued.insert(id, role);
        debug!(peer = %id.short(), ?role, "registered");
        true
    }

    /// Record signaling activity for a queued id
    pub fn touch(&mut self, id: PeerId, now: Instant) -> bool {
        self.queue.touch(id, now)
    }

    /// Move a queued id into its connected table.
    ///
    /// Workers also join the balancer with no connections counted.
    pub fn promote(&mut self, id: PeerId) -> Option<Role> {
        if !self.queue.remove(&id) {
            return None;
        }
        let role = self.queued.remove(&id)?;
        match role {
            Role::Worker => {
                self.workers.insert(id);
                self.balancer.insert(id, 0);
            }
            Role::Client => {
                self.clients.insert(id);
            }
            Role::Hub => return None,
        }
        info!(peer = %id.short(), ?role, "promoted");
        Some(role)
    }

    /// Remove queued entries idle past the timeout
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerId> {
        let expired = self.queue.expire(now, self.timeout);
        for id in &expired {
            self.queued.remove(id);
            info!(peer = %id.short(), "registration expired");
        }
        expired
    }

    /// Remove `id` from every table. Returns `false` if it was unknown.
    pub fn remove(&mut self, id: &PeerId) -> bool {
        let queued = self.queue.remove(id);
        self.queued.remove(id);
        let client = self.clients.remove(id);
        let worker = self.workers.remove(id);
        self.balancer.remove(id);
        let before = self.unmeshed.len();
        self.unmeshed.retain(|c| c != id);
        queued || client || worker || before != self.unmeshed.len()
    }

    /// Choose a worker for `client`, or park the client if none is live
    pub fn enmesh(&mut self, client: PeerId) -> Option<PeerId> {
        if !self.clients.contains(&client) {
            return None;
        }
        let workers = &self.workers;
        match self.balancer.pick_live(|w| workers.contains(w)) {
            Some(worker) => {
                self.unmeshed.retain(|c| *c != client);
                info!(client = %client.short(), worker = %worker.short(), "enmeshed");
                Some(worker)
            }
            None => {
                if !self.unmeshed.contains(&client) {
                    self.unmeshed.push(client);
                }
                info!(client = %client.short(), "no live worker, client parked");
                None
            }
        }
    }

    /// Take the parked clients, oldest first
    pub fn take_unmeshed(&mut self) -> Vec<PeerId> {
        std::mem::take(&mut self.unmeshed)
    }

    /// Apply a worker's self-reported connection count
    pub fn update_load(&mut self, worker: PeerId, connections: u64) -> bool {
        self.workers.contains(&worker) && self.balancer.update(worker, connections)
    }

    /// Balancer count for `worker`
    #[must_use]
    pub fn load(&self, worker: &PeerId) -> Option<u64> {
        self.balancer.load(worker)
    }

    /// Table membership
    #[must_use]
    pub fn snapshot(&self) -> HubSnapshot {
        let mut snap = HubSnapshot {
            queued: self.queue.keys().copied().collect(),
            clients: self.clients.iter().copied().collect(),
            workers: self.workers.iter().copied().collect(),
            unmeshed: self.unmeshed.clone(),
        };
        snap.queued.sort();
        snap.clients.sort();
        snap.workers.sort();
        snap
    }
}
