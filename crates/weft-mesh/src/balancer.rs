//! Least-connections worker selection.
//!
//! Workers sit in a min-heap keyed by `(connections, sequence)`. The map is
//! authoritative: a heap entry whose count or sequence no longer matches the
//! map is stale and gets discarded when it reaches the top. Removing a
//! worker therefore only touches the map. Once stale entries outnumber live
//! ones two to one the heap is rebuilt from the map.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use weft_core::PeerId;

/// Heaps this small are never rebuilt
const COMPACT_FLOOR: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Load {
    connections: u64,
    seq: u64,
}

/// Priority structure of live workers
#[derive(Debug, Default, Clone)]
pub struct WorkerBalancer {
    heap: BinaryHeap<Reverse<(u64, u64, PeerId)>>,
    loads: HashMap<PeerId, Load>,
    next_seq: u64,
}

impl WorkerBalancer {
    /// Create an empty balancer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&mut self, worker: PeerId, connections: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.loads.insert(worker, Load { connections, seq });
        self.heap.push(Reverse((connections, seq, worker)));
        self.compact();
    }

    fn compact(&mut self) {
        if self.heap.len() <= COMPACT_FLOOR.max(3 * self.loads.len()) {
            return;
        }
        self.heap = self
            .loads
            .iter()
            .map(|(worker, load)| Reverse((load.connections, load.seq, *worker)))
            .collect();
    }

    /// Add a worker, or reset its count if already present
    pub fn insert(&mut self, worker: PeerId, connections: u64) {
        self.enqueue(worker, connections);
    }

    /// Apply a connection count reported by the worker itself.
    ///
    /// Returns `false` for workers that are not tracked.
    pub fn update(&mut self, worker: PeerId, connections: u64) -> bool {
        match self.loads.get(&worker) {
            Some(load) if load.connections == connections => true,
            Some(_) => {
                self.enqueue(worker, connections);
                true
            }
            None => false,
        }
    }

    /// Stop tracking a worker
    pub fn remove(&mut self, worker: &PeerId) -> bool {
        self.loads.remove(worker).is_some()
    }

    /// Whether `worker` is tracked
    #[must_use]
    pub fn contains(&self, worker: &PeerId) -> bool {
        self.loads.contains_key(worker)
    }

    /// Current count for `worker`
    #[must_use]
    pub fn load(&self, worker: &PeerId) -> Option<u64> {
        self.loads.get(worker).map(|l| l.connections)
    }

    /// Tracked workers
    #[must_use]
    pub fn len(&self) -> usize {
        self.loads.len()
    }

    /// No tracked workers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
    }

    /// Pick the least-loaded worker and count one more connection against it
    pub fn pick(&mut self) -> Option<PeerId> {
        self.pick_live(|_| true)
    }

    /// Like [`pick`](Self::pick), but workers failing `live` are dropped for good
    pub fn pick_live(&mut self, mut live: impl FnMut(&PeerId) -> bool) -> Option<PeerId> {
        while let Some(Reverse((connections, seq, worker))) = self.heap.pop() {
            if self.loads.get(&worker) != Some(&Load { connections, seq }) {
                continue;
            }
            if !live(&worker) {
                self.loads.remove(&worker);
                continue;
            }
            self.enqueue(worker, connections + 1);
            return Some(worker);
        }
        None
    }
}
