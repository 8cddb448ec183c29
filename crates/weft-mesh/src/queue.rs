//! Insertion-ordered timeout queue.
//!
//! Entries expire in the order they were last touched. Removal and touching
//! are O(1): the deque may hold stale positions, which are skipped when the
//! front is inspected because the map holds the authoritative timestamp.
//! Once stale positions outnumber live keys two to one they are purged.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Deques this short are never purged
const COMPACT_FLOOR: usize = 32;

/// Keys with a deadline measured from their last activity
#[derive(Debug, Clone)]
pub struct TimeoutQueue<K> {
    order: VecDeque<(K, Instant)>,
    live: HashMap<K, Instant>,
}

impl<K> Default for TimeoutQueue<K> {
    fn default() -> Self {
        Self {
            order: VecDeque::new(),
            live: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash> TimeoutQueue<K> {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `key`. Returns `false` if it is already present.
    pub fn push(&mut self, key: K, now: Instant) -> bool {
        if self.live.contains_key(&key) {
            return false;
        }
        self.live.insert(key, now);
        self.order.push_back((key, now));
        self.compact();
        true
    }

    /// Restart `key`'s idle window. Returns `false` if absent.
    pub fn touch(&mut self, key: K, now: Instant) -> bool {
        match self.live.get_mut(&key) {
            Some(at) => {
                *at = now;
                self.order.push_back((key, now));
                self.compact();
                true
            }
            None => false,
        }
    }

    fn compact(&mut self) {
        if self.order.len() <= COMPACT_FLOOR.max(3 * self.live.len()) {
            return;
        }
        let live = &self.live;
        self.order.retain(|(key, at)| live.get(key) == Some(at));
    }

    /// Remove `key`. Returns `false` if absent.
    pub fn remove(&mut self, key: &K) -> bool {
        self.live.remove(key).is_some()
    }

    /// Whether `key` is queued
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    /// Time `key` entered or was last touched
    #[must_use]
    pub fn since(&self, key: &K) -> Option<Instant> {
        self.live.get(key).copied()
    }

    /// Number of live keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// No live keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Live keys in no particular order
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.live.keys()
    }

    /// Remove and return every key idle for longer than `timeout`
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some(&(key, at)) = self.order.front() {
            if self.live.get(&key) != Some(&at) {
                self.order.pop_front();
                continue;
            }
            if now.saturating_duration_since(at) <= timeout {
                break;
            }
            self.order.pop_front();
            self.live.remove(&key);
            expired.push(key);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn test_expires_after_timeout() {
        let start = Instant::now();
        let mut q = TimeoutQueue::new();
        assert!(q.push(1u32, start));
        assert!(q.expire(start + Duration::from_secs(10), TIMEOUT).is_empty());
        assert_eq!(q.expire(start + Duration::from_secs(11), TIMEOUT), vec![1]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_duplicate_push_rejected() {
        let now = Instant::now();
        let mut q = TimeoutQueue::new();
        assert!(q.push(7u32, now));
        assert!(!q.push(7u32, now));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_removed_keys_never_expire() {
        let start = Instant::now();
        let mut q = TimeoutQueue::new();
        q.push(1u32, start);
        q.push(2u32, start);
        assert!(q.remove(&1));
        assert!(!q.remove(&1));
        assert_eq!(q.expire(start + Duration::from_secs(20), TIMEOUT), vec![2]);
    }

    #[test]
    fn test_touch_restarts_window() {
        let start = Instant::now();
        let mut q = TimeoutQueue::new();
        q.push(1u32, start);
        q.push(2u32, start + Duration::from_secs(1));
        assert!(q.touch(1, start + Duration::from_secs(5)));

        let expired = q.expire(start + Duration::from_secs(12), TIMEOUT);
        assert_eq!(expired, vec![2]);
        assert!(q.contains(&1));
        assert_eq!(q.expire(start + Duration::from_secs(16), TIMEOUT), vec![1]);
    }

    #[test]
    fn test_expiry_in_order() {
        let start = Instant::now();
        let mut q = TimeoutQueue::new();
        for i in 0..5u32 {
            q.push(i, start + Duration::from_secs(u64::from(i)));
        }
        let expired = q.expire(start + Duration::from_secs(13), TIMEOUT);
        assert_eq!(expired, vec![0, 1, 2]);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_touches_stay_bounded() {
        let start = Instant::now();
        let mut q = TimeoutQueue::new();
        q.push(1u32, start);
        q.push(2u32, start);
        for i in 1..5_000u64 {
            q.touch(1, start + Duration::from_millis(i));
        }
        assert!(q.order.len() <= COMPACT_FLOOR + 1);

        let expired = q.expire(start + Duration::from_secs(11), TIMEOUT);
        assert_eq!(expired, vec![2]);
        assert!(q.contains(&1));
    }

    #[test]
    fn test_readd_after_remove() {
        let start = Instant::now();
        let mut q = TimeoutQueue::new();
        q.push(1u32, start);
        q.remove(&1);
        q.push(1u32, start + Duration::from_secs(8));
        assert!(q.expire(start + Duration::from_secs(15), TIMEOUT).is_empty());
        assert_eq!(q.since(&1), Some(start + Duration::from_secs(8)));
    }
}
