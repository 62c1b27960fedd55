//! Recently-seen message ids
//!
//! A flooded message can come back to a node along a different path of a
//! cyclic mesh. Each node remembers the last `capacity` envelope ids it has
//! handled and drops repeats instead of delivering and relaying them again.

use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

/// Default number of ids remembered per node
pub const DEFAULT_SEEN_CAPACITY: usize = 4096;

/// Bounded FIFO set of message ids
#[derive(Debug)]
pub struct SeenCache {
    capacity: usize,
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    /// Record an id. Returns `false` if it was already present.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }

        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    #[cfg(test)]
    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.order.len()
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_is_rejected() {
        let mut seen = SeenCache::new(8);
        let id = Uuid::new_v4();
        assert!(seen.insert(id));
        assert!(!seen.insert(id));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_oldest_evicted_first() {
        let mut seen = SeenCache::new(2);
        let ids: Vec<_> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            assert!(seen.insert(*id));
        }

        assert_eq!(seen.len(), 2);
        assert!(!seen.contains(&ids[0]));
        assert!(seen.contains(&ids[1]));
        assert!(seen.contains(&ids[2]));

        // Evicted ids are accepted again
        assert!(seen.insert(ids[0]));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut seen = SeenCache::new(0);
        assert!(seen.insert(Uuid::new_v4()));
        assert_eq!(seen.len(), 1);
    }
}
