//! Bounded buffer for headers whose parent has not arrived yet.

use std::collections::{HashMap, VecDeque};

use pulse_consensus::BlockHash;
use pulse_primitives::BlockHeader;

pub const DEFAULT_ORPHAN_CAPACITY: usize = 1024;

/// FIFO-evicting orphan buffer keyed by the missing parent hash.
pub struct OrphanPool {
    capacity: usize,
    by_parent: HashMap<BlockHash, Vec<BlockHeader>>,
    arrival: VecDeque<(BlockHash, BlockHash)>, // (parent, orphan hash)
}

impl OrphanPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            by_parent: HashMap::new(),
            arrival: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.arrival.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrival.is_empty()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.arrival.iter().any(|(_, orphan)| orphan == hash)
    }

    /// Buffers `header`; the oldest orphan is dropped when full.
    pub fn insert(&mut self, header: BlockHeader) {
        let hash = header.hash();
        if self.contains(&hash) {
            return;
        }
        while self.arrival.len() >= self.capacity {
            self.evict_oldest();
        }
        self.arrival.push_back((header.prev_hash, hash));
        self.by_parent.entry(header.prev_hash).or_default().push(header);
    }

    /// Removes and returns every buffered child of `parent`.
    pub fn take_children(&mut self, parent: &BlockHash) -> Vec<BlockHeader> {
        let Some(children) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        self.arrival.retain(|(p, _)| p != parent);
        children
    }

    fn evict_oldest(&mut self) {
        let Some((parent, hash)) = self.arrival.pop_front() else {
            return;
        };
        if let Some(children) = self.by_parent.get_mut(&parent) {
            children.retain(|header| header.hash() != hash);
            if children.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
    }
}

impl Default for OrphanPool {
    fn default() -> Self {
        Self::new(DEFAULT_ORPHAN_CAPACITY)
    }
}
