//! In-memory backend for tests and tooling.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use pulse_consensus::BlockHash;

use crate::{ChainBatch, HeaderRecord, HeaderState, HeaderStore, StoreError};

#[derive(Default)]
struct Inner {
    by_hash: HashMap<BlockHash, HeaderRecord>,
    /// Longest-chain rows only.
    by_height: BTreeMap<u32, BlockHash>,
}

#[derive(Default)]
pub struct MemoryHeaderStore {
    inner: RwLock<Inner>,
}

impl MemoryHeaderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn index_for_state(&mut self, record: &HeaderRecord) {
        match record.state {
            HeaderState::LongestChain => {
                self.by_height.insert(record.height, record.hash);
            }
            _ => {
                if self.by_height.get(&record.height) == Some(&record.hash) {
                    self.by_height.remove(&record.height);
                }
            }
        }
    }
}

impl HeaderStore for MemoryHeaderStore {
    fn migrate(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn get(&self, hash: &BlockHash) -> Result<Option<HeaderRecord>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        Ok(guard.by_hash.get(hash).cloned())
    }

    fn get_by_height(&self, height: u32) -> Result<Option<HeaderRecord>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        let Some(hash) = guard.by_height.get(&height) else {
            return Ok(None);
        };
        guard
            .by_hash
            .get(hash)
            .cloned()
            .map(Some)
            .ok_or_else(|| StoreError::Corrupt(format!("height index points at unknown {hash}")))
    }

    fn tip(&self) -> Result<Option<HeaderRecord>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        let Some((_, hash)) = guard.by_height.iter().next_back() else {
            return Ok(None);
        };
        guard
            .by_hash
            .get(hash)
            .cloned()
            .map(Some)
            .ok_or_else(|| StoreError::Corrupt(format!("height index points at unknown {hash}")))
    }

    fn commit(&self, batch: &ChainBatch) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");

        // Validate before touching anything so the batch stays all-or-nothing.
        for (hash, _) in &batch.state_changes {
            let known = guard.by_hash.contains_key(hash)
                || batch.inserts.iter().any(|record| record.hash == *hash);
            if !known {
                return Err(StoreError::Corrupt(format!(
                    "state change for unknown header {hash}"
                )));
            }
        }

        for record in &batch.inserts {
            guard.index_for_state(record);
            guard.by_hash.insert(record.hash, record.clone());
        }
        for (hash, state) in &batch.state_changes {
            let record = guard.by_hash.get_mut(hash).expect("validated above");
            record.state = *state;
            let record = record.clone();
            guard.index_for_state(&record);
        }
        Ok(())
    }

    fn header_count(&self) -> Result<u64, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        Ok(guard.by_hash.len() as u64)
    }
}
