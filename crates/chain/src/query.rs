//! Read-only projections over the chain store.
//!
//! Everything here is safe under concurrent callers; snapshot consistency
//! comes from the store's reader/writer isolation.

use pulse_consensus::constants::MAX_HEADERS_RESULTS;
use pulse_consensus::BlockHash;
use pulse_store::{HeaderRecord, HeaderState, HeaderStore};

use crate::service::ChainService;
use crate::ChainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationState {
    Confirmed,
    UnableToVerify,
    Invalid,
}

/// Answer to one (merkle root, height) confirmation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleConfirmation {
    pub merkle_root: BlockHash,
    pub block_height: u32,
    pub block_hash: Option<BlockHash>,
    pub confirmation: ConfirmationState,
}

impl<S: HeaderStore> ChainService<S> {
    pub fn tip(&self) -> Result<Option<HeaderRecord>, ChainError> {
        Ok(self.store().tip()?)
    }

    pub fn header(&self, hash: &BlockHash) -> Result<Option<HeaderRecord>, ChainError> {
        Ok(self.store().get(hash)?)
    }

    pub fn header_by_height(&self, height: u32) -> Result<Option<HeaderRecord>, ChainError> {
        Ok(self.store().get_by_height(height)?)
    }

    pub fn header_count(&self) -> Result<u64, ChainError> {
        Ok(self.store().header_count()?)
    }

    /// Up to `max` records walking parents from `hash` inclusive.
    pub fn ancestors(
        &self,
        hash: &BlockHash,
        max: usize,
    ) -> Result<Vec<HeaderRecord>, ChainError> {
        Ok(self.store().ancestors_back(hash, max)?)
    }

    /// Lowest common ancestor of all given headers, if every hash is known.
    pub fn common_ancestor(
        &self,
        hashes: &[BlockHash],
    ) -> Result<Option<HeaderRecord>, ChainError> {
        if hashes.is_empty() {
            return Ok(None);
        }
        let mut cursors = Vec::with_capacity(hashes.len());
        for hash in hashes {
            match self.store().get(hash)? {
                Some(record) => cursors.push(record),
                None => return Ok(None),
            }
        }

        loop {
            let min_height = cursors
                .iter()
                .map(|record| record.height)
                .min()
                .expect("cursors not empty");
            // Bring every cursor down to the same height.
            for cursor in cursors.iter_mut() {
                while cursor.height > min_height {
                    let Some(parent) = self.store().get(&cursor.prev_hash)? else {
                        return Ok(None);
                    };
                    *cursor = parent;
                }
            }
            let first = cursors[0].hash;
            if cursors.iter().all(|record| record.hash == first) {
                return Ok(Some(cursors.swap_remove(0)));
            }
            if min_height == 0 {
                return Ok(None);
            }
            // Step all cursors one parent and retry.
            for cursor in cursors.iter_mut() {
                let Some(parent) = self.store().get(&cursor.prev_hash)? else {
                    return Ok(None);
                };
                *cursor = parent;
            }
        }
    }

    /// Sparse locator over the longest chain: tip, tip−1, tip−2, tip−4, …,
    /// genesis.
    pub fn locator(&self) -> Result<Vec<BlockHash>, ChainError> {
        let Some(tip) = self.store().tip()? else {
            return Ok(Vec::new());
        };
        let mut hashes = vec![tip.hash];
        if tip.height == 0 {
            return Ok(hashes);
        }
        let mut offset: u32 = 1;
        loop {
            let height = tip.height.saturating_sub(offset);
            let record = self
                .store()
                .get_by_height(height)?
                .ok_or(ChainError::Internal("height index hole on longest chain"))?;
            hashes.push(record.hash);
            if height == 0 {
                break;
            }
            offset = offset.saturating_mul(2);
        }
        Ok(hashes)
    }

    /// Longest-chain headers following the highest locator entry that is on
    /// the longest chain, capped at the protocol limit of 2000.
    pub fn headers_from_locator(
        &self,
        locator: &[BlockHash],
        stop: &BlockHash,
    ) -> Result<Vec<HeaderRecord>, ChainError> {
        let mut start_height = 0;
        for hash in locator {
            if let Some(record) = self.store().get(hash)? {
                if record.state == HeaderState::LongestChain {
                    start_height = record.height + 1;
                    break;
                }
            }
        }

        let mut out = Vec::new();
        let mut height = start_height;
        while out.len() < MAX_HEADERS_RESULTS {
            let Some(record) = self.store().get_by_height(height)? else {
                break;
            };
            let hash = record.hash;
            out.push(record);
            if !stop.is_zero() && hash == *stop {
                break;
            }
            height += 1;
        }
        Ok(out)
    }

    /// Confirmation state for each (merkle root, height) pair per the
    /// longest chain.
    pub fn confirm_merkle_roots(
        &self,
        requests: &[(BlockHash, u32)],
    ) -> Result<Vec<MerkleConfirmation>, ChainError> {
        let tip_height: i64 = match self.store().tip()? {
            Some(tip) => tip.height as i64,
            None => -1,
        };
        let excess = self.options().max_block_height_excess as i64;

        let mut out = Vec::with_capacity(requests.len());
        for (merkle_root, block_height) in requests {
            let record = self.store().get_by_height(*block_height)?;
            let matched = record
                .as_ref()
                .filter(|record| record.merkle_root == *merkle_root);

            let (confirmation, block_hash) = if let Some(record) = matched {
                (ConfirmationState::Confirmed, Some(record.hash))
            } else if *block_height as i64 > tip_height
                && (*block_height as i64 - tip_height) <= excess
            {
                (ConfirmationState::UnableToVerify, None)
            } else {
                (ConfirmationState::Invalid, None)
            };

            out.push(MerkleConfirmation {
                merkle_root: *merkle_root,
                block_height: *block_height,
                block_hash,
                confirmation,
            });
        }
        Ok(out)
    }
}
