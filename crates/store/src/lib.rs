//! Durable header-chain storage behind a narrow adapter trait.
//!
//! The chain service is the only writer; every mutation travels as one
//! [`ChainBatch`] and is applied atomically by the backend.

use std::fmt;
use std::sync::Arc;

use primitive_types::U256;
use pulse_consensus::BlockHash;
use pulse_primitives::BlockHeader;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryHeaderStore;
pub use sqlite::SqliteHeaderStore;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
            StoreError::Corrupt(message) => write!(f, "corrupt store: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Lifecycle state of a stored header.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum HeaderState {
    LongestChain,
    Stale,
    Orphan,
    Rejected,
}

impl HeaderState {
    pub fn as_str(self) -> &'static str {
        match self {
            HeaderState::LongestChain => "LONGEST_CHAIN",
            HeaderState::Stale => "STALE",
            HeaderState::Orphan => "ORPHAN",
            HeaderState::Rejected => "REJECTED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "LONGEST_CHAIN" => Some(HeaderState::LongestChain),
            "STALE" => Some(HeaderState::Stale),
            "ORPHAN" => Some(HeaderState::Orphan),
            "REJECTED" => Some(HeaderState::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored header with its chain position and accumulated work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderRecord {
    pub hash: BlockHash,
    pub version: i32,
    pub prev_hash: BlockHash,
    pub merkle_root: BlockHash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub height: u32,
    /// Work contributed by this header alone.
    pub chainwork: U256,
    /// Work from genesis to this header inclusive.
    pub cumulated_work: U256,
    pub state: HeaderState,
}

impl HeaderRecord {
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_hash: self.prev_hash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.prev_hash.is_zero()
    }
}

/// An atomic unit of chain mutation: new records plus state flips.
///
/// The height index follows from record state and never travels separately:
/// backends index exactly the rows whose final state is `LongestChain`.
#[derive(Clone, Debug, Default)]
pub struct ChainBatch {
    pub inserts: Vec<HeaderRecord>,
    pub state_changes: Vec<(BlockHash, HeaderState)>,
}

impl ChainBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: HeaderRecord) {
        self.inserts.push(record);
    }

    pub fn set_state(&mut self, hash: BlockHash, state: HeaderState) {
        self.state_changes.push((hash, state));
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.state_changes.is_empty()
    }
}

/// The adapter contract over the backing engine. No engine detail leaks
/// through this boundary; swapping SQLite for a networked SQL engine means
/// implementing these seven operations.
pub trait HeaderStore: Send + Sync {
    /// Brings the schema to the current version. Idempotent.
    fn migrate(&self) -> Result<(), StoreError>;

    fn get(&self, hash: &BlockHash) -> Result<Option<HeaderRecord>, StoreError>;

    /// Longest-chain record at `height`. Non-longest branches are not
    /// reachable by height.
    fn get_by_height(&self, height: u32) -> Result<Option<HeaderRecord>, StoreError>;

    /// The longest-chain record with maximum height.
    fn tip(&self) -> Result<Option<HeaderRecord>, StoreError>;

    /// Applies the whole batch or nothing.
    fn commit(&self, batch: &ChainBatch) -> Result<(), StoreError>;

    fn header_count(&self) -> Result<u64, StoreError>;

    /// Up to `max` records walking `prev_hash` links from `hash` inclusive.
    fn ancestors_back(
        &self,
        hash: &BlockHash,
        max: usize,
    ) -> Result<Vec<HeaderRecord>, StoreError> {
        let mut out = Vec::new();
        let mut cursor = *hash;
        while out.len() < max {
            let Some(record) = self.get(&cursor)? else {
                break;
            };
            let parent = record.prev_hash;
            let genesis = record.is_genesis();
            out.push(record);
            if genesis {
                break;
            }
            cursor = parent;
        }
        Ok(out)
    }
}

impl<T: HeaderStore + ?Sized> HeaderStore for Arc<T> {
    fn migrate(&self) -> Result<(), StoreError> {
        self.as_ref().migrate()
    }

    fn get(&self, hash: &BlockHash) -> Result<Option<HeaderRecord>, StoreError> {
        self.as_ref().get(hash)
    }

    fn get_by_height(&self, height: u32) -> Result<Option<HeaderRecord>, StoreError> {
        self.as_ref().get_by_height(height)
    }

    fn tip(&self) -> Result<Option<HeaderRecord>, StoreError> {
        self.as_ref().tip()
    }

    fn commit(&self, batch: &ChainBatch) -> Result<(), StoreError> {
        self.as_ref().commit(batch)
    }

    fn header_count(&self) -> Result<u64, StoreError> {
        self.as_ref().header_count()
    }

    fn ancestors_back(
        &self,
        hash: &BlockHash,
        max: usize,
    ) -> Result<Vec<HeaderRecord>, StoreError> {
        self.as_ref().ancestors_back(hash, max)
    }
}

/// Decimal round-trip for work values; the on-disk representation must stay
/// portable and numerically comparable after parsing.
pub(crate) fn work_to_decimal(value: &U256) -> String {
    value.to_string()
}

pub(crate) fn work_from_decimal(raw: &str) -> Result<U256, StoreError> {
    U256::from_dec_str(raw)
        .map_err(|_| StoreError::Corrupt(format!("bad work value {raw:?}")))
}
