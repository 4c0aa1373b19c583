//! The single authoritative mutator of chain state.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use primitive_types::U256;
use pulse_consensus::params::NetworkParams;
use pulse_consensus::BlockHash;
use pulse_pow::block_proof;
use pulse_pow::difficulty::{BranchView, HeaderInfo};
use pulse_primitives::BlockHeader;
use pulse_store::{ChainBatch, HeaderRecord, HeaderState, HeaderStore};

use crate::events::{ChainEvent, EventSink, NullSink};
use crate::orphans::{OrphanPool, DEFAULT_ORPHAN_CAPACITY};
use crate::validation::{validate_header, ValidationContext, ValidationError};
use crate::ChainError;

/// Wall-clock abstraction so tests control the future-timestamp check.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug)]
pub struct ChainOptions {
    /// Reorgs deeper than this many blocks below the tip are refused.
    pub blocks_for_fork_confirmation: u32,
    /// Height slack tolerated by Merkle-root confirmation queries.
    pub max_block_height_excess: u32,
    pub orphan_capacity: usize,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            blocks_for_fork_confirmation: 10,
            max_block_height_excess: 6,
            orphan_capacity: DEFAULT_ORPHAN_CAPACITY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted,
    Duplicate,
    Orphaned,
    Rejected(ValidationError),
}

pub struct ChainService<S> {
    store: S,
    params: NetworkParams,
    options: ChainOptions,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    /// Serializes every mutation; readers go straight to the store.
    write_lock: Mutex<()>,
    orphans: Mutex<OrphanPool>,
}

impl<S: HeaderStore> ChainService<S> {
    pub fn new(store: S, params: NetworkParams, options: ChainOptions) -> Self {
        let orphan_capacity = options.orphan_capacity;
        Self {
            store,
            params,
            options,
            sink: Arc::new(NullSink),
            clock: Arc::new(SystemClock),
            write_lock: Mutex::new(()),
            orphans: Mutex::new(OrphanPool::new(orphan_capacity)),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn options(&self) -> &ChainOptions {
        &self.options
    }

    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().expect("orphan lock").len()
    }

    /// Validates and persists one header, resolving any buffered orphans it
    /// unblocks. Emits `HeaderAdded` per accepted header and at most one
    /// `TipChanged`.
    pub fn accept_header(&self, header: BlockHeader) -> Result<AcceptOutcome, ChainError> {
        let _guard = self.write_lock.lock().expect("chain write lock");
        let tip_before = self.store.tip()?.map(|tip| tip.hash);
        let hash = header.hash();
        let outcome = self.accept_one(header)?;
        if outcome == AcceptOutcome::Accepted {
            self.drain_orphans(hash)?;
        }
        self.emit_tip_change(tip_before)?;
        Ok(outcome)
    }

    /// Ordered batch ingestion with one coalesced `TipChanged`.
    pub fn accept_header_batch(
        &self,
        headers: &[BlockHeader],
    ) -> Result<Vec<AcceptOutcome>, ChainError> {
        let _guard = self.write_lock.lock().expect("chain write lock");
        let tip_before = self.store.tip()?.map(|tip| tip.hash);
        let mut outcomes = Vec::with_capacity(headers.len());
        for header in headers {
            let hash = header.hash();
            let outcome = self.accept_one(*header)?;
            if outcome == AcceptOutcome::Accepted {
                self.drain_orphans(hash)?;
            }
            outcomes.push(outcome);
        }
        self.emit_tip_change(tip_before)?;
        Ok(outcomes)
    }

    fn emit_tip_change(&self, tip_before: Option<BlockHash>) -> Result<(), ChainError> {
        let Some(tip) = self.store.tip()? else {
            return Ok(());
        };
        if Some(tip.hash) != tip_before {
            self.sink.publish(ChainEvent::TipChanged {
                hash: tip.hash,
                height: tip.height,
            });
        }
        Ok(())
    }

    fn accept_one(&self, header: BlockHeader) -> Result<AcceptOutcome, ChainError> {
        let hash = header.hash();
        if self.store.get(&hash)?.is_some() {
            return Ok(AcceptOutcome::Duplicate);
        }

        let parent = if hash == self.params.genesis_hash {
            None
        } else {
            match self.store.get(&header.prev_hash)? {
                None => {
                    self.orphans
                        .lock()
                        .expect("orphan lock")
                        .insert(header);
                    return Ok(AcceptOutcome::Orphaned);
                }
                // A branch rooted in a rejected header can never be adopted;
                // drop the child instead of buffering it forever.
                Some(record) if record.state == HeaderState::Rejected => {
                    return Ok(AcceptOutcome::Orphaned);
                }
                Some(record) => Some(record),
            }
        };

        let (mut record, verdict) = self.build_record(&header, hash, parent.as_ref())?;
        if let Err(reason) = verdict {
            let mut batch = ChainBatch::new();
            batch.insert(record);
            self.store.commit(&batch)?;
            pulse_log::log_debug!("rejected header {hash}: {reason}");
            return Ok(AcceptOutcome::Rejected(reason));
        }

        let tip = self.store.tip()?;
        match tip {
            None => {
                record.state = HeaderState::LongestChain;
                let mut batch = ChainBatch::new();
                batch.insert(record.clone());
                self.store.commit(&batch)?;
                pulse_log::log_info!("chain initialized at genesis {hash}");
            }
            Some(tip) if header.prev_hash == tip.hash => {
                record.state = HeaderState::LongestChain;
                let mut batch = ChainBatch::new();
                batch.insert(record.clone());
                self.store.commit(&batch)?;
            }
            Some(tip) => {
                self.accept_on_side_branch(&mut record, &tip)?;
            }
        }

        self.sink.publish(ChainEvent::HeaderAdded {
            hash,
            height: record.height,
        });
        Ok(AcceptOutcome::Accepted)
    }

    /// Persists a header that extends a branch other than the current tip,
    /// switching branches when the newcomer carries strictly more work.
    fn accept_on_side_branch(
        &self,
        record: &mut HeaderRecord,
        tip: &HeaderRecord,
    ) -> Result<(), ChainError> {
        record.state = HeaderState::Stale;

        // Ties keep the incumbent: first-committed wins.
        if record.cumulated_work <= tip.cumulated_work {
            let mut batch = ChainBatch::new();
            batch.insert(record.clone());
            self.store.commit(&batch)?;
            return Ok(());
        }

        let fork = self.walk_to_longest_chain(record)?;
        let depth = tip.height - fork.common.height;
        if depth > self.options.blocks_for_fork_confirmation {
            let mut batch = ChainBatch::new();
            batch.insert(record.clone());
            self.store.commit(&batch)?;
            pulse_log::log_warn!(
                "refusing reorg of depth {depth} below confirmed fork depth {}; \
                 keeping {} as stale",
                self.options.blocks_for_fork_confirmation,
                record.hash
            );
            return Ok(());
        }

        record.state = HeaderState::LongestChain;
        let mut batch = ChainBatch::new();
        batch.insert(record.clone());
        for hash in &fork.branch {
            batch.set_state(*hash, HeaderState::LongestChain);
        }
        for height in (fork.common.height + 1)..=tip.height {
            let demoted = self
                .store
                .get_by_height(height)?
                .ok_or(ChainError::Internal("height index hole on longest chain"))?;
            batch.set_state(demoted.hash, HeaderState::Stale);
        }
        self.store.commit(&batch)?;

        pulse_log::log_info!(
            "reorg depth {depth}: tip {} -> {} (fork at height {})",
            tip.hash,
            record.hash,
            fork.common.height
        );
        self.sink.publish(ChainEvent::Reorg {
            from: tip.hash,
            to: record.hash,
            common: fork.common.hash,
            depth,
        });
        Ok(())
    }

    /// Walks parents of `record` until the longest chain is reached.
    /// Returns the common ancestor and the stale hashes in between,
    /// oldest first, excluding both endpoints.
    fn walk_to_longest_chain(&self, record: &HeaderRecord) -> Result<Fork, ChainError> {
        let mut branch = Vec::new();
        let mut cursor = record.prev_hash;
        loop {
            let ancestor = self
                .store
                .get(&cursor)?
                .ok_or(ChainError::Internal("broken parent link on side branch"))?;
            match ancestor.state {
                HeaderState::LongestChain => {
                    branch.reverse();
                    return Ok(Fork {
                        common: ancestor,
                        branch,
                    });
                }
                HeaderState::Stale => {
                    branch.push(ancestor.hash);
                    cursor = ancestor.prev_hash;
                }
                HeaderState::Orphan | HeaderState::Rejected => {
                    return Err(ChainError::Internal("side branch rooted in invalid state"));
                }
            }
        }
    }

    fn drain_orphans(&self, parent: BlockHash) -> Result<(), ChainError> {
        let mut queue = vec![parent];
        while let Some(parent_hash) = queue.pop() {
            let children = self
                .orphans
                .lock()
                .expect("orphan lock")
                .take_children(&parent_hash);
            for child in children {
                let child_hash = child.hash();
                if self.accept_one(child)? == AcceptOutcome::Accepted {
                    queue.push(child_hash);
                }
            }
        }
        Ok(())
    }

    /// Runs the pure validator and assembles the prospective record.
    /// The record comes back in `Rejected` state; the caller promotes it.
    fn build_record(
        &self,
        header: &BlockHeader,
        hash: BlockHash,
        parent: Option<&HeaderRecord>,
    ) -> Result<(HeaderRecord, Result<(), ValidationError>), ChainError> {
        let (height, parent_work) = match parent {
            Some(parent) => (parent.height + 1, parent.cumulated_work),
            None => (0, U256::zero()),
        };

        let branch = self.branch_slice(parent)?;
        let ctx = ValidationContext {
            parent,
            branch: &branch,
            now: self.clock.now(),
            params: &self.params,
        };
        let mut verdict = validate_header(header, &hash, &ctx);

        if verdict.is_ok() {
            if let Some(checkpoint) = self.params.checkpoint_at(height) {
                if checkpoint.hash != hash {
                    pulse_log::log_warn!(
                        "header {hash} contradicts checkpoint at height {height}"
                    );
                    verdict = Err(ValidationError::HashMismatch);
                }
            }
        }

        let chainwork = block_proof(header.bits).unwrap_or_else(|_| U256::zero());
        let record = HeaderRecord {
            hash,
            version: header.version,
            prev_hash: header.prev_hash,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            height,
            chainwork,
            cumulated_work: parent_work + chainwork,
            state: HeaderState::Rejected,
        };
        Ok((record, verdict))
    }

    /// Prefetches the ancestors the validator can reach: the median-time
    /// window, plus the difficulty window the active rule set needs.
    fn branch_slice(&self, parent: Option<&HeaderRecord>) -> Result<AncestorSlice, ChainError> {
        let Some(parent) = parent else {
            return Ok(AncestorSlice::empty());
        };
        let next_height = parent.height + 1;
        let depth = if self.params.daa_active_at(next_height) {
            147
        } else if next_height % self.params.retarget_interval == 0 {
            self.params.retarget_interval as usize
        } else if self.params.allow_min_difficulty_blocks {
            // The min-difficulty walk can run back to the last retarget
            // boundary.
            (next_height % self.params.retarget_interval) as usize + 17
        } else {
            17
        };

        let records = self.store.ancestors_back(&parent.hash, depth)?;
        if records.is_empty() {
            return Err(ChainError::Internal("parent vanished during validation"));
        }
        let lowest = records.last().expect("checked not empty");
        if records.len() < depth && !lowest.is_genesis() {
            return Err(ChainError::Internal("broken parent link below branch"));
        }

        let base = lowest.height;
        let infos: Vec<HeaderInfo> = records
            .iter()
            .rev()
            .map(|record| HeaderInfo {
                height: record.height,
                time: record.time,
                bits: record.bits,
                cumulated_work: record.cumulated_work,
            })
            .collect();
        // Heights must be contiguous for positional lookup.
        for (index, info) in infos.iter().enumerate() {
            if info.height != base + index as u32 {
                return Err(ChainError::Internal("ancestor walk not contiguous"));
            }
        }
        Ok(AncestorSlice { base, infos })
    }
}

struct Fork {
    common: HeaderRecord,
    /// Stale hashes strictly between the common ancestor and the new tip's
    /// parent, oldest first.
    branch: Vec<BlockHash>,
}

/// Contiguous run of ancestors ending at the parent, positionally indexed.
struct AncestorSlice {
    base: u32,
    infos: Vec<HeaderInfo>,
}

impl AncestorSlice {
    fn empty() -> Self {
        Self {
            base: 0,
            infos: Vec::new(),
        }
    }
}

impl BranchView for AncestorSlice {
    fn ancestor(&self, height: u32) -> Option<HeaderInfo> {
        if height < self.base {
            return None;
        }
        self.infos.get((height - self.base) as usize).copied()
    }
}
