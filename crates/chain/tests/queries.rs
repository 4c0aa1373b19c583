//! Query-surface behavior: locators, confirmations, ancestry, and the
//! any-order ingestion property.

use std::sync::Arc;

use pulse_chain::{
    AcceptOutcome, ChainOptions, ChainService, Clock, ConfirmationState,
};
use pulse_consensus::params::{network_params, Network, NetworkParams};
use pulse_consensus::BlockHash;
use pulse_pow::check_proof_of_work;
use pulse_primitives::BlockHeader;
use pulse_store::{HeaderState, HeaderStore, MemoryHeaderStore};

const BASE_TIME: u32 = 1_296_688_602;

struct FixedClock(i64);

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.0
    }
}

fn mine(prev: BlockHash, time: u32, tag: u8, params: &NetworkParams) -> BlockHeader {
    let mut merkle = [0u8; 32];
    merkle[0] = tag;
    let mut header = BlockHeader {
        version: 1,
        prev_hash: prev,
        merkle_root: BlockHash::from_bytes(merkle),
        time,
        bits: params.pow_limit_bits,
        nonce: 0,
    };
    while check_proof_of_work(&header.hash(), header.bits, params).is_err() {
        header.nonce += 1;
    }
    header
}

fn mine_chain(
    prev: BlockHash,
    start_height: u32,
    count: u32,
    tag: u8,
    params: &NetworkParams,
) -> Vec<BlockHeader> {
    let mut out = Vec::with_capacity(count as usize);
    let mut prev = prev;
    for i in 0..count {
        let header = mine(prev, BASE_TIME + (start_height + i) * 600, tag, params);
        prev = header.hash();
        out.push(header);
    }
    out
}

fn service() -> (ChainService<MemoryHeaderStore>, NetworkParams) {
    let params = network_params(Network::Regtest);
    let store = MemoryHeaderStore::new();
    store.migrate().expect("migrate");
    let service = ChainService::new(store, params.clone(), ChainOptions::default())
        .with_clock(Arc::new(FixedClock(BASE_TIME as i64 + 600 * 600)));
    (service, params)
}

#[test]
fn merkle_root_confirmations() {
    let (service, params) = service();
    service
        .accept_header(BlockHeader::genesis(&params))
        .expect("genesis");
    let headers = mine_chain(params.genesis_hash, 1, 10, 0x11, &params);
    service.accept_header_batch(&headers).expect("batch");

    let known_root = headers[4].merkle_root;
    let results = service
        .confirm_merkle_roots(&[
            (known_root, 5),
            // Right root, wrong height.
            (known_root, 6),
            // A height just past the tip, within the tolerated excess.
            (known_root, 11),
            // Beyond tip + MaxBlockHeightExcess.
            (known_root, 10 + 6 + 1),
        ])
        .expect("confirmations");

    assert_eq!(results[0].confirmation, ConfirmationState::Confirmed);
    assert_eq!(results[0].block_hash, Some(headers[4].hash()));
    assert_eq!(results[1].confirmation, ConfirmationState::Invalid);
    assert_eq!(results[2].confirmation, ConfirmationState::UnableToVerify);
    assert_eq!(results[3].confirmation, ConfirmationState::Invalid);
}

#[test]
fn locator_is_sparse_and_anchored() {
    let (service, params) = service();
    service
        .accept_header(BlockHeader::genesis(&params))
        .expect("genesis");
    let headers = mine_chain(params.genesis_hash, 1, 100, 0x22, &params);
    service.accept_header_batch(&headers).expect("batch");

    let locator = service.locator().expect("locator");
    // Heights 100, 99, 98, 96, 92, 84, 68, 36, 0.
    assert_eq!(locator.len(), 9);
    assert_eq!(locator[0], headers[99].hash());
    assert_eq!(locator[1], headers[98].hash());
    assert_eq!(locator[2], headers[97].hash());
    assert_eq!(locator[3], headers[95].hash());
    assert_eq!(*locator.last().expect("anchor"), params.genesis_hash);
}

#[test]
fn headers_from_locator_resumes_after_best_match() {
    let (service, params) = service();
    service
        .accept_header(BlockHeader::genesis(&params))
        .expect("genesis");
    let headers = mine_chain(params.genesis_hash, 1, 30, 0x33, &params);
    service.accept_header_batch(&headers).expect("batch");

    // Locator knows height 20; unknown hashes in front are skipped.
    let locator = vec![
        BlockHash::from_bytes([0xde; 32]),
        headers[19].hash(),
        headers[9].hash(),
    ];
    let batch = service
        .headers_from_locator(&locator, &BlockHash::ZERO)
        .expect("headers");
    assert_eq!(batch.len(), 10);
    assert_eq!(batch[0].hash, headers[20].hash());
    assert_eq!(batch[9].hash, headers[29].hash());

    // A stop hash truncates the walk inclusively.
    let batch = service
        .headers_from_locator(&locator, &headers[24].hash())
        .expect("headers");
    assert_eq!(batch.len(), 5);
    assert_eq!(batch.last().expect("last").hash, headers[24].hash());

    // No match at all restarts from genesis.
    let batch = service
        .headers_from_locator(&[BlockHash::from_bytes([0xdd; 32])], &BlockHash::ZERO)
        .expect("headers");
    assert_eq!(batch[0].hash, params.genesis_hash);
}

#[test]
fn stale_locator_entries_are_ignored() {
    let (service, params) = service();
    service
        .accept_header(BlockHeader::genesis(&params))
        .expect("genesis");
    let trunk = mine_chain(params.genesis_hash, 1, 6, 0x44, &params);
    service.accept_header_batch(&trunk).expect("trunk");

    // A losing fork of height 3.
    let rival = mine_chain(params.genesis_hash, 1, 3, 0x55, &params);
    service.accept_header_batch(&rival).expect("rival");
    assert_eq!(
        service
            .header(&rival[2].hash())
            .expect("query")
            .expect("kept")
            .state,
        HeaderState::Stale
    );

    // A peer on the losing branch still gets the main chain from genesis.
    let batch = service
        .headers_from_locator(&[rival[2].hash()], &BlockHash::ZERO)
        .expect("headers");
    assert_eq!(batch[0].hash, params.genesis_hash);
    assert_eq!(batch.len(), 7);
}

#[test]
fn common_ancestor_of_forked_tips() {
    let (service, params) = service();
    service
        .accept_header(BlockHeader::genesis(&params))
        .expect("genesis");
    let trunk = mine_chain(params.genesis_hash, 1, 8, 0x66, &params);
    service.accept_header_batch(&trunk).expect("trunk");

    let fork_parent = trunk[3].hash(); // height 4
    let rival = mine_chain(fork_parent, 5, 2, 0x77, &params);
    service.accept_header_batch(&rival).expect("rival");

    let common = service
        .common_ancestor(&[trunk[7].hash(), rival[1].hash()])
        .expect("walk")
        .expect("found");
    assert_eq!(common.hash, fork_parent);

    // Any unknown participant collapses the answer.
    assert!(service
        .common_ancestor(&[trunk[7].hash(), BlockHash::from_bytes([1; 32])])
        .expect("walk")
        .is_none());
}

#[test]
fn ancestors_walk_stops_at_genesis() {
    let (service, params) = service();
    service
        .accept_header(BlockHeader::genesis(&params))
        .expect("genesis");
    let headers = mine_chain(params.genesis_hash, 1, 5, 0x88, &params);
    service.accept_header_batch(&headers).expect("batch");

    let walk = service
        .ancestors(&headers[4].hash(), 100)
        .expect("ancestors");
    assert_eq!(walk.len(), 6);
    assert_eq!(walk[0].height, 5);
    assert_eq!(walk[5].height, 0);
}

/// Any-order ingestion: after the orphan pool drains, the chain is intact.
#[test]
fn shuffled_feed_converges_to_the_same_chain() {
    let (service, params) = service();
    let genesis = BlockHeader::genesis(&params);
    let headers = mine_chain(params.genesis_hash, 1, 30, 0x99, &params);

    let mut feed: Vec<BlockHeader> = Vec::with_capacity(31);
    feed.push(genesis);
    feed.extend_from_slice(&headers);

    // Deterministic shuffle; no randomness in tests.
    let mut state = 0x2545_f491_4f6c_dd1du64;
    for i in (1..feed.len()).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let j = (state % (i as u64 + 1)) as usize;
        feed.swap(i, j);
    }

    for header in &feed {
        let outcome = service.accept_header(*header).expect("accept");
        assert!(matches!(
            outcome,
            AcceptOutcome::Accepted | AcceptOutcome::Orphaned
        ));
    }

    assert_eq!(service.orphan_count(), 0);
    let tip = service.tip().expect("tip").expect("tip");
    assert_eq!(tip.height, 30);
    assert_eq!(tip.hash, headers[29].hash());

    // Structural invariants: contiguous longest chain, correct parent
    // links, monotone cumulative work.
    let mut prev: Option<pulse_store::HeaderRecord> = None;
    for height in 0..=30u32 {
        let record = service
            .header_by_height(height)
            .expect("query")
            .expect("present");
        assert_eq!(record.state, HeaderState::LongestChain);
        assert_eq!(record.height, height);
        if let Some(prev) = &prev {
            assert_eq!(record.prev_hash, prev.hash);
            assert!(record.cumulated_work > prev.cumulated_work);
            assert_eq!(
                record.cumulated_work,
                prev.cumulated_work + record.chainwork
            );
        }
        prev = Some(record);
    }
}
