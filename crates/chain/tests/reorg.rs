//! Fork resolution: chainwork races, reorg events, and the confirmation
//! depth cutoff.

use std::sync::{Arc, Mutex};

use pulse_chain::{
    AcceptOutcome, ChainEvent, ChainOptions, ChainService, Clock, EventSink,
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

#[derive(Default)]
struct CollectSink(Mutex<Vec<ChainEvent>>);

impl EventSink for CollectSink {
    fn publish(&self, event: ChainEvent) {
        self.0.lock().expect("sink lock").push(event);
    }
}

impl CollectSink {
    fn reorgs(&self) -> Vec<ChainEvent> {
        self.0
            .lock()
            .expect("sink lock")
            .iter()
            .filter(|event| matches!(event, ChainEvent::Reorg { .. }))
            .cloned()
            .collect()
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

fn service_with(
    options: ChainOptions,
) -> (Arc<CollectSink>, ChainService<MemoryHeaderStore>, NetworkParams) {
    let params = network_params(Network::Regtest);
    let store = MemoryHeaderStore::new();
    store.migrate().expect("migrate");
    let sink = Arc::new(CollectSink::default());
    let service = ChainService::new(store, params.clone(), options)
        .with_sink(sink.clone())
        .with_clock(Arc::new(FixedClock(BASE_TIME as i64 + 600 * 600)));
    (sink, service, params)
}

#[test]
fn heavier_branch_wins() {
    let (sink, service, params) = service_with(ChainOptions::default());
    service
        .accept_header(BlockHeader::genesis(&params))
        .expect("genesis");

    let branch_a = mine_chain(params.genesis_hash, 1, 5, 0xa0, &params);
    service.accept_header_batch(&branch_a).expect("branch a");
    let tip_a = service.tip().expect("tip").expect("tip");
    assert_eq!(tip_a.height, 5);

    let branch_b = mine_chain(params.genesis_hash, 1, 6, 0xb0, &params);
    for (i, header) in branch_b.iter().enumerate() {
        assert_eq!(
            service.accept_header(*header).expect("branch b"),
            AcceptOutcome::Accepted,
            "b{} should be accepted",
            i + 1
        );
    }

    let tip = service.tip().expect("tip").expect("tip");
    assert_eq!(tip.height, 6);
    assert_eq!(tip.hash, branch_b.last().expect("last").hash());

    // Exactly one reorg, rooted at genesis, five blocks deep.
    let reorgs = sink.reorgs();
    assert_eq!(reorgs.len(), 1);
    assert_eq!(
        reorgs[0],
        ChainEvent::Reorg {
            from: tip_a.hash,
            to: tip.hash,
            common: params.genesis_hash,
            depth: 5,
        }
    );

    // Every losing-branch record is stale, every winner longest-chain.
    for header in &branch_a {
        let record = service
            .header(&header.hash())
            .expect("query")
            .expect("kept");
        assert_eq!(record.state, HeaderState::Stale);
    }
    for header in &branch_b {
        let record = service
            .header(&header.hash())
            .expect("query")
            .expect("kept");
        assert_eq!(record.state, HeaderState::LongestChain);
    }
}

#[test]
fn equal_work_keeps_first_seen_tip() {
    let (sink, service, params) = service_with(ChainOptions::default());
    service
        .accept_header(BlockHeader::genesis(&params))
        .expect("genesis");

    let branch_a = mine_chain(params.genesis_hash, 1, 3, 0xa0, &params);
    service.accept_header_batch(&branch_a).expect("branch a");
    let incumbent = service.tip().expect("tip").expect("tip");

    // Same length, same per-block work: a dead heat.
    let branch_b = mine_chain(params.genesis_hash, 1, 3, 0xb0, &params);
    service.accept_header_batch(&branch_b).expect("branch b");

    let tip = service.tip().expect("tip").expect("tip");
    assert_eq!(tip.hash, incumbent.hash);
    assert!(sink.reorgs().is_empty());
    assert_eq!(
        service
            .header(&branch_b[2].hash())
            .expect("query")
            .expect("kept")
            .state,
        HeaderState::Stale
    );
}

#[test]
fn reorg_within_confirmation_window_switches_back_and_forth() {
    let (sink, service, params) = service_with(ChainOptions::default());
    service
        .accept_header(BlockHeader::genesis(&params))
        .expect("genesis");

    let trunk = mine_chain(params.genesis_hash, 1, 20, 0x10, &params);
    service.accept_header_batch(&trunk).expect("trunk");

    // Fork three below the tip and overtake by one.
    let fork_parent = trunk[16].hash(); // height 17
    let rival = mine_chain(fork_parent, 18, 4, 0x20, &params);
    service.accept_header_batch(&rival).expect("rival");

    let tip = service.tip().expect("tip").expect("tip");
    assert_eq!(tip.height, 21);
    assert_eq!(tip.hash, rival.last().expect("last").hash());

    let reorgs = sink.reorgs();
    assert_eq!(reorgs.len(), 1);
    let ChainEvent::Reorg { common, depth, .. } = reorgs[0].clone() else {
        panic!("expected reorg event");
    };
    assert_eq!(common, fork_parent);
    assert_eq!(depth, 3);

    // Heights between fork and old tip now resolve to the rival branch.
    assert_eq!(
        service
            .header_by_height(18)
            .expect("query")
            .expect("present")
            .hash,
        rival[0].hash()
    );
}

#[test]
fn deep_fork_is_never_adopted() {
    let (sink, service, params) = service_with(ChainOptions {
        blocks_for_fork_confirmation: 10,
        ..ChainOptions::default()
    });
    service
        .accept_header(BlockHeader::genesis(&params))
        .expect("genesis");

    let trunk = mine_chain(params.genesis_hash, 1, 100, 0x10, &params);
    service.accept_header_batch(&trunk).expect("trunk");
    let tip_before = service.tip().expect("tip").expect("tip");
    assert_eq!(tip_before.height, 100);

    // Diverge at height 85: deeper than the 10-block confirmation window.
    let fork_parent = trunk[84].hash();
    let rival = mine_chain(fork_parent, 86, 16, 0x20, &params);
    let outcomes = service.accept_header_batch(&rival).expect("rival");
    assert!(outcomes.iter().all(|o| *o == AcceptOutcome::Accepted));

    // Heavier, but refused: the tip is unchanged and the branch is stale.
    let tip = service.tip().expect("tip").expect("tip");
    assert_eq!(tip.hash, tip_before.hash);
    assert!(sink.reorgs().is_empty());
    for header in &rival {
        assert_eq!(
            service
                .header(&header.hash())
                .expect("query")
                .expect("kept")
                .state,
            HeaderState::Stale
        );
    }

    let last_rival = service
        .header(&rival.last().expect("last").hash())
        .expect("query")
        .expect("kept");
    assert!(last_rival.cumulated_work > tip.cumulated_work);
}

#[test]
fn divergence_exactly_at_window_edge_is_adopted() {
    let (sink, service, params) = service_with(ChainOptions {
        blocks_for_fork_confirmation: 10,
        ..ChainOptions::default()
    });
    service
        .accept_header(BlockHeader::genesis(&params))
        .expect("genesis");

    let trunk = mine_chain(params.genesis_hash, 1, 20, 0x10, &params);
    service.accept_header_batch(&trunk).expect("trunk");

    // Common ancestor at height 10, exactly tip − 10.
    let fork_parent = trunk[9].hash();
    let rival = mine_chain(fork_parent, 11, 11, 0x20, &params);
    service.accept_header_batch(&rival).expect("rival");

    let tip = service.tip().expect("tip").expect("tip");
    assert_eq!(tip.hash, rival.last().expect("last").hash());
    assert_eq!(sink.reorgs().len(), 1);
}
