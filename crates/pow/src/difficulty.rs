//! Difficulty transition rules: legacy 2016-block retarget, the post-UAHF
//! emergency adjustment, and the cw-144 moving-average algorithm.

use primitive_types::U256;
use pulse_consensus::params::NetworkParams;

use crate::compact::{compact_to_u256, u256_to_compact, CompactError};

/// Median-time-past window length.
const MTP_BLOCKS: u32 = 11;

/// EDA fires when six blocks took longer than this many seconds.
const EDA_WINDOW_TIMESPAN: i64 = 12 * 60 * 60;

/// The slice of a header record the difficulty rules need.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: u32,
    pub time: u32,
    pub bits: u32,
    pub cumulated_work: U256,
}

/// Ancestor access on the branch being extended. `ancestor(h)` returns the
/// header at height `h` on that branch, up to and including the branch tip.
pub trait BranchView {
    fn ancestor(&self, height: u32) -> Option<HeaderInfo>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    MissingAncestor(u32),
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::MissingAncestor(height) => {
                write!(f, "branch is missing the ancestor at height {height}")
            }
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// Expected `bits` for the block that extends `parent` at `new_block_time`.
pub fn next_work_required(
    parent: &HeaderInfo,
    new_block_time: u32,
    view: &dyn BranchView,
    params: &NetworkParams,
) -> Result<u32, DifficultyError> {
    if params.no_retargeting {
        return Ok(parent.bits);
    }

    let next_height = parent.height + 1;
    if params.daa_active_at(next_height) {
        return cash_work_required(parent, view, params);
    }

    legacy_work_required(parent, new_block_time, view, params)
}

/// Median of the last eleven timestamps ending at `height` (fewer near
/// genesis).
pub fn median_time_past(
    view: &dyn BranchView,
    height: u32,
) -> Result<i64, DifficultyError> {
    let start = height.saturating_sub(MTP_BLOCKS - 1);
    let mut times = Vec::with_capacity(MTP_BLOCKS as usize);
    for h in start..=height {
        let info = view
            .ancestor(h)
            .ok_or(DifficultyError::MissingAncestor(h))?;
        times.push(info.time as i64);
    }
    times.sort_unstable();
    Ok(times[times.len() / 2])
}

fn legacy_work_required(
    parent: &HeaderInfo,
    new_block_time: u32,
    view: &dyn BranchView,
    params: &NetworkParams,
) -> Result<u32, DifficultyError> {
    let next_height = parent.height + 1;

    if next_height % params.retarget_interval == 0 {
        return classic_retarget(parent, view, params);
    }

    if params.allow_min_difficulty_blocks {
        // A block more than two spacings late may be mined at the floor.
        if new_block_time as i64 > parent.time as i64 + 2 * params.target_spacing {
            return Ok(params.pow_limit_bits);
        }
        return last_non_minimum_bits(parent, view, params);
    }

    if params.eda_active_at(next_height) {
        if let Some(bits) = emergency_adjustment(parent, view, params)? {
            return Ok(bits);
        }
    }

    Ok(parent.bits)
}

/// Walks back past min-difficulty blocks to the difficulty that actually
/// governs the chain (testnet rule).
fn last_non_minimum_bits(
    parent: &HeaderInfo,
    view: &dyn BranchView,
    params: &NetworkParams,
) -> Result<u32, DifficultyError> {
    let mut cursor = *parent;
    while cursor.height > 0
        && cursor.height % params.retarget_interval != 0
        && cursor.bits == params.pow_limit_bits
    {
        let prev_height = cursor.height - 1;
        cursor = view
            .ancestor(prev_height)
            .ok_or(DifficultyError::MissingAncestor(prev_height))?;
    }
    Ok(cursor.bits)
}

/// Post-UAHF emergency difficulty adjustment: if the median-time-past moved
/// less than six blocks in twelve hours, difficulty drops 20%.
fn emergency_adjustment(
    parent: &HeaderInfo,
    view: &dyn BranchView,
    params: &NetworkParams,
) -> Result<Option<u32>, DifficultyError> {
    if parent.height < 6 {
        return Ok(None);
    }
    let mtp_tip = median_time_past(view, parent.height)?;
    let mtp_six_ago = median_time_past(view, parent.height - 6)?;
    if mtp_tip - mtp_six_ago <= EDA_WINDOW_TIMESPAN {
        return Ok(None);
    }

    let mut target = compact_to_u256(parent.bits)?;
    target = target + (target >> 2);
    if target > params.pow_limit {
        target = params.pow_limit;
    }
    Ok(Some(u256_to_compact(target)))
}

fn classic_retarget(
    parent: &HeaderInfo,
    view: &dyn BranchView,
    params: &NetworkParams,
) -> Result<u32, DifficultyError> {
    let first_height = (parent.height + 1) - params.retarget_interval;
    let first = view
        .ancestor(first_height)
        .ok_or(DifficultyError::MissingAncestor(first_height))?;

    let mut actual_timespan = parent.time as i64 - first.time as i64;
    let min_timespan = params.target_timespan / 4;
    let max_timespan = params.target_timespan * 4;
    actual_timespan = actual_timespan.clamp(min_timespan, max_timespan);

    let mut target = compact_to_u256(parent.bits)?;
    target = target * U256::from(actual_timespan as u64);
    target = target / U256::from(params.target_timespan as u64);
    if target > params.pow_limit {
        target = params.pow_limit;
    }
    Ok(u256_to_compact(target))
}

/// cw-144: one-day moving window weighted by accumulated work, anchored on
/// median-of-three blocks at both ends.
fn cash_work_required(
    parent: &HeaderInfo,
    view: &dyn BranchView,
    params: &NetworkParams,
) -> Result<u32, DifficultyError> {
    if parent.height < 146 {
        return Ok(params.pow_limit_bits);
    }

    let last = suitable_block(view, parent.height)?;
    let first = suitable_block(view, parent.height - 144)?;

    let mut timespan = last.time as i64 - first.time as i64;
    timespan = timespan.clamp(72 * params.target_spacing, 288 * params.target_spacing);

    let mut work = last.cumulated_work - first.cumulated_work;
    work = work * U256::from(params.target_spacing as u64);
    work = work / U256::from(timespan as u64);
    if work.is_zero() {
        return Ok(params.pow_limit_bits);
    }

    // target = (2^256 - work) / work, with 2^256 - work == !work + 1.
    let mut target = (!work + U256::one()) / work;
    if target > params.pow_limit {
        target = params.pow_limit;
    }
    Ok(u256_to_compact(target))
}

/// Median-by-timestamp of the three consecutive blocks ending at `height`.
fn suitable_block(
    view: &dyn BranchView,
    height: u32,
) -> Result<HeaderInfo, DifficultyError> {
    debug_assert!(height >= 2);
    let mut blocks = [
        view.ancestor(height - 2)
            .ok_or(DifficultyError::MissingAncestor(height - 2))?,
        view.ancestor(height - 1)
            .ok_or(DifficultyError::MissingAncestor(height - 1))?,
        view.ancestor(height)
            .ok_or(DifficultyError::MissingAncestor(height))?,
    ];

    if blocks[0].time > blocks[2].time {
        blocks.swap(0, 2);
    }
    if blocks[0].time > blocks[1].time {
        blocks.swap(0, 1);
    }
    if blocks[1].time > blocks[2].time {
        blocks.swap(1, 2);
    }
    Ok(blocks[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compact::block_proof;
    use pulse_consensus::params::{network_params, Network};

    struct Chain(Vec<HeaderInfo>);

    impl BranchView for Chain {
        fn ancestor(&self, height: u32) -> Option<HeaderInfo> {
            self.0.get(height as usize).copied()
        }
    }

    /// Builds a chain of `len` blocks with fixed spacing and bits.
    fn spaced_chain(len: u32, base_time: u32, spacing: u32, bits: u32) -> Chain {
        let mut headers = Vec::with_capacity(len as usize);
        let mut work = U256::zero();
        for height in 0..len {
            work = work + block_proof(bits).expect("proof");
            headers.push(HeaderInfo {
                height,
                time: base_time + height * spacing,
                bits,
                cumulated_work: work,
            });
        }
        Chain(headers)
    }

    fn pre_daa_params() -> NetworkParams {
        let mut params = network_params(Network::Mainnet);
        params.uahf_height = u32::MAX;
        params.daa_height = u32::MAX;
        params
    }

    #[test]
    fn regtest_never_retargets() {
        let params = network_params(Network::Regtest);
        let chain = spaced_chain(10, 1_296_688_602, 600, params.pow_limit_bits);
        let parent = chain.0.last().copied().expect("tip");
        let bits = next_work_required(&parent, parent.time + 600, &chain, &params)
            .expect("bits");
        assert_eq!(bits, params.pow_limit_bits);
    }

    #[test]
    fn off_boundary_keeps_parent_bits() {
        let params = pre_daa_params();
        let chain = spaced_chain(100, 1_300_000_000, 600, 0x1c0ffff0);
        let parent = chain.0.last().copied().expect("tip");
        let bits = next_work_required(&parent, parent.time + 600, &chain, &params)
            .expect("bits");
        assert_eq!(bits, 0x1c0ffff0);
    }

    #[test]
    fn classic_retarget_on_schedule_is_stable() {
        let params = pre_daa_params();
        // Height 2016 is a boundary; perfectly spaced blocks keep the target.
        let chain = spaced_chain(2016, 1_300_000_000, 600, 0x1c0ffff0);
        let parent = chain.0.last().copied().expect("tip");
        assert_eq!(parent.height, 2015);
        let bits = next_work_required(&parent, parent.time + 600, &chain, &params)
            .expect("bits");
        // The window spans 2015 spacings, not 2016, so the target drifts a
        // fraction of a percent tighter but no further.
        let old = compact_to_u256(0x1c0ffff0).expect("old");
        let new = compact_to_u256(bits).expect("new");
        assert!(new <= old && new >= old - (old >> 7));
    }

    #[test]
    fn classic_retarget_halves_target_for_fast_blocks() {
        let params = pre_daa_params();
        let chain = spaced_chain(2016, 1_300_000_000, 300, 0x1c0ffff0);
        let parent = chain.0.last().copied().expect("tip");
        let bits = next_work_required(&parent, parent.time + 300, &chain, &params)
            .expect("bits");
        let old = compact_to_u256(0x1c0ffff0).expect("old");
        let new = compact_to_u256(bits).expect("new");
        assert!(new < old);
        // Half the timespan, so roughly half the target.
        assert!(new > old / 3 && new < (old * 2) / 3);
    }

    #[test]
    fn classic_retarget_clamps_slow_chains() {
        let params = pre_daa_params();
        // 100x slower than scheduled; adjustment must clamp at 4x.
        let chain = spaced_chain(2016, 1_300_000_000, 60_000, 0x1c0ffff0);
        let parent = chain.0.last().copied().expect("tip");
        let bits = next_work_required(&parent, parent.time + 600, &chain, &params)
            .expect("bits");
        let old = compact_to_u256(0x1c0ffff0).expect("old");
        let new = compact_to_u256(bits).expect("new");
        assert_eq!(new, old * 4);
    }

    #[test]
    fn eda_drops_difficulty_after_stall() {
        let mut params = pre_daa_params();
        params.uahf_height = 0;
        // Twelve-plus hours between consecutive blocks stalls the MTP window.
        let chain = spaced_chain(100, 1_500_000_000, 14_400, 0x1c0ffff0);
        let parent = chain.0.last().copied().expect("tip");
        let bits = next_work_required(&parent, parent.time + 600, &chain, &params)
            .expect("bits");
        let old = compact_to_u256(0x1c0ffff0).expect("old");
        let new = compact_to_u256(bits).expect("new");
        assert_eq!(new, old + (old >> 2));
    }

    #[test]
    fn eda_quiet_when_blocks_flow() {
        let mut params = pre_daa_params();
        params.uahf_height = 0;
        let chain = spaced_chain(100, 1_500_000_000, 600, 0x1c0ffff0);
        let parent = chain.0.last().copied().expect("tip");
        let bits = next_work_required(&parent, parent.time + 600, &chain, &params)
            .expect("bits");
        assert_eq!(bits, 0x1c0ffff0);
    }

    #[test]
    fn daa_stable_under_perfect_spacing() {
        let mut params = network_params(Network::Mainnet);
        params.uahf_height = 0;
        params.daa_height = 0;
        let chain = spaced_chain(200, 1_510_000_000, 600, 0x1c0ffff0);
        let parent = chain.0.last().copied().expect("tip");
        let bits = next_work_required(&parent, parent.time + 600, &chain, &params)
            .expect("bits");
        let old = compact_to_u256(0x1c0ffff0).expect("old");
        let new = compact_to_u256(bits).expect("new");
        // Work-per-second is exactly on schedule; target stays within
        // rounding of the old one.
        assert!(new >= old - (old >> 8) && new <= old + (old >> 8));
    }

    #[test]
    fn daa_tightens_for_fast_blocks() {
        let mut params = network_params(Network::Mainnet);
        params.uahf_height = 0;
        params.daa_height = 0;
        let chain = spaced_chain(200, 1_510_000_000, 300, 0x1c0ffff0);
        let parent = chain.0.last().copied().expect("tip");
        let bits = next_work_required(&parent, parent.time + 300, &chain, &params)
            .expect("bits");
        let old = compact_to_u256(0x1c0ffff0).expect("old");
        let new = compact_to_u256(bits).expect("new");
        assert!(new < old);
    }

    #[test]
    fn daa_needs_history() {
        let mut params = network_params(Network::Mainnet);
        params.uahf_height = 0;
        params.daa_height = 0;
        let chain = spaced_chain(10, 1_510_000_000, 600, 0x1c0ffff0);
        let parent = chain.0.last().copied().expect("tip");
        let bits = next_work_required(&parent, parent.time + 600, &chain, &params)
            .expect("bits");
        assert_eq!(bits, params.pow_limit_bits);
    }

    #[test]
    fn testnet_min_difficulty_gap() {
        let params = network_params(Network::Testnet);
        let chain = spaced_chain(100, 1_300_000_000, 600, 0x1c0ffff0);
        let parent = chain.0.last().copied().expect("tip");
        // 21 minutes after the parent: the floor applies.
        let bits = next_work_required(&parent, parent.time + 1260, &chain, &params)
            .expect("bits");
        assert_eq!(bits, params.pow_limit_bits);
        // On schedule: the real difficulty applies.
        let bits = next_work_required(&parent, parent.time + 600, &chain, &params)
            .expect("bits");
        assert_eq!(bits, 0x1c0ffff0);
    }

    #[test]
    fn median_time_past_is_median() {
        let chain = spaced_chain(20, 1_000_000, 600, 0x1c0ffff0);
        let mtp = median_time_past(&chain, 15).expect("mtp");
        // Heights 5..=15, median at height 10.
        assert_eq!(mtp, 1_000_000 + 10 * 600);
    }
}
