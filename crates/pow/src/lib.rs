//! Proof-of-work arithmetic and difficulty transition rules.

pub mod compact;
pub mod difficulty;

pub use compact::{block_proof, compact_to_u256, u256_to_compact, CompactError};
pub use difficulty::{median_time_past, next_work_required, BranchView, DifficultyError, HeaderInfo};

use primitive_types::U256;
use pulse_consensus::params::NetworkParams;
use pulse_consensus::BlockHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    TargetOutOfRange,
    HashAboveTarget,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::TargetOutOfRange => write!(f, "compact target outside [1, pow limit]"),
            PowError::HashAboveTarget => write!(f, "header hash above its claimed target"),
        }
    }
}

impl std::error::Error for PowError {}

/// Interprets the hash as a little-endian 256-bit integer, the comparison
/// order used by the proof-of-work rule.
pub fn hash_to_u256(hash: &BlockHash) -> U256 {
    U256::from_little_endian(hash.as_bytes())
}

/// The consensus proof-of-work check: target well-formed, within the
/// network limit, and the hash at or below it.
pub fn check_proof_of_work(
    hash: &BlockHash,
    bits: u32,
    params: &NetworkParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits).map_err(|_| PowError::TargetOutOfRange)?;
    if target.is_zero() || target > params.pow_limit {
        return Err(PowError::TargetOutOfRange);
    }
    if hash_to_u256(hash) > target {
        return Err(PowError::HashAboveTarget);
    }
    Ok(())
}
