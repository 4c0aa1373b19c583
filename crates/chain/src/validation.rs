//! Pure consensus checks for one candidate header.

use std::fmt;

use pulse_consensus::constants::MAX_FUTURE_BLOCK_TIME;
use pulse_consensus::params::NetworkParams;
use pulse_consensus::BlockHash;
use pulse_pow::difficulty::BranchView;
use pulse_pow::{check_proof_of_work, median_time_past, next_work_required, HeaderInfo};
use pulse_primitives::BlockHeader;
use pulse_store::HeaderRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationError {
    HashMismatch,
    InvalidPoW,
    InvalidTimestamp,
    InvalidDifficulty,
    InvalidVersion,
}

impl ValidationError {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationError::HashMismatch => "hash mismatch",
            ValidationError::InvalidPoW => "invalid proof of work",
            ValidationError::InvalidTimestamp => "invalid timestamp",
            ValidationError::InvalidDifficulty => "invalid difficulty",
            ValidationError::InvalidVersion => "invalid version",
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ValidationError {}

/// Everything the checks need besides the candidate itself. The branch view
/// covers the parent's branch up to and including the parent.
pub struct ValidationContext<'a> {
    pub parent: Option<&'a HeaderRecord>,
    pub branch: &'a dyn BranchView,
    pub now: i64,
    pub params: &'a NetworkParams,
}

/// Validates `header` against its parent chain. Checks run in a fixed
/// order and stop at the first failure.
pub fn validate_header(
    header: &BlockHeader,
    claimed_hash: &BlockHash,
    ctx: &ValidationContext<'_>,
) -> Result<(), ValidationError> {
    let hash = header.hash();
    if hash != *claimed_hash {
        return Err(ValidationError::HashMismatch);
    }

    let Some(parent) = ctx.parent else {
        // Genesis: nothing to derive difficulty or timestamps from; the one
        // admissible header is pinned by the network parameters.
        if hash == ctx.params.genesis_hash {
            return Ok(());
        }
        return Err(ValidationError::HashMismatch);
    };

    check_proof_of_work(&hash, header.bits, ctx.params)
        .map_err(|_| ValidationError::InvalidPoW)?;

    let mtp = median_time_past(ctx.branch, parent.height)
        .map_err(|_| ValidationError::InvalidTimestamp)?;
    if (header.time as i64) <= mtp {
        return Err(ValidationError::InvalidTimestamp);
    }
    if (header.time as i64) > ctx.now + MAX_FUTURE_BLOCK_TIME {
        return Err(ValidationError::InvalidTimestamp);
    }

    let parent_info = HeaderInfo {
        height: parent.height,
        time: parent.time,
        bits: parent.bits,
        cumulated_work: parent.cumulated_work,
    };
    let expected_bits = next_work_required(&parent_info, header.time, ctx.branch, ctx.params)
        .map_err(|_| ValidationError::InvalidDifficulty)?;
    if header.bits != expected_bits {
        pulse_log::log_warn!(
            "unexpected difficulty bits at height {}: expected {:#x}, got {:#x}",
            parent.height + 1,
            expected_bits,
            header.bits
        );
        return Err(ValidationError::InvalidDifficulty);
    }

    let height = parent.height + 1;
    if header.version < ctx.params.min_version_at(height) {
        return Err(ValidationError::InvalidVersion);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_consensus::params::{network_params, Network};
    use pulse_pow::difficulty::DifficultyError;

    struct EmptyBranch;

    impl BranchView for EmptyBranch {
        fn ancestor(&self, _height: u32) -> Option<HeaderInfo> {
            None
        }
    }

    #[test]
    fn genesis_accepted_only_with_pinned_hash() {
        let params = network_params(Network::Regtest);
        let genesis = BlockHeader::genesis(&params);
        let ctx = ValidationContext {
            parent: None,
            branch: &EmptyBranch,
            now: 2_000_000_000,
            params: &params,
        };
        assert_eq!(validate_header(&genesis, &genesis.hash(), &ctx), Ok(()));

        let mut wrong = genesis;
        wrong.nonce += 1;
        assert_eq!(
            validate_header(&wrong, &wrong.hash(), &ctx),
            Err(ValidationError::HashMismatch)
        );
    }

    #[test]
    fn claimed_hash_must_match() {
        let params = network_params(Network::Regtest);
        let genesis = BlockHeader::genesis(&params);
        let ctx = ValidationContext {
            parent: None,
            branch: &EmptyBranch,
            now: 2_000_000_000,
            params: &params,
        };
        assert_eq!(
            validate_header(&genesis, &BlockHash::ZERO, &ctx),
            Err(ValidationError::HashMismatch)
        );
    }

    #[test]
    fn missing_ancestors_surface_as_timestamp_failure() {
        // A parent with no reachable branch cannot produce an MTP.
        let err = median_time_past(&EmptyBranch, 5);
        assert_eq!(err, Err(DifficultyError::MissingAncestor(0)));
    }
}
