//! Proof-of-work arithmetic: the work metric, the halving schedule and the
//! difficulty retarget.

use crate::config;
use crate::error::{NodeError, Result};
use crate::types::BlockHeader;
use crate::U256;
use bigdecimal::BigDecimal;

/// Expected number of hash attempts to find a block at `target`:
/// `2^256 / (target + 1)`. Computed as `(!target / (target + 1)) + 1` so the
/// numerator never overflows 256 bits. The sum of this value along a chain
/// is the sole tie-breaker between competing chains.
pub fn block_work(target: U256) -> U256 {
    if target == U256::MAX {
        return U256::one();
    }
    (!target / (target + U256::one())) + U256::one()
}

/// Scheduled coinbase subsidy at a height: the initial reward halved once
/// per halving interval. Zero after 64 halvings, when the shift would
/// discard every bit.
pub fn block_subsidy(height: u64) -> u64 {
    let halvings = height / config::halving_interval();
    if halvings >= 64 {
        0
    } else {
        (config::initial_reward() * 10u64.pow(8)) >> halvings
    }
}

/// Scale `current_target` by observed/expected timespan, clamped to the
/// configured factor in both directions and floored at the minimum
/// difficulty.
///
/// U256 has no division by a ratio, so the scaling runs through BigDecimal
/// and truncates back to an integer target.
pub fn retarget(current_target: U256, actual_seconds: i64, expected_seconds: u64) -> U256 {
    let new_target = BigDecimal::parse_bytes(current_target.to_string().as_bytes(), 10)
        .expect("BUG: impossible")
        * (BigDecimal::from(actual_seconds) / BigDecimal::from(expected_seconds));

    let new_target_str = new_target
        .to_string()
        .split('.')
        .next()
        .expect("BUG: Expected a decimal point")
        .to_owned();
    let new_target = U256::from_str_radix(&new_target_str, 10).expect("BUG: impossible");

    // Clamp the step to the retarget factor in either direction
    let factor = U256::from(config::max_retarget_factor());
    let new_target = if new_target < current_target / factor {
        current_target / factor
    } else if new_target > current_target * factor {
        current_target * factor
    } else {
        new_target
    };

    // Never easier than the configured minimum difficulty
    new_target.min(config::min_target())
}

/// Validate a header range received during catch-up: contiguous heights,
/// each header linking to the previous one's hash, and each proving its
/// stated work. Target-schedule and timestamp rules are enforced later when
/// the bodies connect.
pub fn validate_header_chain(headers: &[BlockHeader]) -> Result<()> {
    for pair in headers.windows(2) {
        if pair[1].prev_block_hash != pair[0].hash() {
            return Err(NodeError::invalid_block_header(
                "header range does not link",
            ));
        }
        if pair[1].height != pair[0].height + 1 {
            return Err(NodeError::invalid_block_header(
                "header heights not contiguous",
            ));
        }
    }
    for header in headers {
        if !header.hash().matches_target(header.target) {
            return Err(NodeError::invalid_block_header(
                "header does not prove its stated work",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::U256;

    #[test]
    fn test_block_work_is_inverse_of_target() {
        let easy = U256::MAX;
        let hard = U256::MAX / 1024;
        assert!(block_work(hard) > block_work(easy));
        assert_eq!(block_work(easy), U256::one());
        // Halving the target roughly doubles the work
        let work = block_work(crate::MIN_TARGET);
        let double_work = block_work(crate::MIN_TARGET / 2);
        assert!(double_work >= work * 2 - 2 && double_work <= work * 2 + 2);
    }

    #[test]
    fn test_block_subsidy_halves_and_terminates() {
        let initial = crate::config::initial_reward() * 10u64.pow(8);
        let interval = crate::config::halving_interval();
        assert_eq!(block_subsidy(0), initial);
        assert_eq!(block_subsidy(interval - 1), initial);
        assert_eq!(block_subsidy(interval), initial / 2);
        assert_eq!(block_subsidy(interval * 64), 0);
    }

    #[test]
    fn test_schedule_total_matches_supply_cap() {
        let interval = crate::config::halving_interval();
        let mut total: u64 = 0;
        for halving in 0..64 {
            total += block_subsidy(halving * interval) * interval;
        }
        assert_eq!(total, crate::config::max_supply());
    }

    #[test]
    fn test_retarget_scales_with_time() {
        let current = crate::MIN_TARGET / 16;
        // Twice as slow as expected: target doubles (easier)
        assert_eq!(retarget(current, 1000, 500), current * 2);
        // Twice as fast: target halves (harder)
        assert_eq!(retarget(current, 250, 500), current / 2);
        // Unchanged pace: same target
        assert_eq!(retarget(current, 500, 500), current);
    }

    #[test]
    fn test_retarget_clamps_extremes() {
        let current = crate::MIN_TARGET / 16;
        let factor = crate::config::max_retarget_factor();
        assert_eq!(retarget(current, 500 * 100, 500), current * factor);
        assert_eq!(retarget(current, 5, 500), current / factor);
    }

    #[test]
    fn test_retarget_respects_min_target() {
        // Already at the easiest difficulty; slow blocks cannot go easier
        assert_eq!(retarget(crate::MIN_TARGET, 1000, 500), crate::MIN_TARGET);
    }
}
