//! Per-block gas limit schedule.

use tessera_core::constants::{GAS_LIMIT_SPAN, MIN_GAS_LIMIT};
use tessera_core::types::BlockHeader;

/// Gas limit of the block following `parent`.
///
/// The limit drops by one span when the parent used less than two thirds of
/// its allowance and rises by one span otherwise. The result never goes below
/// [`MIN_GAS_LIMIT`] and is then clamped to `[floor, ceil]`.
pub fn calc_gas_limit(parent: &BlockHeader, floor: u64, ceil: u64) -> u64 {
    let threshold = parent.gas_limit.saturating_mul(2) / 3;
    let mut limit = if threshold > parent.gas_used {
        parent.gas_limit.saturating_sub(GAS_LIMIT_SPAN)
    } else {
        parent.gas_limit.saturating_add(GAS_LIMIT_SPAN)
    };

    limit = limit.max(MIN_GAS_LIMIT);
    if limit < floor {
        limit = floor;
    } else if limit > ceil {
        limit = ceil;
    }
    limit
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::constants::{GENESIS_GAS_LIMIT, MAX_GAS_LIMIT};
    use tessera_core::types::{Hash256, PublicKey};

    fn parent(gas_limit: u64, gas_used: u64) -> BlockHeader {
        BlockHeader {
            chain_id: 1,
            version: 1,
            prev_hash: Hash256::ZERO,
            gas_limit,
            gas_used,
            height: 1,
            timestamp: 1,
            state_root: Hash256::ZERO,
            tx_root: Hash256::ZERO,
            receipt_root: Hash256::ZERO,
            leader: PublicKey::default(),
            minors: vec![],
        }
    }

    #[test]
    fn underused_parent_decreases() {
        let limit = calc_gas_limit(&parent(30_000_000, 0), 0, MAX_GAS_LIMIT);
        assert_eq!(limit, 30_000_000 - GAS_LIMIT_SPAN);
    }

    #[test]
    fn busy_parent_increases() {
        let limit = calc_gas_limit(&parent(30_000_000, 25_000_000), 0, MAX_GAS_LIMIT);
        assert_eq!(limit, 30_000_000 + GAS_LIMIT_SPAN);
    }

    #[test]
    fn clamps_to_minimum() {
        let limit = calc_gas_limit(&parent(GENESIS_GAS_LIMIT, 0), 0, MAX_GAS_LIMIT);
        assert_eq!(limit, MIN_GAS_LIMIT);
    }

    #[test]
    fn clamps_to_floor_and_ceil() {
        assert_eq!(calc_gas_limit(&parent(30_000_000, 0), 40_000_000, MAX_GAS_LIMIT), 40_000_000);
        assert_eq!(
            calc_gas_limit(&parent(MAX_GAS_LIMIT, MAX_GAS_LIMIT), 0, MAX_GAS_LIMIT),
            MAX_GAS_LIMIT
        );
    }
}
