//! Deterministic genesis block built from [`ChainConfig`].
//!
//! The genesis header commits to the state root of the pre-funded accounts;
//! [`apply_genesis`] writes the same accounts into a store transaction.

use std::collections::BTreeMap;

use tessera_core::constants::GENESIS_GAS_LIMIT;
use tessera_core::error::ChainError;
use tessera_core::merkle;
use tessera_core::store::{StateDb, compute_state_root};
use tessera_core::types::{Account, Address, Block, BlockHeader, Hash256, Proof};

use crate::config::ChainConfig;

/// Genesis allocations, duplicate addresses summed.
fn allocations(config: &ChainConfig) -> BTreeMap<Address, Account> {
    let mut accounts: BTreeMap<Address, Account> = BTreeMap::new();
    for entry in &config.genesis_accounts {
        let account = accounts.entry(entry.address).or_default();
        account.balance = account.balance.saturating_add(entry.balance);
    }
    accounts
}

/// Build the genesis block for `config`.
pub fn genesis_block(config: &ChainConfig) -> Block {
    let accounts = allocations(config);
    let header = BlockHeader {
        chain_id: config.chain_id,
        version: config.version,
        prev_hash: Hash256::ZERO,
        gas_limit: GENESIS_GAS_LIMIT,
        gas_used: 0,
        height: 0,
        timestamp: config.genesis_timestamp,
        state_root: compute_state_root(accounts.iter()),
        tx_root: merkle::tx_root(&[]),
        receipt_root: Hash256::ZERO,
        leader: config.producers.first().copied().unwrap_or_default(),
        minors: config.producers.clone(),
    };
    Block {
        header,
        proof: Proof::default(),
        transactions: Vec::new(),
    }
}

/// Write the genesis allocations into `state`.
pub fn apply_genesis(state: &mut dyn StateDb, config: &ChainConfig) -> Result<(), ChainError> {
    for (addr, account) in allocations(config) {
        state.put_account(&addr, account)?;
    }
    Ok(())
}
