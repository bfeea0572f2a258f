//! Chain parameters shared by validation, genesis and block templates.

use serde::{Deserialize, Serialize};

use tessera_core::constants::{
    BLOCK_REWARD, DEFAULT_CHAIN_ID, GENESIS_GAS_LIMIT, MAX_GAS_LIMIT, PROTOCOL_VERSION,
};
use tessera_core::types::{Address, PublicKey};

/// A pre-funded genesis account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub address: Address,
    pub balance: u64,
}

/// Configuration of the chain service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Network identifier every header must carry.
    pub chain_id: u64,
    /// Header version accepted.
    pub version: u32,
    /// Producer set. Leader and minors must be members; empty accepts any signer.
    pub producers: Vec<PublicKey>,
    /// Skip producer-proof verification (single-node test mode).
    pub skip_check_multisig: bool,
    /// Genesis header timestamp (Unix seconds).
    pub genesis_timestamp: u64,
    pub genesis_accounts: Vec<GenesisAccount>,
    /// Lower clamp of the computed gas limit.
    pub gas_floor: u64,
    /// Upper clamp of the computed gas limit.
    pub gas_ceil: u64,
    /// Reward paid per block, split between leader and minors.
    pub block_reward: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: DEFAULT_CHAIN_ID,
            version: PROTOCOL_VERSION,
            producers: Vec::new(),
            skip_check_multisig: false,
            genesis_timestamp: 1_767_225_600,
            genesis_accounts: Vec::new(),
            gas_floor: GENESIS_GAS_LIMIT,
            gas_ceil: MAX_GAS_LIMIT,
            block_reward: BLOCK_REWARD,
        }
    }
}

impl ChainConfig {
    /// Single-node development preset: no proof verification.
    pub fn dev() -> Self {
        Self {
            skip_check_multisig: true,
            ..Self::default()
        }
    }
}
