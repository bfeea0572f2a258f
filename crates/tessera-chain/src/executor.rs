//! Default execution collaborators: value transfers and the leader/minor
//! reward split.

use tracing::trace;

use tessera_core::constants::TX_GAS;
use tessera_core::error::{BlockError, ChainError};
use tessera_core::store::StateDb;
use tessera_core::traits::{BlockExecutor, ExecutionOutcome, RewardDistributor};
use tessera_core::types::{Account, Block, Transaction};

/// Executes plain value transfers at a flat [`TX_GAS`] per transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferExecutor;

impl BlockExecutor for TransferExecutor {
    fn execute_transaction(
        &self,
        state: &mut dyn StateDb,
        tx: &Transaction,
        gas_remaining: u64,
    ) -> Result<ExecutionOutcome, ChainError> {
        let gas = TX_GAS;
        if tx.gas_limit < gas {
            return Err(BlockError::Execution(format!(
                "intrinsic gas too low: {} < {gas}",
                tx.gas_limit
            ))
            .into());
        }
        if gas > gas_remaining {
            return Err(BlockError::Execution("block gas limit reached".into()).into());
        }

        let sender = tx.sender();
        let account = state.account(&sender)?.unwrap_or_default();
        if tx.nonce != account.nonce {
            return Err(BlockError::Execution(format!(
                "nonce mismatch for {sender}: got {}, expected {}",
                tx.nonce, account.nonce
            ))
            .into());
        }
        let fee = gas
            .checked_mul(tx.gas_price)
            .ok_or_else(|| BlockError::Execution("fee overflow".into()))?;
        let cost = tx
            .amount
            .checked_add(fee)
            .ok_or_else(|| BlockError::Execution("cost overflow".into()))?;
        if account.balance < cost {
            return Err(BlockError::Execution(format!(
                "insufficient balance for {sender}: have {}, need {cost}",
                account.balance
            ))
            .into());
        }
        if tx.to != sender {
            let recipient = state.balance(&tx.to)?;
            if recipient.checked_add(tx.amount).is_none() {
                return Err(BlockError::Execution("recipient balance overflow".into()).into());
            }
        }

        // All checks passed; nothing below can fail on arithmetic.
        state.put_account(
            &sender,
            Account {
                balance: account.balance - cost,
                nonce: account.nonce + 1,
            },
        )?;
        state.add_balance(&tx.to, tx.amount)?;
        trace!(%sender, to = %tx.to, amount = tx.amount, fee, "chain: executed transfer");

        Ok(ExecutionOutcome { gas_used: gas, gas_fee: fee })
    }
}

/// Pays `reward / 2 + gas_fee` to the leader and `reward / (2n)` to each of
/// the `n` minors other than the leader.
#[derive(Debug, Clone, Copy)]
pub struct LeaderMinorReward {
    reward: u64,
}

impl LeaderMinorReward {
    pub fn new(reward: u64) -> Self {
        Self { reward }
    }
}

impl RewardDistributor for LeaderMinorReward {
    fn apply_reward(
        &self,
        state: &mut dyn StateDb,
        block: &Block,
        gas_fee: u64,
    ) -> Result<(), ChainError> {
        let leader = block.header.leader;
        let leader_share = (self.reward / 2)
            .checked_add(gas_fee)
            .ok_or_else(|| BlockError::Execution("reward overflow".into()))?;
        state.add_balance(&leader.address(), leader_share)?;

        let minors = &block.header.minors;
        if minors.is_empty() {
            return Ok(());
        }
        let minor_share = self.reward / (2 * minors.len() as u64);
        for minor in minors.iter().filter(|m| **m != leader) {
            state.add_balance(&minor.address(), minor_share)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::store::MemoryChainStore;
    use tessera_core::types::{Address, BlockHeader, Hash256, Proof, PublicKey};

    fn transfer(from: PublicKey, nonce: u64, amount: u64) -> Transaction {
        Transaction {
            nonce,
            from,
            to: Address([9; 20]),
            amount,
            gas_price: 1,
            gas_limit: TX_GAS,
            data: vec![],
            signature: vec![],
        }
    }

    fn funded(key: PublicKey, balance: u64) -> MemoryChainStore {
        let mut store = MemoryChainStore::new();
        store.add_balance(&key.address(), balance).unwrap();
        store
    }

    // --- TransferExecutor ---

    #[test]
    fn transfer_moves_funds_and_bumps_nonce() {
        let alice = PublicKey([1; 32]);
        let mut store = funded(alice, 100_000);
        let out = TransferExecutor
            .execute_transaction(&mut store, &transfer(alice, 0, 500), TX_GAS)
            .unwrap();
        assert_eq!(out, ExecutionOutcome { gas_used: TX_GAS, gas_fee: TX_GAS });
        assert_eq!(store.balance(&alice.address()).unwrap(), 100_000 - 500 - TX_GAS);
        assert_eq!(store.nonce(&alice.address()).unwrap(), 1);
        assert_eq!(store.balance(&Address([9; 20])).unwrap(), 500);
    }

    #[test]
    fn rejected_transfer_writes_nothing() {
        let alice = PublicKey([1; 32]);
        let mut store = funded(alice, 1_000);
        let before = store.state_root().unwrap();

        for (tx, remaining) in [
            (transfer(alice, 1, 10), TX_GAS),
            (transfer(alice, 0, 10), TX_GAS - 1),
            (transfer(alice, 0, 10_000), TX_GAS),
        ] {
            let err = TransferExecutor
                .execute_transaction(&mut store, &tx, remaining)
                .unwrap_err();
            assert!(matches!(err, ChainError::Block(BlockError::Execution(_))));
        }
        assert_eq!(store.state_root().unwrap(), before);
    }

    #[test]
    fn self_transfer_only_costs_fee() {
        let alice = PublicKey([1; 32]);
        let mut store = funded(alice, 50_000);
        let mut tx = transfer(alice, 0, 700);
        tx.to = alice.address();
        TransferExecutor.execute_transaction(&mut store, &tx, TX_GAS).unwrap();
        assert_eq!(store.balance(&alice.address()).unwrap(), 50_000 - TX_GAS);
    }

    // --- LeaderMinorReward ---

    fn block(leader: PublicKey, minors: Vec<PublicKey>) -> Block {
        Block {
            header: BlockHeader {
                chain_id: 1,
                version: 1,
                prev_hash: Hash256::ZERO,
                gas_limit: 0,
                gas_used: 0,
                height: 1,
                timestamp: 1,
                state_root: Hash256::ZERO,
                tx_root: Hash256::ZERO,
                receipt_root: Hash256::ZERO,
                leader,
                minors,
            },
            proof: Proof::default(),
            transactions: vec![],
        }
    }

    #[test]
    fn reward_split() {
        let (l, m1, m2, m3) = (PublicKey([1; 32]), PublicKey([2; 32]), PublicKey([3; 32]), PublicKey([4; 32]));
        let mut store = MemoryChainStore::new();
        LeaderMinorReward::new(600)
            .apply_reward(&mut store, &block(l, vec![l, m1, m2, m3]), 7)
            .unwrap();
        assert_eq!(store.balance(&l.address()).unwrap(), 307);
        for m in [m1, m2, m3] {
            assert_eq!(store.balance(&m.address()).unwrap(), 75);
        }
    }

    #[test]
    fn reward_without_minors_pays_leader_half() {
        let l = PublicKey([1; 32]);
        let mut store = MemoryChainStore::new();
        LeaderMinorReward::new(600)
            .apply_reward(&mut store, &block(l, vec![]), 0)
            .unwrap();
        assert_eq!(store.balance(&l.address()).unwrap(), 300);
    }
}
