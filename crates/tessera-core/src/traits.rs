//! Collaborator interfaces consumed by the chain service and block manager.
//!
//! - [`BlockExecutor`]: applies transactions to account state (tessera-chain implements)
//! - [`RewardDistributor`]: pays producers after execution
//! - [`SignatureVerifier`]: checks a block's producer proof and transaction signatures
//! - [`TxPool`]: pending transactions for templates and gossip

use crate::error::{BlockError, ChainError, TxPoolError};
use crate::store::StateDb;
use crate::types::{Address, Block, PublicKey, Transaction};

/// Gas accounting reported by an execution step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub gas_used: u64,
    pub gas_fee: u64,
}

/// Transaction execution engine.
pub trait BlockExecutor: Send + Sync {
    /// Execute one transaction with `gas_remaining` left in the block.
    ///
    /// Must not write any state when it returns an error.
    fn execute_transaction(
        &self,
        state: &mut dyn StateDb,
        tx: &Transaction,
        gas_remaining: u64,
    ) -> Result<ExecutionOutcome, ChainError>;

    /// Execute every transaction of `block` within `gas_allowance`.
    ///
    /// Default implementation: sequential [`execute_transaction`](Self::execute_transaction),
    /// failing the block on the first rejected transaction.
    fn execute_block(
        &self,
        state: &mut dyn StateDb,
        block: &Block,
        gas_allowance: u64,
    ) -> Result<ExecutionOutcome, ChainError> {
        let mut total = ExecutionOutcome::default();
        for tx in &block.transactions {
            let remaining = gas_allowance.saturating_sub(total.gas_used);
            let outcome = self.execute_transaction(state, tx, remaining)?;
            total.gas_used = total
                .gas_used
                .checked_add(outcome.gas_used)
                .ok_or_else(|| BlockError::Execution("gas used overflow".into()))?;
            total.gas_fee = total
                .gas_fee
                .checked_add(outcome.gas_fee)
                .ok_or_else(|| BlockError::Execution("gas fee overflow".into()))?;
        }
        Ok(total)
    }
}

/// Block reward payout, applied after execution inside the same transaction.
pub trait RewardDistributor: Send + Sync {
    fn apply_reward(
        &self,
        state: &mut dyn StateDb,
        block: &Block,
        gas_fee: u64,
    ) -> Result<(), ChainError>;
}

/// Producer proof verification.
pub trait SignatureVerifier: Send + Sync {
    /// Whether every signature in `block.proof` is valid for the matching
    /// entry of `signers` over the header hash.
    fn verify_aggregate(&self, block: &Block, signers: &[PublicKey]) -> bool;

    /// Whether `tx.signature` is the sender's signature over
    /// [`Transaction::signing_hash`].
    fn verify_transaction(&self, tx: &Transaction) -> bool;
}

/// Pending transaction pool.
pub trait TxPool: Send + Sync {
    /// Executable transactions whose summed gas limit fits in `gas_limit`.
    fn pending_transactions(&self, gas_limit: u64) -> Vec<Transaction>;

    /// Admit a transaction. `local` marks transactions submitted by this node.
    fn add_transaction(&self, tx: Transaction, local: bool) -> Result<(), TxPoolError>;

    /// Drop transactions made stale by a newly committed block. Each entry is
    /// a sender and its next expected nonce.
    fn notify_confirmed(&self, confirmed: &[(Address, u64)]);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
