//! Chain storage contract and in-memory implementation.
//!
//! [`ChainStore`] persists blocks, block-node records, the chain-state record
//! and account state. Account writes go to a pending transaction opened by
//! [`ChainStore::begin`]; [`ChainStore::commit`] makes them durable at a block
//! height and records an undo journal so [`ChainStore::rollback_to_height`]
//! can revert whole blocks during a reorganization.
//!
//! The [`MemoryChainStore`] is suitable for testing; the node uses RocksDB
//! (tessera-node).

use std::collections::{BTreeMap, HashMap};

use crate::block_node::BlockNodeRecord;
use crate::error::ChainError;
use crate::types::{Account, Address, Block, ChainState, Hash256};

/// Undo entries of one committed height: prior account values, `None` if the
/// account did not exist.
pub type JournalEntry = Vec<(Address, Option<Account>)>;

/// Account state seen by the execution collaborators.
pub trait StateDb {
    /// Account record, or `None` if the account was never written.
    fn account(&self, addr: &Address) -> Result<Option<Account>, ChainError>;

    /// Write an account into the pending transaction.
    fn put_account(&mut self, addr: &Address, account: Account) -> Result<(), ChainError>;

    /// Root over all accounts, pending writes included.
    fn state_root(&self) -> Result<Hash256, ChainError>;

    fn balance(&self, addr: &Address) -> Result<u64, ChainError> {
        Ok(self.account(addr)?.unwrap_or_default().balance)
    }

    fn nonce(&self, addr: &Address) -> Result<u64, ChainError> {
        Ok(self.account(addr)?.unwrap_or_default().nonce)
    }

    fn add_balance(&mut self, addr: &Address, amount: u64) -> Result<(), ChainError> {
        let mut account = self.account(addr)?.unwrap_or_default();
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| ChainError::Storage(format!("balance overflow for {addr}")))?;
        self.put_account(addr, account)
    }

    fn sub_balance(&mut self, addr: &Address, amount: u64) -> Result<(), ChainError> {
        let mut account = self.account(addr)?.unwrap_or_default();
        account.balance = account
            .balance
            .checked_sub(amount)
            .ok_or_else(|| ChainError::Storage(format!("balance underflow for {addr}")))?;
        self.put_account(addr, account)
    }

    fn set_nonce(&mut self, addr: &Address, nonce: u64) -> Result<(), ChainError> {
        let mut account = self.account(addr)?.unwrap_or_default();
        account.nonce = nonce;
        self.put_account(addr, account)
    }
}

/// Persistent chain storage.
///
/// Not internally synchronized; the chain service wraps it in a lock.
pub trait ChainStore: StateDb + Send + Sync {
    fn put_block(&mut self, block: &Block) -> Result<(), ChainError>;

    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError>;

    fn has_block(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self.get_block(hash)?.is_some())
    }

    fn put_block_node(&mut self, record: &BlockNodeRecord) -> Result<(), ChainError>;

    fn get_block_node(&self, hash: &Hash256) -> Result<Option<BlockNodeRecord>, ChainError>;

    /// Every stored block-node record ordered by height (ties by hash).
    fn block_nodes(&self) -> Result<Vec<BlockNodeRecord>, ChainError>;

    fn put_chain_state(&mut self, state: &ChainState) -> Result<(), ChainError>;

    fn get_chain_state(&self) -> Result<Option<ChainState>, ChainError>;

    /// Open a pending transaction, discarding any previous one.
    fn begin(&mut self);

    /// Apply pending account writes and journal them at `height`.
    fn commit(&mut self, height: u64) -> Result<(), ChainError>;

    /// Drop pending account writes.
    fn discard(&mut self);

    /// Revert committed account state to what it was after `height` was committed.
    fn rollback_to_height(&mut self, height: u64) -> Result<(), ChainError>;

    /// Highest height with a recorded journal.
    fn journal_height(&self) -> Result<Option<u64>, ChainError>;

    /// The store as a plain [`StateDb`] for execution collaborators.
    fn state(&mut self) -> &mut dyn StateDb;
}

/// Compute the account state root: BLAKE3 over `address || balance || nonce`
/// for every account in address order.
pub fn compute_state_root<'a>(accounts: impl Iterator<Item = (&'a Address, &'a Account)>) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    for (addr, account) in accounts {
        hasher.update(addr.as_bytes());
        hasher.update(&account.balance.to_le_bytes());
        hasher.update(&account.nonce.to_le_bytes());
    }
    Hash256(hasher.finalize().into())
}

/// In-memory chain store for testing.
#[derive(Default)]
pub struct MemoryChainStore {
    blocks: HashMap<Hash256, Block>,
    nodes: HashMap<Hash256, BlockNodeRecord>,
    chain_state: Option<ChainState>,
    accounts: BTreeMap<Address, Account>,
    pending: BTreeMap<Address, Account>,
    journal: BTreeMap<u64, JournalEntry>,
}

impl MemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl StateDb for MemoryChainStore {
    fn account(&self, addr: &Address) -> Result<Option<Account>, ChainError> {
        Ok(self
            .pending
            .get(addr)
            .or_else(|| self.accounts.get(addr))
            .copied())
    }

    fn put_account(&mut self, addr: &Address, account: Account) -> Result<(), ChainError> {
        self.pending.insert(*addr, account);
        Ok(())
    }

    fn state_root(&self) -> Result<Hash256, ChainError> {
        let mut merged = self.accounts.clone();
        merged.extend(self.pending.iter().map(|(a, acc)| (*a, *acc)));
        Ok(compute_state_root(merged.iter()))
    }
}

impl ChainStore for MemoryChainStore {
    fn put_block(&mut self, block: &Block) -> Result<(), ChainError> {
        self.blocks.insert(block.hash(), block.clone());
        Ok(())
    }

    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        Ok(self.blocks.get(hash).cloned())
    }

    fn put_block_node(&mut self, record: &BlockNodeRecord) -> Result<(), ChainError> {
        self.nodes.insert(record.header.hash(), record.clone());
        Ok(())
    }

    fn get_block_node(&self, hash: &Hash256) -> Result<Option<BlockNodeRecord>, ChainError> {
        Ok(self.nodes.get(hash).cloned())
    }

    fn block_nodes(&self) -> Result<Vec<BlockNodeRecord>, ChainError> {
        let mut records: Vec<(u64, Hash256, BlockNodeRecord)> = self
            .nodes
            .iter()
            .map(|(h, r)| (r.header.height, *h, r.clone()))
            .collect();
        records.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        Ok(records.into_iter().map(|(_, _, r)| r).collect())
    }

    fn put_chain_state(&mut self, state: &ChainState) -> Result<(), ChainError> {
        self.chain_state = Some(*state);
        Ok(())
    }

    fn get_chain_state(&self) -> Result<Option<ChainState>, ChainError> {
        Ok(self.chain_state)
    }

    fn begin(&mut self) {
        self.pending.clear();
    }

    fn commit(&mut self, height: u64) -> Result<(), ChainError> {
        let pending = std::mem::take(&mut self.pending);
        let mut undo = Vec::with_capacity(pending.len());
        for (addr, account) in pending {
            undo.push((addr, self.accounts.insert(addr, account)));
        }
        self.journal.insert(height, undo);
        Ok(())
    }

    fn discard(&mut self) {
        self.pending.clear();
    }

    fn rollback_to_height(&mut self, height: u64) -> Result<(), ChainError> {
        self.pending.clear();
        let reverted: Vec<u64> = self.journal.range(height + 1..).map(|(h, _)| *h).collect();
        for h in reverted.into_iter().rev() {
            let Some(undo) = self.journal.remove(&h) else {
                continue;
            };
            for (addr, prior) in undo.into_iter().rev() {
                match prior {
                    Some(account) => self.accounts.insert(addr, account),
                    None => self.accounts.remove(&addr),
                };
            }
        }
        Ok(())
    }

    fn journal_height(&self) -> Result<Option<u64>, ChainError> {
        Ok(self.journal.keys().next_back().copied())
    }

    fn state(&mut self) -> &mut dyn StateDb {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_node::BlockStatus;
    use crate::types::{BlockHeader, Proof, PublicKey};

    fn addr(seed: u8) -> Address {
        Address([seed; 20])
    }

    fn header(height: u64, salt: u64) -> BlockHeader {
        BlockHeader {
            chain_id: 1,
            version: 1,
            prev_hash: Hash256([height as u8; 32]),
            gas_limit: 18_000_000,
            gas_used: 0,
            height,
            timestamp: 1_000 + salt,
            state_root: Hash256::ZERO,
            tx_root: Hash256::ZERO,
            receipt_root: Hash256::ZERO,
            leader: PublicKey([1; 32]),
            minors: vec![],
        }
    }

    // --- account state ---

    #[test]
    fn pending_writes_visible_before_commit() {
        let mut store = MemoryChainStore::new();
        store.begin();
        store.add_balance(&addr(1), 50).unwrap();
        assert_eq!(store.balance(&addr(1)).unwrap(), 50);
        store.discard();
        assert_eq!(store.balance(&addr(1)).unwrap(), 0);
    }

    #[test]
    fn commit_then_rollback_restores_prior_state() {
        let mut store = MemoryChainStore::new();
        store.begin();
        store.add_balance(&addr(1), 100).unwrap();
        store.commit(0).unwrap();
        let root0 = store.state_root().unwrap();

        store.begin();
        store.sub_balance(&addr(1), 30).unwrap();
        store.add_balance(&addr(2), 30).unwrap();
        store.set_nonce(&addr(1), 1).unwrap();
        store.commit(1).unwrap();

        store.begin();
        store.add_balance(&addr(3), 5).unwrap();
        store.commit(2).unwrap();
        assert_eq!(store.journal_height().unwrap(), Some(2));

        store.rollback_to_height(0).unwrap();
        assert_eq!(store.balance(&addr(1)).unwrap(), 100);
        assert_eq!(store.nonce(&addr(1)).unwrap(), 0);
        assert!(store.account(&addr(2)).unwrap().is_none());
        assert!(store.account(&addr(3)).unwrap().is_none());
        assert_eq!(store.state_root().unwrap(), root0);
        assert_eq!(store.journal_height().unwrap(), Some(0));
    }

    #[test]
    fn sub_balance_underflow_is_error() {
        let mut store = MemoryChainStore::new();
        assert!(store.sub_balance(&addr(1), 1).is_err());
    }

    #[test]
    fn state_root_tracks_pending() {
        let mut store = MemoryChainStore::new();
        let empty = store.state_root().unwrap();
        store.begin();
        store.add_balance(&addr(1), 1).unwrap();
        assert_ne!(store.state_root().unwrap(), empty);
        store.discard();
        assert_eq!(store.state_root().unwrap(), empty);
    }

    // --- blocks and nodes ---

    #[test]
    fn block_nodes_sorted_by_height() {
        let mut store = MemoryChainStore::new();
        for (h, salt) in [(3, 0), (0, 0), (2, 1), (2, 0), (1, 0)] {
            store
                .put_block_node(&BlockNodeRecord {
                    header: header(h, salt),
                    status: BlockStatus::DATA_STORED,
                })
                .unwrap();
        }
        let heights: Vec<u64> = store
            .block_nodes()
            .unwrap()
            .iter()
            .map(|r| r.header.height)
            .collect();
        assert_eq!(heights, vec![0, 1, 2, 2, 3]);
    }

    #[test]
    fn blocks_and_chain_state() {
        let mut store = MemoryChainStore::new();
        let block = Block {
            header: header(1, 0),
            proof: Proof::default(),
            transactions: vec![],
        };
        store.put_block(&block).unwrap();
        assert!(store.has_block(&block.hash()).unwrap());
        assert_eq!(store.block_count(), 1);

        assert!(store.get_chain_state().unwrap().is_none());
        let state = ChainState::from_header(&block.header);
        store.put_chain_state(&state).unwrap();
        assert_eq!(store.get_chain_state().unwrap(), Some(state));
    }
}
