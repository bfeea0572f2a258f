//! RocksDB-backed persistent chain storage.
//!
//! Implements [`ChainStore`] using RocksDB column families for blocks,
//! block-node records, a height-ordered node index, accounts, per-height undo
//! journals and metadata. Account writes stay in memory until
//! [`ChainStore::commit`], which applies them together with their journal in
//! one atomic [`WriteBatch`].

use std::collections::BTreeMap;
use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use tracing::debug;

use tessera_core::block_node::BlockNodeRecord;
use tessera_core::error::ChainError;
use tessera_core::store::{compute_state_root, ChainStore, JournalEntry, StateDb};
use tessera_core::types::{Account, Address, Block, ChainState, Hash256};

// --- Column family names ---

const CF_BLOCKS: &str = "blocks";
const CF_NODES: &str = "block_nodes";
const CF_NODE_HEIGHTS: &str = "node_heights";
const CF_ACCOUNTS: &str = "accounts";
const CF_JOURNAL: &str = "journal";
const CF_METADATA: &str = "metadata";

/// All column family names.
const ALL_CFS: &[&str] = &[
    CF_BLOCKS,
    CF_NODES,
    CF_NODE_HEIGHTS,
    CF_ACCOUNTS,
    CF_JOURNAL,
    CF_METADATA,
];

// --- Metadata keys ---

const META_CHAIN_STATE: &[u8] = b"chain_state";

/// RocksDB-backed chain store.
pub struct RocksStore {
    db: DB,
    pending: BTreeMap<Address, Account>,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all column families if they don't exist. Genesis is written by
    /// the chain service, not here.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ChainError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| ChainError::Storage(e.to_string()))?;
        debug!(path = %path.as_ref().display(), "store: opened");

        Ok(Self {
            db,
            pending: BTreeMap::new(),
        })
    }

    /// Number of committed accounts.
    pub fn account_count(&self) -> Result<usize, ChainError> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item.map_err(|e| ChainError::Storage(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }

    // --- Internal helpers ---

    /// Get a column family handle.
    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, ChainError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainError::Storage(format!("missing column family: {name}")))
    }

    /// Read and decode one value.
    fn get_decoded<T: bincode::Decode<()>>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, ChainError> {
        let cf = self.cf_handle(cf)?;
        match self
            .db
            .get_cf(&cf, key)
            .map_err(|e| ChainError::Storage(e.to_string()))?
        {
            Some(data) => decode(&data).map(Some),
            None => Ok(None),
        }
    }

    /// Committed account, ignoring pending writes.
    fn committed_account(&self, addr: &Address) -> Result<Option<Account>, ChainError> {
        self.get_decoded(CF_ACCOUNTS, addr.as_bytes())
    }

    /// Every committed account in address order.
    fn committed_accounts(&self) -> Result<BTreeMap<Address, Account>, ChainError> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let mut accounts = BTreeMap::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| ChainError::Storage(e.to_string()))?;
            let addr: [u8; 20] = key
                .as_ref()
                .try_into()
                .map_err(|_| ChainError::Storage("invalid account key length".into()))?;
            accounts.insert(Address(addr), decode(&value)?);
        }
        Ok(accounts)
    }

    /// Encode a height as big-endian bytes for ordered iteration.
    fn height_key(height: u64) -> [u8; 8] {
        height.to_be_bytes()
    }

    /// Node index key: height(BE) || hash.
    fn node_height_key(height: u64, hash: &Hash256) -> [u8; 40] {
        let mut key = [0u8; 40];
        key[..8].copy_from_slice(&Self::height_key(height));
        key[8..].copy_from_slice(hash.as_bytes());
        key
    }

    fn write(&self, batch: WriteBatch) -> Result<(), ChainError> {
        self.db
            .write(batch)
            .map_err(|e| ChainError::Storage(e.to_string()))
    }
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, ChainError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ChainError::Storage(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(data: &[u8]) -> Result<T, ChainError> {
    let (value, _): (T, _) = bincode::decode_from_slice(data, bincode::config::standard())
        .map_err(|e| ChainError::Storage(e.to_string()))?;
    Ok(value)
}

impl StateDb for RocksStore {
    fn account(&self, addr: &Address) -> Result<Option<Account>, ChainError> {
        match self.pending.get(addr) {
            Some(account) => Ok(Some(*account)),
            None => self.committed_account(addr),
        }
    }

    fn put_account(&mut self, addr: &Address, account: Account) -> Result<(), ChainError> {
        self.pending.insert(*addr, account);
        Ok(())
    }

    fn state_root(&self) -> Result<Hash256, ChainError> {
        let mut accounts = self.committed_accounts()?;
        accounts.extend(self.pending.iter().map(|(a, acc)| (*a, *acc)));
        Ok(compute_state_root(accounts.iter()))
    }
}

impl ChainStore for RocksStore {
    fn put_block(&mut self, block: &Block) -> Result<(), ChainError> {
        let cf = self.cf_handle(CF_BLOCKS)?;
        self.db
            .put_cf(&cf, block.hash().as_bytes(), encode(block)?)
            .map_err(|e| ChainError::Storage(e.to_string()))
    }

    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        self.get_decoded(CF_BLOCKS, hash.as_bytes())
    }

    fn has_block(&self, hash: &Hash256) -> Result<bool, ChainError> {
        let cf = self.cf_handle(CF_BLOCKS)?;
        Ok(self
            .db
            .get_pinned_cf(&cf, hash.as_bytes())
            .map_err(|e| ChainError::Storage(e.to_string()))?
            .is_some())
    }

    fn put_block_node(&mut self, record: &BlockNodeRecord) -> Result<(), ChainError> {
        let hash = record.header.hash();
        let cf_nodes = self.cf_handle(CF_NODES)?;
        let cf_heights = self.cf_handle(CF_NODE_HEIGHTS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_nodes, hash.as_bytes(), encode(record)?);
        batch.put_cf(&cf_heights, Self::node_height_key(record.header.height, &hash), b"");
        self.write(batch)
    }

    fn get_block_node(&self, hash: &Hash256) -> Result<Option<BlockNodeRecord>, ChainError> {
        self.get_decoded(CF_NODES, hash.as_bytes())
    }

    fn block_nodes(&self) -> Result<Vec<BlockNodeRecord>, ChainError> {
        let cf = self.cf_handle(CF_NODE_HEIGHTS)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| ChainError::Storage(e.to_string()))?;
            let hash: [u8; 32] = key
                .get(8..)
                .and_then(|h| h.try_into().ok())
                .ok_or_else(|| ChainError::Storage("invalid node height key".into()))?;
            let record = self
                .get_block_node(&Hash256(hash))?
                .ok_or_else(|| ChainError::Storage(format!("dangling node index entry {}", Hash256(hash))))?;
            records.push(record);
        }
        Ok(records)
    }

    fn put_chain_state(&mut self, state: &ChainState) -> Result<(), ChainError> {
        let cf = self.cf_handle(CF_METADATA)?;
        self.db
            .put_cf(&cf, META_CHAIN_STATE, encode(state)?)
            .map_err(|e| ChainError::Storage(e.to_string()))
    }

    fn get_chain_state(&self) -> Result<Option<ChainState>, ChainError> {
        self.get_decoded(CF_METADATA, META_CHAIN_STATE)
    }

    fn begin(&mut self) {
        self.pending.clear();
    }

    fn commit(&mut self, height: u64) -> Result<(), ChainError> {
        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        let cf_journal = self.cf_handle(CF_JOURNAL)?;
        let mut batch = WriteBatch::default();
        let mut undo: JournalEntry = Vec::with_capacity(self.pending.len());
        for (addr, account) in &self.pending {
            undo.push((*addr, self.committed_account(addr)?));
            batch.put_cf(&cf_accounts, addr.as_bytes(), encode(account)?);
        }
        batch.put_cf(&cf_journal, Self::height_key(height), encode(&undo)?);
        self.write(batch)?;
        debug!(height, accounts = undo.len(), "store: committed");
        self.pending.clear();
        Ok(())
    }

    fn discard(&mut self) {
        self.pending.clear();
    }

    fn rollback_to_height(&mut self, height: u64) -> Result<(), ChainError> {
        self.pending.clear();
        let Some(start) = height.checked_add(1) else {
            return Ok(());
        };
        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        let cf_journal = self.cf_handle(CF_JOURNAL)?;

        let mut journals = Vec::new();
        let from = Self::height_key(start);
        let iter = self.db.iterator_cf(
            &cf_journal,
            IteratorMode::From(&from, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| ChainError::Storage(e.to_string()))?;
            let undo: JournalEntry = decode(&value)?;
            journals.push((key, undo));
        }

        // Newest first; within a batch the last write to a key wins, so the
        // oldest prior value ends up applied.
        let mut batch = WriteBatch::default();
        let reverted = journals.len();
        for (key, undo) in journals.into_iter().rev() {
            for (addr, prior) in undo.into_iter().rev() {
                match prior {
                    Some(account) => batch.put_cf(&cf_accounts, addr.as_bytes(), encode(&account)?),
                    None => batch.delete_cf(&cf_accounts, addr.as_bytes()),
                }
            }
            batch.delete_cf(&cf_journal, key);
        }
        self.write(batch)?;
        debug!(height, reverted, "store: rolled back");
        Ok(())
    }

    fn journal_height(&self) -> Result<Option<u64>, ChainError> {
        let cf = self.cf_handle(CF_JOURNAL)?;
        match self.db.iterator_cf(&cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item.map_err(|e| ChainError::Storage(e.to_string()))?;
                let bytes: [u8; 8] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| ChainError::Storage("invalid journal key length".into()))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn state(&mut self) -> &mut dyn StateDb {
        self
    }
}
