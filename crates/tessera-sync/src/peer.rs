//! Per-connection bookkeeping: advertised height and known-item caches.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use tessera_core::types::{Block, Hash256, Transaction};

/// Known transactions remembered per peer.
pub const MAX_KNOWN_TXS: usize = 4_096;
/// Known blocks remembered per peer.
pub const MAX_KNOWN_BLOCKS: usize = 1_024;

/// Opaque peer identifier, usually the remote socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Bounded hash set ordered by a `u64` key; evicts the lowest key when full.
#[derive(Debug)]
struct SortedCache {
    keys: HashMap<Hash256, u64>,
    order: BTreeSet<(u64, Hash256)>,
    capacity: usize,
}

impl SortedCache {
    fn new(capacity: usize) -> Self {
        Self {
            keys: HashMap::new(),
            order: BTreeSet::new(),
            capacity,
        }
    }

    fn contains(&self, hash: &Hash256) -> bool {
        self.keys.contains_key(hash)
    }

    fn insert(&mut self, hash: Hash256, key: u64) {
        if self.keys.contains_key(&hash) {
            return;
        }
        self.keys.insert(hash, key);
        self.order.insert((key, hash));
        while self.keys.len() > self.capacity {
            let Some((_, lowest)) = self.order.pop_first() else {
                break;
            };
            self.keys.remove(&lowest);
        }
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

/// State kept for one live peer.
#[derive(Debug)]
pub struct PeerInfo {
    id: PeerId,
    height: AtomicU64,
    known_txs: Mutex<SortedCache>,
    known_blocks: Mutex<SortedCache>,
}

impl PeerInfo {
    pub fn new(id: PeerId, height: u64) -> Self {
        Self::with_capacity(id, height, MAX_KNOWN_TXS, MAX_KNOWN_BLOCKS)
    }

    pub fn with_capacity(id: PeerId, height: u64, txs: usize, blocks: usize) -> Self {
        Self {
            id,
            height: AtomicU64::new(height),
            known_txs: Mutex::new(SortedCache::new(txs)),
            known_blocks: Mutex::new(SortedCache::new(blocks)),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Last height the peer announced or proved.
    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Acquire)
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::Release);
    }

    pub fn knows_tx(&self, hash: &Hash256) -> bool {
        self.known_txs.lock().contains(hash)
    }

    pub fn mark_tx(&self, tx: &Transaction) {
        self.known_txs.lock().insert(tx.hash(), tx.nonce);
    }

    pub fn knows_block(&self, hash: &Hash256) -> bool {
        self.known_blocks.lock().contains(hash)
    }

    /// Remember `block` and raise the peer's height to it.
    pub fn mark_block(&self, block: &Block) {
        self.known_blocks.lock().insert(block.hash(), block.header.height);
        self.height.fetch_max(block.header.height, Ordering::AcqRel);
    }

    pub fn known_tx_count(&self) -> usize {
        self.known_txs.lock().len()
    }

    pub fn known_block_count(&self) -> usize {
        self.known_blocks.lock().len()
    }
}
