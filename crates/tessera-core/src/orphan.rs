//! Holding area for blocks whose parent is not yet known.
//!
//! Orphans are indexed by their own hash and by parent hash. Expiry and
//! capacity eviction happen opportunistically inside [`OrphanPool::add`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::constants::{MAX_ORPHAN_BLOCKS, ORPHAN_TTL_SECS};
use crate::types::{Block, Hash256};

/// A block waiting for its parent.
#[derive(Clone, Debug)]
pub struct OrphanBlock {
    pub block: Block,
    pub expiration: Instant,
}

#[derive(Default)]
struct OrphanInner {
    orphans: HashMap<Hash256, OrphanBlock>,
    by_parent: HashMap<Hash256, Vec<Hash256>>,
}

impl OrphanInner {
    fn remove(&mut self, hash: &Hash256) -> Option<OrphanBlock> {
        let orphan = self.orphans.remove(hash)?;
        let parent = orphan.block.header.prev_hash;
        if let Some(children) = self.by_parent.get_mut(&parent) {
            children.retain(|h| h != hash);
            if children.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        Some(orphan)
    }
}

/// Bounded, time-limited orphan pool.
pub struct OrphanPool {
    inner: Mutex<OrphanInner>,
    capacity: usize,
    ttl: Duration,
}

impl Default for OrphanPool {
    fn default() -> Self {
        Self::new()
    }
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::with_limits(MAX_ORPHAN_BLOCKS, Duration::from_secs(ORPHAN_TTL_SECS))
    }

    pub fn with_limits(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(OrphanInner::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn is_known_orphan(&self, hash: &Hash256) -> bool {
        self.inner.lock().orphans.contains_key(hash)
    }

    /// Walk parent links through the pool and return the hash of the oldest
    /// orphan in the chain containing `hash`.
    ///
    /// Returns `hash` itself if it is not an orphan.
    pub fn get_orphan_root(&self, hash: &Hash256) -> Hash256 {
        let inner = self.inner.lock();
        let mut root = *hash;
        let mut prev = *hash;
        while let Some(orphan) = inner.orphans.get(&prev) {
            root = prev;
            prev = orphan.block.header.prev_hash;
        }
        root
    }

    /// Insert an orphan, first expiring stale entries and evicting the
    /// earliest-expiring one if the pool is full.
    pub fn add(&self, block: Block) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired: Vec<Hash256> = inner
            .orphans
            .iter()
            .filter(|(_, o)| now >= o.expiration)
            .map(|(h, _)| *h)
            .collect();
        for hash in &expired {
            inner.remove(hash);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "orphan: expired");
        }

        if inner.orphans.len() + 1 > self.capacity {
            let oldest = inner
                .orphans
                .iter()
                .min_by_key(|(_, o)| o.expiration)
                .map(|(h, _)| *h);
            if let Some(hash) = oldest {
                debug!(%hash, "orphan: evicted oldest");
                inner.remove(&hash);
            }
        }

        let hash = block.hash();
        let parent = block.header.prev_hash;
        inner.orphans.insert(
            hash,
            OrphanBlock {
                block,
                expiration: now + self.ttl,
            },
        );
        inner.by_parent.entry(parent).or_default().push(hash);
        debug!(%hash, %parent, total = inner.orphans.len(), "orphan: added");
    }

    /// Remove an orphan from both indexes.
    pub fn remove(&self, hash: &Hash256) -> Option<OrphanBlock> {
        self.inner.lock().remove(hash)
    }

    /// Hashes of orphans waiting on `parent`, in arrival order.
    pub fn children_of(&self, parent: &Hash256) -> Vec<Hash256> {
        self.inner
            .lock()
            .by_parent
            .get(parent)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().orphans.is_empty()
    }
}
