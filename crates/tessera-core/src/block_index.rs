//! In-memory directory of every known block node.
//!
//! Mutations take the write lock; lookups share the read lock. Modified nodes
//! are tracked in a dirty set and written out by [`BlockIndex::flush_to_db`],
//! which clears the set only when every write succeeds.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::block_node::{BlockNode, BlockStatus};
use crate::types::Hash256;

#[derive(Default)]
struct IndexInner {
    nodes: HashMap<Hash256, Arc<BlockNode>>,
    dirty: HashSet<Hash256>,
}

impl IndexInner {
    fn ancestor(&self, node: &Arc<BlockNode>, height: u64) -> Option<Arc<BlockNode>> {
        if height > node.height() {
            return None;
        }
        let mut current = Arc::clone(node);
        while current.height() > height {
            current = Arc::clone(self.nodes.get(&current.parent()?)?);
        }
        Some(current)
    }
}

/// Directory of block nodes keyed by hash.
#[derive(Default)]
pub struct BlockIndex {
    inner: RwLock<IndexInner>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node and mark it dirty. Callers must not insert duplicates.
    pub fn add_node(&self, node: Arc<BlockNode>) {
        let mut inner = self.inner.write();
        inner.dirty.insert(node.hash());
        inner.nodes.insert(node.hash(), node);
    }

    /// Insert a node loaded from storage without marking it dirty.
    pub fn add_node_clean(&self, node: Arc<BlockNode>) {
        self.inner.write().nodes.insert(node.hash(), node);
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<Arc<BlockNode>> {
        self.inner.read().nodes.get(hash).cloned()
    }

    pub fn have_block(&self, hash: &Hash256) -> bool {
        self.inner.read().nodes.contains_key(hash)
    }

    pub fn node_status(&self, hash: &Hash256) -> Option<BlockStatus> {
        self.inner.read().nodes.get(hash).map(|n| n.status())
    }

    /// Ancestor of `node` at `height`, following parent keys through the index.
    pub fn ancestor(&self, node: &Arc<BlockNode>, height: u64) -> Option<Arc<BlockNode>> {
        self.inner.read().ancestor(node, height)
    }

    pub fn parent(&self, node: &BlockNode) -> Option<Arc<BlockNode>> {
        let parent = node.parent()?;
        self.lookup(&parent)
    }

    pub fn set_status_flags(&self, node: &BlockNode, flags: BlockStatus) {
        let mut inner = self.inner.write();
        node.or_status(flags);
        inner.dirty.insert(node.hash());
    }

    pub fn unset_status_flags(&self, node: &BlockNode, flags: BlockStatus) {
        let mut inner = self.inner.write();
        node.clear_status(flags);
        inner.dirty.insert(node.hash());
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().nodes.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.inner.read().dirty.len()
    }

    /// Write every dirty node with `write`, stopping at the first failure.
    ///
    /// The dirty set is cleared only if all writes succeed.
    pub fn flush_to_db<E, F>(&self, mut write: F) -> Result<(), E>
    where
        F: FnMut(&BlockNode) -> Result<(), E>,
    {
        let mut inner = self.inner.write();
        if inner.dirty.is_empty() {
            return Ok(());
        }
        for hash in &inner.dirty {
            if let Some(node) = inner.nodes.get(hash) {
                write(node)?;
            }
        }
        inner.dirty.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockHeader, PublicKey};

    fn header(height: u64, prev: Hash256, salt: u64) -> BlockHeader {
        BlockHeader {
            chain_id: 1,
            version: 1,
            prev_hash: prev,
            gas_limit: 18_000_000,
            gas_used: 0,
            height,
            timestamp: 1_000 + height * 10 + salt,
            state_root: Hash256::ZERO,
            tx_root: Hash256::ZERO,
            receipt_root: Hash256::ZERO,
            leader: PublicKey([1; 32]),
            minors: vec![],
        }
    }

    /// Build and index a linear chain of `len` nodes starting at genesis.
    fn chain(index: &BlockIndex, len: u64) -> Vec<Arc<BlockNode>> {
        let mut nodes: Vec<Arc<BlockNode>> = Vec::new();
        let mut prev = Hash256::ZERO;
        for h in 0..len {
            let node = Arc::new(BlockNode::new(header(h, prev, 0), BlockStatus::DATA_STORED));
            prev = node.hash();
            index.add_node(Arc::clone(&node));
            nodes.push(node);
        }
        nodes
    }

    #[test]
    fn add_and_lookup() {
        let index = BlockIndex::new();
        let nodes = chain(&index, 3);
        assert_eq!(index.len(), 3);
        assert!(index.have_block(&nodes[2].hash()));
        assert_eq!(index.lookup(&nodes[1].hash()).unwrap().height(), 1);
        assert!(index.lookup(&Hash256([0xEE; 32])).is_none());
    }

    #[test]
    fn ancestor_walks_parent_keys() {
        let index = BlockIndex::new();
        let nodes = chain(&index, 6);
        let tip = &nodes[5];
        assert_eq!(index.ancestor(tip, 2).unwrap().hash(), nodes[2].hash());
        assert_eq!(index.ancestor(tip, 5).unwrap().hash(), tip.hash());
        assert!(index.ancestor(tip, 6).is_none());
        assert_eq!(index.parent(tip).unwrap().hash(), nodes[4].hash());
        assert!(index.parent(&nodes[0]).is_none());
    }

    #[test]
    fn status_flags_mark_dirty() {
        let index = BlockIndex::new();
        let nodes = chain(&index, 2);
        index.flush_to_db::<(), _>(|_| Ok(())).unwrap();
        assert_eq!(index.dirty_count(), 0);

        index.set_status_flags(&nodes[1], BlockStatus::VALID);
        assert_eq!(index.dirty_count(), 1);
        assert!(index.node_status(&nodes[1].hash()).unwrap().known_valid());

        index.unset_status_flags(&nodes[1], BlockStatus::VALID);
        assert!(!index.node_status(&nodes[1].hash()).unwrap().known_valid());
    }

    #[test]
    fn flush_writes_every_dirty_node() {
        let index = BlockIndex::new();
        chain(&index, 4);
        let mut written = Vec::new();
        index
            .flush_to_db::<(), _>(|node| {
                written.push(node.height());
                Ok(())
            })
            .unwrap();
        written.sort();
        assert_eq!(written, vec![0, 1, 2, 3]);
        assert_eq!(index.dirty_count(), 0);
    }

    #[test]
    fn failed_flush_keeps_dirty_set() {
        let index = BlockIndex::new();
        chain(&index, 4);
        let mut calls = 0;
        let result = index.flush_to_db(|_| {
            calls += 1;
            if calls == 2 { Err("disk full") } else { Ok(()) }
        });
        assert_eq!(result, Err("disk full"));
        assert_eq!(calls, 2);
        assert_eq!(index.dirty_count(), 4);
    }

    #[test]
    fn clean_insert_is_not_dirty() {
        let index = BlockIndex::new();
        let node = Arc::new(BlockNode::new(header(0, Hash256::ZERO, 0), BlockStatus::VALID));
        index.add_node_clean(node);
        assert_eq!(index.len(), 1);
        assert_eq!(index.dirty_count(), 0);
    }
}
