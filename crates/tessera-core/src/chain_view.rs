//! Height-indexed view of one branch from genesis to a tip.
//!
//! The view does not own nodes: it holds shared handles from the
//! [`BlockIndex`] and resolves parent keys through it. [`ChainView::set_tip`]
//! only rewrites the slots that differ from the previous branch.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::block_index::BlockIndex;
use crate::block_node::BlockNode;
use crate::constants::APPROX_NODES_PER_WEEK;

/// A single branch of the block tree, indexed by height.
///
/// Invariant: `nodes[h].height() == h` for every slot.
pub struct ChainView {
    index: Arc<BlockIndex>,
    nodes: Mutex<Vec<Arc<BlockNode>>>,
}

impl ChainView {
    /// Create a view over `index`, optionally ending at `tip`.
    pub fn new(index: Arc<BlockIndex>, tip: Option<Arc<BlockNode>>) -> Self {
        let view = Self {
            index,
            nodes: Mutex::new(Vec::new()),
        };
        if let Some(tip) = tip {
            view.set_tip(&tip);
        }
        view
    }

    /// Rebuild the view for the branch ending at `node`.
    ///
    /// Reuses the backing storage and stops walking parents at the first slot
    /// that already holds the same node.
    pub fn set_tip(&self, node: &Arc<BlockNode>) {
        let mut nodes = self.nodes.lock();
        let needed = node.height() as usize + 1;

        // Slots above the old tip are filled below; ones past the new tip are dropped.
        nodes.truncate(needed);
        if nodes.capacity() < needed {
            let len = nodes.len();
            nodes.reserve(needed - len + APPROX_NODES_PER_WEEK);
        }

        let mut fresh: Vec<Arc<BlockNode>> = Vec::new();
        let mut current = Some(Arc::clone(node));
        while let Some(n) = current {
            let h = n.height() as usize;
            if h < nodes.len() {
                if nodes[h].hash() == n.hash() {
                    break;
                }
                nodes[h] = Arc::clone(&n);
            } else {
                fresh.push(Arc::clone(&n));
            }
            current = self.index.parent(&n);
        }

        // `fresh` is tip-first and covers exactly the heights above the old length.
        while let Some(n) = fresh.pop() {
            debug_assert_eq!(n.height() as usize, nodes.len());
            nodes.push(n);
        }
    }

    /// Drop every node from the view.
    pub fn clear(&self) {
        self.nodes.lock().clear();
    }

    /// Height of the tip. Zero for an empty view; see [`ChainView::is_empty`].
    pub fn height(&self) -> u64 {
        (self.nodes.lock().len() as u64).saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    pub fn tip(&self) -> Option<Arc<BlockNode>> {
        self.nodes.lock().last().cloned()
    }

    pub fn genesis(&self) -> Option<Arc<BlockNode>> {
        self.nodes.lock().first().cloned()
    }

    pub fn node_by_height(&self, height: u64) -> Option<Arc<BlockNode>> {
        self.nodes.lock().get(height as usize).cloned()
    }

    /// Whether `node` is part of this branch.
    pub fn contains(&self, node: &BlockNode) -> bool {
        let nodes = self.nodes.lock();
        Self::contains_locked(&nodes, node)
    }

    fn contains_locked(nodes: &[Arc<BlockNode>], node: &BlockNode) -> bool {
        nodes
            .get(node.height() as usize)
            .is_some_and(|n| n.hash() == node.hash())
    }

    /// The successor of `node` on this branch, if `node` is on it and not the tip.
    pub fn next(&self, node: &BlockNode) -> Option<Arc<BlockNode>> {
        let nodes = self.nodes.lock();
        if !Self::contains_locked(&nodes, node) {
            return None;
        }
        nodes.get(node.height() as usize + 1).cloned()
    }

    /// Whether both views end at the same tip and have the same length.
    pub fn equals(&self, other: &ChainView) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let ours = self.nodes.lock();
        let theirs = other.nodes.lock();
        ours.len() == theirs.len()
            && ours.last().map(|n| n.hash()) == theirs.last().map(|n| n.hash())
    }

    /// Deepest node shared by this branch and the ancestry of `node`.
    ///
    /// Returns `None` when the two never converge.
    pub fn find_fork(&self, node: &Arc<BlockNode>) -> Option<Arc<BlockNode>> {
        let nodes = self.nodes.lock();
        if nodes.is_empty() {
            return None;
        }
        let chain_height = nodes.len() as u64 - 1;
        let mut current = if node.height() > chain_height {
            self.index.ancestor(node, chain_height)
        } else {
            Some(Arc::clone(node))
        };
        while let Some(n) = current {
            if Self::contains_locked(&nodes, &n) {
                return Some(n);
            }
            current = self.index.parent(&n);
        }
        None
    }

    /// Copy of the branch, genesis first.
    pub fn nodes(&self) -> Vec<Arc<BlockNode>> {
        self.nodes.lock().clone()
    }
}
