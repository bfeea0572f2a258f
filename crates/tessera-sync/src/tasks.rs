//! Height-ordered set of blocks still to fetch.

use std::collections::BTreeMap;

use tessera_core::types::Hash256;

/// One block to fetch: its header hash and height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncTask {
    pub hash: Hash256,
    pub height: u64,
}

/// Pending fetch tasks keyed by height. The first task put at a height wins.
#[derive(Debug, Default)]
pub struct HeightSortedTasks {
    items: BTreeMap<u64, Hash256>,
}

impl HeightSortedTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `task` unless its height is already queued. Returns whether it was added.
    pub fn put(&mut self, task: SyncTask) -> bool {
        match self.items.entry(task.height) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(task.hash);
                true
            }
        }
    }

    pub fn get(&self, height: u64) -> Option<SyncTask> {
        self.items.get(&height).map(|hash| SyncTask { hash: *hash, height })
    }

    pub fn remove(&mut self, height: u64) -> bool {
        self.items.remove(&height).is_some()
    }

    /// Remove and return up to `count` lowest-height tasks, ascending.
    pub fn pop_lowest(&mut self, count: usize) -> Vec<SyncTask> {
        let mut out = Vec::with_capacity(count.min(self.items.len()));
        while out.len() < count {
            let Some((height, hash)) = self.items.pop_first() else {
                break;
            };
            out.push(SyncTask { hash, height });
        }
        out
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
