//! Header-only block records used for chain-shape bookkeeping.
//!
//! A [`BlockNode`] links to its parent by hash; the [`BlockIndex`](crate::block_index::BlockIndex)
//! owns every node and resolves parent keys. Status lives in an atomic byte so
//! nodes can be shared as `Arc<BlockNode>` between the index and chain views.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::types::{BlockHeader, Hash256};

/// Validation status bitfield of a block node.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockStatus(u8);

impl BlockStatus {
    pub const NONE: Self = Self(0);
    /// The full block body is stored.
    pub const DATA_STORED: Self = Self(1 << 0);
    /// The block executed and matched its header.
    pub const VALID: Self = Self(1 << 1);
    /// The block failed validation or execution.
    pub const VALIDATE_FAILED: Self = Self(1 << 2);
    /// An ancestor of the block failed validation.
    pub const INVALID_ANCESTOR: Self = Self(1 << 3);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn have_data(self) -> bool {
        self.contains(Self::DATA_STORED)
    }

    pub const fn known_valid(self) -> bool {
        self.contains(Self::VALID)
    }

    pub const fn known_invalid(self) -> bool {
        self.0 & (Self::VALIDATE_FAILED.0 | Self::INVALID_ANCESTOR.0) != 0
    }
}

/// Persisted form of a block node: the header plus its status bits.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockNodeRecord {
    pub header: BlockHeader,
    pub status: BlockStatus,
}

/// In-memory node of the block index.
pub struct BlockNode {
    hash: Hash256,
    /// Parent key; `None` only for genesis.
    parent: Option<Hash256>,
    height: u64,
    header: BlockHeader,
    status: AtomicU8,
}

impl BlockNode {
    /// Build a node from a header. The parent key is the header's `prev_hash`
    /// unless it is zero.
    pub fn new(header: BlockHeader, status: BlockStatus) -> Self {
        let parent = if header.prev_hash.is_zero() {
            None
        } else {
            Some(header.prev_hash)
        };
        Self {
            hash: header.hash(),
            parent,
            height: header.height,
            header,
            status: AtomicU8::new(status.bits()),
        }
    }

    pub fn from_record(record: BlockNodeRecord) -> Self {
        Self::new(record.header, record.status)
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn parent(&self) -> Option<Hash256> {
        self.parent
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    /// Reconstruct the full header.
    pub fn header(&self) -> BlockHeader {
        self.header.clone()
    }

    pub fn header_ref(&self) -> &BlockHeader {
        &self.header
    }

    pub fn status(&self) -> BlockStatus {
        BlockStatus(self.status.load(Ordering::Acquire))
    }

    pub fn record(&self) -> BlockNodeRecord {
        BlockNodeRecord {
            header: self.header.clone(),
            status: self.status(),
        }
    }

    // Callers go through the index so the node is also marked dirty.
    pub(crate) fn or_status(&self, flags: BlockStatus) {
        self.status.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_status(&self, flags: BlockStatus) {
        self.status.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}

impl fmt::Debug for BlockNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockNode")
            .field("hash", &self.hash)
            .field("height", &self.height)
            .field("status", &self.status())
            .finish()
    }
}

impl PartialEq for BlockNode {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for BlockNode {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PublicKey;

    fn header(height: u64, prev: Hash256) -> BlockHeader {
        BlockHeader {
            chain_id: 1,
            version: 1,
            prev_hash: prev,
            gas_limit: 18_000_000,
            gas_used: 0,
            height,
            timestamp: 1_000 + height,
            state_root: Hash256::ZERO,
            tx_root: Hash256::ZERO,
            receipt_root: Hash256::ZERO,
            leader: PublicKey([1; 32]),
            minors: vec![],
        }
    }

    #[test]
    fn status_predicates() {
        let s = BlockStatus::DATA_STORED;
        assert!(s.have_data());
        assert!(!s.known_valid());
        assert!(!s.known_invalid());

        let s = s.union(BlockStatus::VALID);
        assert!(s.known_valid());

        assert!(BlockStatus::VALIDATE_FAILED.known_invalid());
        assert!(BlockStatus::INVALID_ANCESTOR.known_invalid());
    }

    #[test]
    fn genesis_has_no_parent() {
        let node = BlockNode::new(header(0, Hash256::ZERO), BlockStatus::NONE);
        assert_eq!(node.parent(), None);
        assert_eq!(node.height(), 0);
    }

    #[test]
    fn child_links_by_hash() {
        let g = BlockNode::new(header(0, Hash256::ZERO), BlockStatus::NONE);
        let child = BlockNode::new(header(1, g.hash()), BlockStatus::DATA_STORED);
        assert_eq!(child.parent(), Some(g.hash()));
        assert_eq!(child.header().hash(), child.hash());
    }

    #[test]
    fn status_flags_set_and_clear() {
        let node = BlockNode::new(header(0, Hash256::ZERO), BlockStatus::DATA_STORED);
        node.or_status(BlockStatus::VALID);
        assert!(node.status().known_valid());
        node.clear_status(BlockStatus::VALID);
        assert_eq!(node.status(), BlockStatus::DATA_STORED);
    }

    #[test]
    fn record_round_trips_status() {
        let node = BlockNode::new(header(4, Hash256([9; 32])), BlockStatus::VALIDATE_FAILED);
        let again = BlockNode::from_record(node.record());
        assert_eq!(again.hash(), node.hash());
        assert_eq!(again.status(), BlockStatus::VALIDATE_FAILED);
    }
}
