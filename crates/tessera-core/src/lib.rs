//! # tessera-core
//! Foundation types, chain-shape bookkeeping and collaborator traits for Tessera.
//!
//! - [`block_index::BlockIndex`]: every known header node, with a dirty set for batched persistence
//! - [`chain_view::ChainView`]: height-indexed snapshot of one branch
//! - [`orphan::OrphanPool`]: blocks waiting on an unknown parent
//! - [`store::ChainStore`]: persistence contract, with [`store::MemoryChainStore`] for tests

pub mod block_index;
pub mod block_node;
pub mod chain_view;
pub mod constants;
pub mod error;
pub mod merkle;
pub mod orphan;
pub mod store;
pub mod traits;
pub mod types;
