//! Cross-crate test suite for Tessera.
//!
//! Scenarios drive the chain service, block manager and node together;
//! property tests exercise the block index and chain view over generated
//! block trees.

pub mod helpers;
