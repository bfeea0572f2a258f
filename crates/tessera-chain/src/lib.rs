//! # tessera-chain
//! Block acceptance and fork choice for Tessera, plus the default execution
//! collaborators.
//!
//! - [`service::ChainService`]: acceptance, reorganization and orphan promotion
//! - [`validator`]: header, body and producer-proof checks
//! - [`executor`]: value-transfer execution and the leader/minor reward split
//! - [`txpool::SimpleTxPool`]: nonce-ordered pending transactions

pub mod config;
pub mod executor;
pub mod gas;
pub mod genesis;
pub mod service;
pub mod txpool;
pub mod validator;

pub use config::ChainConfig;
pub use service::{ChainEvent, ChainService, Collaborators, ProcessOutcome};
