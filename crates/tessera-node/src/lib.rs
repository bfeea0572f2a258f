//! # tessera-node
//! Full node: RocksDB storage, TCP transport, orchestration.
//!
//! - [`storage::RocksStore`]: persistent [`ChainStore`](tessera_core::store::ChainStore) backed by RocksDB
//! - [`transport::TcpTransport`]: length-prefixed framing over `tokio::net`
//! - [`node::Node`]: init, run and stop of the chain service and block manager
//! - [`config::NodeConfig`]: layered node configuration

pub mod config;
pub mod node;
pub mod storage;
pub mod transport;

pub use config::NodeConfig;
pub use node::Node;
pub use storage::RocksStore;
pub use transport::TcpTransport;
