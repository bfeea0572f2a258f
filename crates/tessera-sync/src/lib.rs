//! # tessera-sync
//! Peer protocol for Tessera: handshake, gossip, common-ancestor discovery and
//! bulk block fetch.
//!
//! [`manager::BlockManager`] owns the peer table and drives synchronisation.
//! It talks to peers only through the [`transport::Transport`] trait and feeds
//! every fetched block into [`tessera_chain::ChainService::process_block`].

pub mod config;
pub mod manager;
pub mod peer;
pub mod protocol;
pub mod tasks;
pub mod transport;

pub use config::SyncConfig;
pub use manager::{BlockManager, SyncEvent};
pub use peer::{PeerId, PeerInfo};
pub use protocol::{Message, MsgType, SyncMessage};
pub use transport::{MemoryTransport, Transport};
