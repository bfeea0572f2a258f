//! Outbound message delivery.
//!
//! The block manager never touches sockets. Inbound traffic reaches it as an
//! `mpsc::Receiver<Message>` per peer handed to
//! [`BlockManager::run_peer`](crate::manager::BlockManager::run_peer); outbound
//! traffic goes through a [`Transport`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use tessera_core::error::SyncError;

use crate::peer::PeerId;
use crate::protocol::Message;

/// Sends framed messages to connected peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver `message` to `peer`, waiting for queue space.
    async fn send(&self, peer: &PeerId, message: Message) -> Result<(), SyncError>;

    /// Spawn [`send`](Transport::send) and return its handle.
    fn send_async(self: Arc<Self>, peer: PeerId, message: Message) -> JoinHandle<Result<(), SyncError>> {
        tokio::spawn(async move { self.send(&peer, message).await })
    }
}

/// In-process transport: each route is the inbound queue of a remote manager.
#[derive(Default)]
pub struct MemoryTransport {
    routes: DashMap<PeerId, mpsc::Sender<Message>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages for `peer` into `inbound`.
    pub fn register(&self, peer: PeerId, inbound: mpsc::Sender<Message>) {
        self.routes.insert(peer, inbound);
    }

    pub fn unregister(&self, peer: &PeerId) {
        self.routes.remove(peer);
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer: &PeerId, message: Message) -> Result<(), SyncError> {
        let route = self
            .routes
            .get(peer)
            .map(|r| r.value().clone())
            .ok_or_else(|| SyncError::PeerDisconnected(peer.to_string()))?;
        trace!(%peer, code = message.code, "sync: memory send");
        route
            .send(message)
            .await
            .map_err(|_| SyncError::PeerDisconnected(peer.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MsgType;

    fn ping() -> Message {
        Message { code: MsgType::PeerState.code(), payload: vec![0] }
    }

    #[tokio::test]
    async fn routes_to_registered_peer() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::channel(4);
        transport.register(PeerId::from("b"), tx);
        transport.send(&PeerId::from("b"), ping()).await.unwrap();
        assert_eq!(rx.recv().await, Some(ping()));
    }

    #[tokio::test]
    async fn unknown_or_closed_route_is_disconnect() {
        let transport = Arc::new(MemoryTransport::new());
        assert!(matches!(
            transport.send(&PeerId::from("x"), ping()).await,
            Err(SyncError::PeerDisconnected(_))
        ));

        let (tx, rx) = mpsc::channel(1);
        transport.register(PeerId::from("y"), tx);
        drop(rx);
        let handle = transport.clone().send_async(PeerId::from("y"), ping());
        assert!(matches!(handle.await.unwrap(), Err(SyncError::PeerDisconnected(_))));
    }
}
