//! TCP transport for the block manager.
//!
//! Each connection carries length-prefixed frames: a big-endian `u32` length
//! followed by a bincode-encoded [`Message`]. A reader task feeds decoded
//! messages into [`BlockManager::run_peer`]; a writer task drains the
//! connection's outbound queue.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tessera_core::error::SyncError;
use tessera_sync::protocol::{Message, MAX_MSG_SIZE};
use tessera_sync::{BlockManager, PeerId, Transport};

/// Frames buffered per connection before senders wait.
const OUTBOUND_QUEUE: usize = 256;
/// Decoded frames buffered ahead of the block manager.
const INBOUND_QUEUE: usize = 256;

fn io_error(e: io::Error) -> SyncError {
    SyncError::Transport(e.to_string())
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<(), SyncError> {
    let data = message.encode()?;
    let len = u32::try_from(data.len()).map_err(|_| SyncError::MessageTooLarge {
        size: data.len(),
        max: MAX_MSG_SIZE,
    })?;
    writer.write_u32(len).await.map_err(io_error)?;
    writer.write_all(&data).await.map_err(io_error)?;
    writer.flush().await.map_err(io_error)
}

/// Read one frame; `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>, SyncError> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(io_error(e)),
    };
    if len > MAX_MSG_SIZE {
        return Err(SyncError::MessageTooLarge { size: len, max: MAX_MSG_SIZE });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(io_error)?;
    Message::decode(&buf).map(Some)
}

/// Transport over `tokio::net` connections, keyed by remote socket address.
#[derive(Default)]
pub struct TcpTransport {
    outbound: DashMap<PeerId, mpsc::Sender<Message>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_count(&self) -> usize {
        self.outbound.len()
    }

    /// Accept connections until `cancel` fires, serving each on its own task.
    pub async fn listen(
        self: Arc<Self>,
        listener: TcpListener,
        manager: Arc<BlockManager>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "node: inbound connection");
                        let transport = self.clone();
                        let (manager, cancel) = (manager.clone(), cancel.clone());
                        tokio::spawn(async move {
                            if let Err(e) = transport.serve_connection(manager, stream, cancel).await {
                                debug!(%addr, error = %e, "node: inbound peer dropped");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "node: accept failed"),
                },
            }
        }
        debug!("node: listener stopped");
    }

    /// Dial `addr` and serve the connection on a new task.
    pub async fn dial(
        self: Arc<Self>,
        addr: &str,
        manager: Arc<BlockManager>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<Result<(), SyncError>>, SyncError> {
        let stream = TcpStream::connect(addr).await.map_err(io_error)?;
        info!(%addr, "node: connected to peer");
        Ok(tokio::spawn(self.serve_connection(manager, stream, cancel)))
    }

    /// Run one connection through the block manager until either side closes.
    pub async fn serve_connection(
        self: Arc<Self>,
        manager: Arc<BlockManager>,
        stream: TcpStream,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        let id = PeerId(stream.peer_addr().map_err(io_error)?.to_string());
        let (reader, writer) = stream.into_split();

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        if self.outbound.contains_key(&id) {
            return Err(SyncError::Transport(format!("duplicate connection {id}")));
        }
        self.outbound.insert(id.clone(), out_tx);

        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        let conn = cancel.child_token();
        let read_task = tokio::spawn(read_loop(id.clone(), reader, in_tx, conn.clone()));
        let write_task = tokio::spawn(write_loop(id.clone(), writer, out_rx, conn.clone()));

        let result = manager.run_peer(id.clone(), in_rx).await;
        conn.cancel();
        self.outbound.remove(&id);
        let _ = read_task.await;
        let _ = write_task.await;
        debug!(peer = %id, "node: connection closed");
        result
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, peer: &PeerId, message: Message) -> Result<(), SyncError> {
        let queue = self
            .outbound
            .get(peer)
            .map(|q| q.value().clone())
            .ok_or_else(|| SyncError::PeerDisconnected(peer.to_string()))?;
        queue
            .send(message)
            .await
            .map_err(|_| SyncError::PeerDisconnected(peer.to_string()))
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    id: PeerId,
    mut reader: R,
    inbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(message)) => {
                    trace!(peer = %id, code = message.code, "node: frame in");
                    if inbound.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(peer = %id, error = %e, "node: read failed");
                    break;
                }
            },
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    id: PeerId,
    mut writer: W,
    mut outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(e) = write_frame(&mut writer, &message).await {
            debug!(peer = %id, error = %e, "node: write failed");
            cancel.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_sync::protocol::{MsgType, PeerState};
    use tessera_sync::SyncMessage;

    fn state(height: u64) -> Message {
        SyncMessage::PeerState(PeerState { height }).to_message().unwrap()
    }

    #[tokio::test]
    async fn frames_cross_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &state(7)).await.unwrap();
        write_frame(&mut a, &state(8)).await.unwrap();
        drop(a);

        let first = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(first.msg_type(), Ok(MsgType::PeerState));
        assert_eq!(
            SyncMessage::from_message(&first).unwrap(),
            SyncMessage::PeerState(PeerState { height: 7 })
        );
        assert!(read_frame(&mut b).await.unwrap().is_some());
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_length_rejected_before_read() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_MSG_SIZE + 1) as u32).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(SyncError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn hostile_length_inside_frame_is_decode_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut body = vec![2u8, 253];
        body.extend_from_slice(&(1u64 << 40).to_le_bytes());
        a.write_u32(body.len() as u32).await.unwrap();
        a.write_all(&body).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(SyncError::Decode(_))));
    }

    #[tokio::test]
    async fn truncated_body_is_transport_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(10).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(SyncError::Transport(_))));
    }

    #[tokio::test]
    async fn send_to_unknown_peer_is_disconnect() {
        let transport = TcpTransport::new();
        assert!(matches!(
            transport.send(&PeerId::from("127.0.0.1:1"), state(1)).await,
            Err(SyncError::PeerDisconnected(_))
        ));
        assert_eq!(transport.connection_count(), 0);
    }
}
