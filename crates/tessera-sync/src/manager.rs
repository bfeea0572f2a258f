//! Block manager: peer handshake, message dispatch, gossip and chain sync.
//!
//! Synchronisation against one peer runs in two stages. [`BlockManager::find_ancestor`]
//! locates the highest block both chains share, checking near the local tip
//! first and falling back to a binary search. [`BlockManager::fetch_blocks`]
//! then runs a header loop that turns header hashes into height-sorted tasks,
//! and a body loop that requests those blocks in batches, feeds them into the
//! chain service and re-queues whatever did not arrive in time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tessera_chain::ChainService;
use tessera_core::error::{ChainError, SyncError, TxPoolError};
use tessera_core::types::{Block, BlockHeader, Hash256, Transaction};

use crate::config::SyncConfig;
use crate::peer::{PeerId, PeerInfo};
use crate::protocol::{
    BlockReq, BlockResp, HeaderReq, HeaderRsp, Message, MsgType, PeerState, PeerStateReq, SyncMessage,
    Transactions,
};
use crate::tasks::{HeightSortedTasks, SyncTask};
use crate::transport::Transport;

const HEADER_CHANNEL_SIZE: usize = 64;
const BLOCK_CHANNEL_SIZE: usize = 256;
const SYNC_EVENT_CAPACITY: usize = 16;

/// Fetch lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    Started,
    Stopped,
}

/// Header hashes received from one peer.
type HeaderBatch = (PeerId, Vec<SyncTask>);

/// Body request awaiting its blocks.
struct InFlight {
    tasks: HashMap<Hash256, u64>,
    deadline: Instant,
}

/// Header request awaiting its response: the peer asked and the first height.
type HeaderWait = (PeerId, u64);

/// One reserved live-peer slot, released on drop.
struct PeerSlot<'a> {
    count: &'a AtomicUsize,
}

impl Drop for PeerSlot<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Clears the single-fetch flag and reports `Stopped`, however the fetch ends.
struct FetchGuard<'a> {
    manager: &'a BlockManager,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.manager.syncing.store(false, Ordering::Release);
        let _ = self.manager.sync_events.send(SyncEvent::Stopped);
    }
}

/// Drives the peer protocol for one [`ChainService`].
pub struct BlockManager {
    config: SyncConfig,
    chain: Arc<ChainService>,
    transport: Arc<dyn Transport>,
    peers: DashMap<PeerId, Arc<PeerInfo>>,
    peer_slots: AtomicUsize,
    tasks: Mutex<HeightSortedTasks>,
    header_wait: Mutex<Option<HeaderWait>>,
    header_tx: mpsc::Sender<HeaderBatch>,
    header_rx: AsyncMutex<mpsc::Receiver<HeaderBatch>>,
    blocks_tx: mpsc::Sender<Vec<Block>>,
    blocks_rx: AsyncMutex<mpsc::Receiver<Vec<Block>>>,
    new_peer_tx: mpsc::Sender<Arc<PeerInfo>>,
    new_peer_rx: Mutex<Option<mpsc::Receiver<Arc<PeerInfo>>>>,
    syncing: AtomicBool,
    sync_events: broadcast::Sender<SyncEvent>,
    quit: CancellationToken,
}

impl BlockManager {
    pub fn new(config: SyncConfig, chain: Arc<ChainService>, transport: Arc<dyn Transport>) -> Self {
        let (header_tx, header_rx) = mpsc::channel(HEADER_CHANNEL_SIZE);
        let (blocks_tx, blocks_rx) = mpsc::channel(BLOCK_CHANNEL_SIZE);
        let (new_peer_tx, new_peer_rx) = mpsc::channel(config.max_live_peers.max(1));
        let (sync_events, _) = broadcast::channel(SYNC_EVENT_CAPACITY);
        Self {
            config,
            chain,
            transport,
            peers: DashMap::new(),
            peer_slots: AtomicUsize::new(0),
            tasks: Mutex::new(HeightSortedTasks::new()),
            header_wait: Mutex::new(None),
            header_tx,
            header_rx: AsyncMutex::new(header_rx),
            blocks_tx,
            blocks_rx: AsyncMutex::new(blocks_rx),
            new_peer_tx,
            new_peer_rx: Mutex::new(Some(new_peer_rx)),
            syncing: AtomicBool::new(false),
            sync_events,
            quit: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<ChainService> {
        &self.chain
    }

    pub fn peer(&self, id: &PeerId) -> Option<Arc<PeerInfo>> {
        self.peers.get(id).map(|p| p.value().clone())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync_events.subscribe()
    }

    /// Cancel the synchroniser, every peer loop and any running fetch.
    pub fn stop(&self) {
        info!("sync: stopping block manager");
        self.quit.cancel();
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    async fn send(&self, peer: &PeerId, msg: SyncMessage) -> Result<(), SyncError> {
        let message = msg.to_message()?;
        self.transport.send(peer, message).await
    }

    fn send_async(&self, peer: &PeerId, msg: SyncMessage) {
        match msg.to_message() {
            Ok(message) => {
                self.transport.clone().send_async(peer.clone(), message);
            }
            Err(e) => warn!(%peer, error = %e, "sync: failed to encode message"),
        }
    }

    async fn request_headers(&self, peer: &PeerId, from: u64, count: u64) -> Result<(), SyncError> {
        let to = from.saturating_add(count.saturating_sub(1));
        debug!(%peer, from, to, "sync: requesting headers");
        *self.header_wait.lock() = Some((peer.clone(), from));
        let sent = self
            .send(peer, SyncMessage::HeaderReq(HeaderReq { from_height: from, to_height: to }))
            .await;
        if sent.is_err() {
            self.header_wait.lock().take();
        }
        sent
    }

    /// Send one body request to the first peer whose height covers `batch`.
    async fn request_blocks(&self, batch: &[SyncTask]) -> Result<(), SyncError> {
        let max_height = batch.iter().map(|t| t.height).max().unwrap_or(0);
        let min_height = batch.iter().map(|t| t.height).min().unwrap_or(0);
        let message = SyncMessage::BlockReq(BlockReq {
            block_hashes: batch.iter().map(|t| t.hash).collect(),
        })
        .to_message()?;

        let candidates: Vec<Arc<PeerInfo>> = self
            .peers
            .iter()
            .filter(|p| p.height() >= max_height)
            .map(|p| p.value().clone())
            .collect();
        for peer in candidates {
            match self.transport.send(peer.id(), message.clone()).await {
                Ok(()) => {
                    debug!(peer = %peer.id(), count = batch.len(), from = min_height, to = max_height, "sync: requested block bodies");
                    return Ok(());
                }
                Err(e) => debug!(peer = %peer.id(), error = %e, "sync: body request failed"),
            }
        }
        Err(SyncError::NoPeers)
    }

    // ------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------

    /// Relay `block` to peers that do not know it yet. Non-local blocks reach
    /// each peer with probability `broadcast_ratio`. Returns the peers sent to.
    pub fn broadcast_block(&self, block: &Block, local: bool) -> usize {
        let hash = block.hash();
        let message = match SyncMessage::Block(Box::new(block.clone())).to_message() {
            Ok(m) => m,
            Err(e) => {
                warn!(%hash, error = %e, "sync: failed to encode block");
                return 0;
            }
        };
        let targets: Vec<Arc<PeerInfo>> = self.peers.iter().map(|p| p.value().clone()).collect();
        let ratio = self.config.relay_probability();
        let mut rng = rand::thread_rng();
        let mut sent = 0;
        for peer in targets {
            if peer.knows_block(&hash) || (!local && !rng.gen_bool(ratio)) {
                continue;
            }
            peer.mark_block(block);
            self.transport.clone().send_async(peer.id().clone(), message.clone());
            sent += 1;
        }
        trace!(%hash, local, sent, "sync: broadcast block");
        sent
    }

    /// Relay `tx` the same way as [`broadcast_block`](Self::broadcast_block).
    pub fn broadcast_tx(&self, tx: &Transaction, local: bool) -> usize {
        let hash = tx.hash();
        let message = match SyncMessage::Transaction(Transactions { transactions: vec![tx.clone()] }).to_message() {
            Ok(m) => m,
            Err(e) => {
                warn!(%hash, error = %e, "sync: failed to encode transaction");
                return 0;
            }
        };
        let targets: Vec<Arc<PeerInfo>> = self.peers.iter().map(|p| p.value().clone()).collect();
        let ratio = self.config.relay_probability();
        let mut rng = rand::thread_rng();
        let mut sent = 0;
        for peer in targets {
            if peer.knows_tx(&hash) || (!local && !rng.gen_bool(ratio)) {
                continue;
            }
            peer.mark_tx(tx);
            self.transport.clone().send_async(peer.id().clone(), message.clone());
            sent += 1;
        }
        sent
    }

    /// Admit `tx` through the chain's checks and relay it.
    pub fn send_transaction(&self, tx: Transaction, local: bool) -> Result<(), TxPoolError> {
        self.chain.add_transaction(tx.clone(), local)?;
        self.broadcast_tx(&tx, local);
        Ok(())
    }

    /// Push the local pending pool to `peer` in chunks.
    async fn push_pool(&self, peer: &PeerInfo) {
        let txs = self.chain.txpool().pending_transactions(u64::MAX);
        if txs.is_empty() {
            return;
        }
        debug!(peer = %peer.id(), count = txs.len(), "sync: pushing pool to new peer");
        for chunk in txs.chunks(self.config.max_txs_per_msg.max(1)) {
            for tx in chunk {
                peer.mark_tx(tx);
            }
            let msg = SyncMessage::Transaction(Transactions { transactions: chunk.to_vec() });
            if let Err(e) = self.send(peer.id(), msg).await {
                debug!(peer = %peer.id(), error = %e, "sync: pool push aborted");
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------

    /// Handshake with `id`, then dispatch its messages until `inbound` closes.
    ///
    /// Both sides open with `PeerStateReq`; the first message received must be
    /// the remote's `PeerStateReq`.
    pub async fn run_peer(self: &Arc<Self>, id: PeerId, mut inbound: mpsc::Receiver<Message>) -> Result<(), SyncError> {
        let _slot = self.reserve_peer_slot(&id)?;
        if self.peers.contains_key(&id) {
            return Err(SyncError::Transport(format!("duplicate peer {id}")));
        }

        self.send(&id, SyncMessage::PeerStateReq(PeerStateReq { height: self.chain.height() }))
            .await?;
        let first = match timeout(self.config.network_timeout(), inbound.recv()).await {
            Err(_) => return Err(SyncError::PeerStateTimeout),
            Ok(None) => return Err(SyncError::PeerDisconnected(id.to_string())),
            Ok(Some(msg)) => msg,
        };
        let req = match SyncMessage::from_message(&first)? {
            SyncMessage::PeerStateReq(req) => req,
            other => {
                return Err(SyncError::UnexpectedMessage {
                    expected: MsgType::PeerStateReq.code(),
                    got: other.msg_type().code(),
                });
            }
        };

        let peer = Arc::new(PeerInfo::new(id.clone(), req.height));
        match self.peers.entry(id.clone()) {
            Entry::Occupied(_) => return Err(SyncError::Transport(format!("duplicate peer {id}"))),
            Entry::Vacant(slot) => {
                slot.insert(peer.clone());
            }
        }
        info!(peer = %id, height = req.height, peers = self.peers.len(), "sync: peer connected");

        let result = async {
            self.send(&id, SyncMessage::PeerState(PeerState { height: self.chain.height() }))
                .await?;
            if self.new_peer_tx.try_send(peer.clone()).is_err() {
                debug!(peer = %id, "sync: new-peer queue full");
            }
            self.dispatch(&peer, &mut inbound).await
        }
        .await;

        self.peers.remove(&id);
        match &result {
            Ok(()) => info!(peer = %id, "sync: peer disconnected"),
            Err(e) => warn!(peer = %id, error = %e, "sync: peer dropped"),
        }
        result
    }

    /// Claim one of `max_live_peers` slots; held for the whole session.
    fn reserve_peer_slot(&self, id: &PeerId) -> Result<PeerSlot<'_>, SyncError> {
        let max = self.config.max_live_peers;
        let reserved = self
            .peer_slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1));
        if reserved.is_err() {
            warn!(peer = %id, max, "sync: refusing peer");
            return Err(SyncError::TooManyPeers);
        }
        Ok(PeerSlot { count: &self.peer_slots })
    }

    async fn dispatch(self: &Arc<Self>, peer: &Arc<PeerInfo>, inbound: &mut mpsc::Receiver<Message>) -> Result<(), SyncError> {
        loop {
            let msg = tokio::select! {
                _ = self.quit.cancelled() => return Ok(()),
                msg = inbound.recv() => match msg {
                    Some(msg) => msg,
                    None => return Ok(()),
                },
            };
            let msg = SyncMessage::from_message(&msg)?;
            trace!(peer = %peer.id(), msg_type = %msg.msg_type(), "sync: received");
            self.handle_message(peer, msg);
        }
    }

    fn handle_message(self: &Arc<Self>, peer: &Arc<PeerInfo>, msg: SyncMessage) {
        match msg {
            SyncMessage::BlockReq(req) => {
                let this = self.clone();
                let peer = peer.clone();
                tokio::spawn(async move { this.handle_block_req(&peer, req).await });
            }
            SyncMessage::BlockResp(resp) => {
                for block in &resp.blocks {
                    peer.mark_block(block);
                }
                if self.blocks_tx.try_send(resp.blocks).is_err() {
                    debug!(peer = %peer.id(), "sync: dropped block response");
                }
            }
            SyncMessage::Transaction(txs) => {
                for tx in txs.transactions {
                    peer.mark_tx(&tx);
                    if let Err(e) = self.send_transaction(tx, false) {
                        trace!(peer = %peer.id(), error = %e, "sync: pool rejected transaction");
                    }
                }
            }
            SyncMessage::Block(block) => self.handle_block(peer, *block),
            SyncMessage::PeerState(state) => peer.set_height(state.height),
            SyncMessage::PeerStateReq(req) => {
                peer.set_height(req.height);
                self.send_async(peer.id(), SyncMessage::PeerState(PeerState { height: self.chain.height() }));
            }
            SyncMessage::HeaderReq(req) => {
                let this = self.clone();
                let peer = peer.clone();
                tokio::spawn(async move { this.handle_header_req(&peer, req).await });
            }
            SyncMessage::HeaderRsp(rsp) => self.handle_header_rsp(peer, rsp),
        }
    }

    fn handle_block(&self, peer: &PeerInfo, block: Block) {
        let hash = block.hash();
        let height = block.header.height;
        let result = self.chain.process_block(block.clone());
        peer.mark_block(&block);
        match result {
            Ok(outcome) => {
                debug!(peer = %peer.id(), height, %hash, main_chain = outcome.main_chain, orphan = outcome.orphan, "sync: accepted gossiped block");
                self.broadcast_block(&block, false);
            }
            Err(e) if e.is_duplicate() => trace!(%hash, "sync: gossiped block already known"),
            Err(e) => warn!(peer = %peer.id(), height, %hash, error = %e, "sync: rejected gossiped block"),
        }
    }

    /// Serve main-chain blocks from the first requested hash's height to the last's.
    async fn handle_block_req(&self, peer: &PeerInfo, req: BlockReq) {
        let (Some(first), Some(last)) = (req.block_hashes.first(), req.block_hashes.last()) else {
            debug!(peer = %peer.id(), "sync: empty block request");
            return;
        };
        let Some(start) = self.chain.get_header_by_hash(first).map(|h| h.height) else {
            debug!(peer = %peer.id(), hash = %first, "sync: block request for unknown start");
            return;
        };
        let end = if last.is_zero() {
            self.chain.height()
        } else {
            match self.chain.get_header_by_hash(last) {
                Some(h) => h.height,
                None => {
                    debug!(peer = %peer.id(), hash = %last, "sync: block request for unknown end");
                    return;
                }
            }
        };

        let batch = self.config.max_block_count_req.max(1) as u64;
        let mut from = start;
        while from <= end {
            let size = batch.min(end - from + 1);
            let blocks = match self.chain.get_blocks_from(from, size) {
                Ok(blocks) if !blocks.is_empty() => blocks,
                Ok(_) => break,
                Err(e) => {
                    warn!(peer = %peer.id(), from, error = %e, "sync: failed to load blocks");
                    return;
                }
            };
            let count = blocks.len() as u64;
            if let Err(e) = self.send(peer.id(), SyncMessage::BlockResp(BlockResp { blocks })).await {
                debug!(peer = %peer.id(), error = %e, "sync: block response failed");
                return;
            }
            from += count;
        }
        debug!(peer = %peer.id(), start, end, "sync: served block request");
    }

    async fn handle_header_req(&self, peer: &PeerInfo, req: HeaderReq) {
        let cap = self.config.max_header_hash_count_req.max(1) as usize;
        let headers: Vec<BlockHeader> = (req.from_height..=req.to_height)
            .take(cap)
            .map_while(|h| self.chain.get_header_by_height(h))
            .collect();
        trace!(peer = %peer.id(), from = req.from_height, to = req.to_height, count = headers.len(), "sync: serving headers");
        if let Err(e) = self.send(peer.id(), SyncMessage::HeaderRsp(HeaderRsp { headers })).await {
            debug!(peer = %peer.id(), error = %e, "sync: header response failed");
        }
    }

    /// Forward `rsp` to the waiting header request it answers, or drop it.
    fn handle_header_rsp(&self, peer: &PeerInfo, rsp: HeaderRsp) {
        let answered = {
            let mut wait = self.header_wait.lock();
            let expected = matches!(
                wait.as_ref(),
                Some((asked, from)) if asked == peer.id() && rsp.headers.first().is_none_or(|h| h.height == *from)
            );
            if expected { wait.take() } else { None }
        };
        if answered.is_none() {
            warn!(peer = %peer.id(), count = rsp.headers.len(), "sync: unsolicited header response dropped");
            return;
        }
        if let Err(e) = self.check_header_chain(&rsp.headers) {
            warn!(peer = %peer.id(), error = %e, "sync: bad header response");
            return;
        }
        let tasks: Vec<SyncTask> = rsp
            .headers
            .iter()
            .map(|h| SyncTask { hash: h.hash(), height: h.height })
            .collect();
        if self.header_tx.try_send((peer.id().clone(), tasks)).is_err() {
            debug!(peer = %peer.id(), "sync: dropped header response");
        }
    }

    /// Headers must be height-contiguous, hash-linked and individually valid.
    fn check_header_chain(&self, headers: &[BlockHeader]) -> Result<(), SyncError> {
        for pair in headers.windows(2) {
            let (parent, header) = (&pair[0], &pair[1]);
            if header.height != parent.height + 1 || header.prev_hash != parent.hash() {
                return Err(SyncError::NonContiguousHeader(header.height));
            }
            self.chain.verify_header(header, parent).map_err(ChainError::from)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Synchronisation
    // ------------------------------------------------------------------

    /// Periodic and new-peer sync driver. Returns once [`stop`](Self::stop) is called.
    pub async fn run(self: Arc<Self>) {
        let Some(mut new_peers) = self.new_peer_rx.lock().take() else {
            warn!("sync: synchroniser already running");
            return;
        };
        let mut ticker = tokio::time::interval(self.config.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        info!(interval_ms = self.config.sync_interval_ms, "sync: synchroniser started");

        loop {
            tokio::select! {
                _ = self.quit.cancelled() => break,
                _ = ticker.tick() => self.sync_best_peer().await,
                Some(peer) = new_peers.recv() => {
                    let this = self.clone();
                    tokio::spawn(async move { this.push_pool(&peer).await });
                    self.sync_best_peer().await;
                }
            }
        }
        info!("sync: synchroniser stopped");
    }

    /// Highest peer, ties broken at random.
    pub fn best_peer(&self) -> Option<Arc<PeerInfo>> {
        let mut rng = rand::thread_rng();
        let mut best: Option<Arc<PeerInfo>> = None;
        for entry in self.peers.iter() {
            let peer = entry.value();
            best = match best {
                None => Some(peer.clone()),
                Some(current) if peer.height() > current.height() => Some(peer.clone()),
                Some(current) if peer.height() == current.height() && rng.gen_bool(0.5) => Some(peer.clone()),
                keep => keep,
            };
        }
        best
    }

    async fn sync_best_peer(self: &Arc<Self>) {
        let Some(peer) = self.best_peer() else {
            return;
        };
        let local = self.chain.height();
        if peer.height() <= local {
            return;
        }
        info!(peer = %peer.id(), remote = peer.height(), local, "sync: peer ahead, fetching");
        if let Err(e) = self.fetch_blocks(peer.clone()).await {
            warn!(peer = %peer.id(), error = %e, "sync: fetch failed");
        }
    }

    fn on_main_chain(&self, task: &SyncTask) -> bool {
        self.chain.main_chain_hash(task.height) == Some(task.hash)
    }

    /// Wait for the next header batch from `peer`, ignoring other peers.
    async fn recv_headers(
        &self,
        rx: &mut mpsc::Receiver<HeaderBatch>,
        peer: &PeerId,
        cancel: &CancellationToken,
        on_timeout: &SyncError,
    ) -> Result<Vec<SyncTask>, SyncError> {
        let deadline = Instant::now() + self.config.network_timeout();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = sleep_until(deadline) => {
                    self.header_wait.lock().take();
                    return Err(on_timeout.clone());
                }
                batch = rx.recv() => match batch {
                    Some((from, tasks)) if &from == peer => return Ok(tasks),
                    Some((from, _)) => trace!(%from, "sync: ignoring headers from another peer"),
                    None => return Err(SyncError::Cancelled),
                },
            }
        }
    }

    /// Height of the highest block shared with `peer`.
    pub async fn find_ancestor(&self, peer: &PeerInfo) -> Result<u64, SyncError> {
        self.find_ancestor_with(peer, &self.quit).await
    }

    async fn find_ancestor_with(&self, peer: &PeerInfo, cancel: &CancellationToken) -> Result<u64, SyncError> {
        let timeout_err = SyncError::FindAncestorTimeout;
        let remote = peer.height();
        let local = self.chain.height();
        let mut rx = self.header_rx.lock().await;
        while rx.try_recv().is_ok() {}

        self.request_headers(peer.id(), local, self.config.max_header_hash_count_req).await?;
        let near_tip = self.recv_headers(&mut rx, peer.id(), cancel, &timeout_err).await?;
        if let Some(found) = near_tip.iter().rev().find(|t| self.on_main_chain(t)) {
            debug!(peer = %peer.id(), height = found.height, "sync: ancestor found near tip");
            return Ok(found.height);
        }

        // `low` is always shared; `high` is exclusive.
        let mut low = 0u64;
        let mut high = remote.min(local).saturating_add(1);
        let mut rounds = 0u32;
        while low + 1 < high {
            let mid = low + (high - low) / 2;
            self.request_headers(peer.id(), mid, 1).await?;
            let reply = self.recv_headers(&mut rx, peer.id(), cancel, &timeout_err).await?;
            if reply.first().is_some_and(|t| t.height == mid && self.on_main_chain(t)) {
                low = mid;
            } else {
                high = mid;
            }
            rounds += 1;
        }

        if low == 0 {
            self.request_headers(peer.id(), 0, 1).await?;
            let reply = self.recv_headers(&mut rx, peer.id(), cancel, &timeout_err).await?;
            if !reply.first().is_some_and(|t| self.on_main_chain(t)) {
                return Err(SyncError::NoCommonAncestor);
            }
        }
        debug!(peer = %peer.id(), height = low, rounds, "sync: ancestor found by search");
        Ok(low)
    }

    async fn clear_sync_state(&self) {
        {
            let mut rx = self.header_rx.lock().await;
            while rx.try_recv().is_ok() {}
        }
        {
            let mut rx = self.blocks_rx.lock().await;
            while rx.try_recv().is_ok() {}
        }
        self.tasks.lock().clear();
    }

    /// Fetch every block `peer` has above the common ancestor.
    ///
    /// Only one fetch runs at a time; a concurrent call returns `Ok` at once.
    pub async fn fetch_blocks(self: &Arc<Self>, peer: Arc<PeerInfo>) -> Result<(), SyncError> {
        if self.syncing.swap(true, Ordering::AcqRel) {
            debug!(peer = %peer.id(), "sync: fetch already running");
            return Ok(());
        }
        let _guard = FetchGuard { manager: self.as_ref() };
        let _ = self.sync_events.send(SyncEvent::Started);

        let target = peer.height();
        let cancel = self.quit.child_token();
        self.clear_sync_state().await;
        let ancestor = self.find_ancestor_with(&peer, &cancel).await?;
        info!(peer = %peer.id(), ancestor, target, local = self.chain.height(), "sync: fetch started");

        let headers_done = Arc::new(AtomicBool::new(false));
        let (done_tx, mut done_rx) = mpsc::channel::<Result<(), SyncError>>(2);

        let header_loop = {
            let this = self.clone();
            let peer = peer.clone();
            let done = headers_done.clone();
            let cancel = cancel.clone();
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = this.header_loop(&peer, ancestor, target, &done, &cancel).await {
                    let _ = done_tx.send(Err(e)).await;
                }
            })
        };
        let body_loop = {
            let this = self.clone();
            let done = headers_done.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = this.body_loop(&done, &cancel).await;
                let _ = done_tx.send(result).await;
            })
        };

        let result = tokio::select! {
            r = done_rx.recv() => r.unwrap_or(Err(SyncError::Cancelled)),
            _ = self.quit.cancelled() => Err(SyncError::Cancelled),
        };
        cancel.cancel();
        let _ = header_loop.await;
        let _ = body_loop.await;
        self.tasks.lock().clear();

        match &result {
            Ok(()) => info!(peer = %peer.id(), height = self.chain.height(), "sync: fetch complete"),
            Err(e) => warn!(peer = %peer.id(), height = self.chain.height(), error = %e, "sync: fetch aborted"),
        }
        result
    }

    /// Turn header hashes above `ancestor` into tasks until `target` is covered.
    async fn header_loop(
        &self,
        peer: &PeerInfo,
        ancestor: u64,
        target: u64,
        done: &AtomicBool,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let timeout_err = SyncError::GetHeaderHashTimeout;
        let mut next = ancestor + 1;
        let mut rx = self.header_rx.lock().await;
        while next <= target {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if self.tasks.lock().len() >= self.config.pending_timer_count {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    _ = sleep(self.config.poll_interval()) => continue,
                }
            }

            self.request_headers(peer.id(), next, self.config.max_header_hash_count_req).await?;
            let batch = self.recv_headers(&mut rx, peer.id(), cancel, &timeout_err).await?;
            let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
                return Err(SyncError::NonContiguousHeader(next));
            };
            if first.height != next {
                return Err(SyncError::NonContiguousHeader(next));
            }
            let last = last.height;
            let pending = {
                let mut tasks = self.tasks.lock();
                for task in batch {
                    tasks.put(task);
                }
                tasks.len()
            };
            debug!(from = next, to = last, pending, "sync: queued header hashes");
            next = last + 1;
        }
        done.store(true, Ordering::Release);
        debug!(target, "sync: all header hashes queued");
        Ok(())
    }

    /// Request queued tasks in batches and feed arriving blocks to the chain.
    async fn body_loop(&self, headers_done: &AtomicBool, cancel: &CancellationToken) -> Result<(), SyncError> {
        let mut in_flight: HashMap<u64, InFlight> = HashMap::new();
        let mut retries: HashMap<u64, u32> = HashMap::new();
        let mut next_id = 0u64;
        let mut blocks_rx = self.blocks_rx.lock().await;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let room = in_flight.len() < self.config.pending_timer_count;
            if room {
                let batch = self.tasks.lock().pop_lowest(self.config.max_block_count_req.max(1));
                if !batch.is_empty() {
                    if let Err(e) = self.request_blocks(&batch).await {
                        let mut tasks = self.tasks.lock();
                        for task in batch {
                            tasks.put(task);
                        }
                        return Err(e);
                    }
                    in_flight.insert(
                        next_id,
                        InFlight {
                            tasks: batch.iter().map(|t| (t.hash, t.height)).collect(),
                            deadline: Instant::now() + self.config.block_request_timeout(),
                        },
                    );
                    next_id += 1;
                }
            }

            let queued = self.tasks.lock().len();
            if in_flight.is_empty() && queued == 0 && headers_done.load(Ordering::Acquire) {
                debug!("sync: all queued blocks fetched");
                return Ok(());
            }

            let now = Instant::now();
            let wake = if room && queued > 0 {
                now
            } else {
                let idle = now + self.config.poll_interval();
                in_flight.values().map(|b| b.deadline).min().map_or(idle, |d| d.min(idle))
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                blocks = blocks_rx.recv() => match blocks {
                    Some(blocks) => self.accept_fetched(blocks, &mut in_flight)?,
                    None => return Err(SyncError::Cancelled),
                },
                _ = sleep_until(wake) => self.expire_batches(&mut in_flight, &mut retries)?,
            }
        }
    }

    fn accept_fetched(&self, blocks: Vec<Block>, in_flight: &mut HashMap<u64, InFlight>) -> Result<(), SyncError> {
        for block in blocks {
            let hash = block.hash();
            let Some(id) = in_flight
                .iter()
                .find(|(_, b)| b.tasks.contains_key(&hash))
                .map(|(id, _)| *id)
            else {
                trace!(%hash, "sync: unrequested block ignored");
                continue;
            };
            let height = block.header.height;
            match self.chain.process_block(block) {
                Ok(outcome) => trace!(height, %hash, orphan = outcome.orphan, "sync: fetched block accepted"),
                Err(e) if e.is_duplicate() => trace!(height, %hash, "sync: fetched block already known"),
                Err(e) => {
                    warn!(height, %hash, error = %e, "sync: fetched block rejected");
                    return Err(e.into());
                }
            }
            if let Some(batch) = in_flight.get_mut(&id) {
                batch.tasks.remove(&hash);
                if batch.tasks.is_empty() {
                    in_flight.remove(&id);
                }
            }
        }
        Ok(())
    }

    /// Re-queue the unmatched tasks of every overdue batch.
    fn expire_batches(&self, in_flight: &mut HashMap<u64, InFlight>, retries: &mut HashMap<u64, u32>) -> Result<(), SyncError> {
        let now = Instant::now();
        let expired: Vec<u64> = in_flight
            .iter()
            .filter(|(_, b)| b.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            let Some(batch) = in_flight.remove(&id) else {
                continue;
            };
            warn!(missing = batch.tasks.len(), "sync: block request timed out, re-queueing");
            let mut tasks = self.tasks.lock();
            for (hash, height) in batch.tasks {
                let attempts = retries.entry(height).or_default();
                *attempts += 1;
                if *attempts > self.config.max_block_retries {
                    return Err(SyncError::GetBlockTimeout);
                }
                tasks.put(SyncTask { hash, height });
            }
        }
        Ok(())
    }
}
