//! Shared builders for scenario and property tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tessera_chain::{ChainConfig, ChainService, Collaborators};
use tessera_core::block_index::BlockIndex;
use tessera_core::block_node::{BlockNode, BlockStatus};
use tessera_core::store::MemoryChainStore;
use tessera_core::types::{Block, BlockHeader, Hash256, PublicKey};
use tessera_sync::{BlockManager, MemoryTransport, PeerId, SyncConfig};

// --- Header trees ---

/// Header at `height` on top of `prev`; `salt` separates siblings.
pub fn header(prev: Hash256, height: u64, salt: u64) -> BlockHeader {
    BlockHeader {
        chain_id: 1,
        version: 1,
        prev_hash: prev,
        gas_limit: 18_000_000,
        gas_used: 0,
        height,
        timestamp: 1_000 + height * 10 + salt,
        state_root: Hash256::ZERO,
        tx_root: Hash256::ZERO,
        receipt_root: Hash256::ZERO,
        leader: PublicKey::default(),
        minors: vec![],
    }
}

/// Index `header` as a valid node.
pub fn add(index: &BlockIndex, header: BlockHeader) -> Arc<BlockNode> {
    let node = Arc::new(BlockNode::new(header, BlockStatus::DATA_STORED.union(BlockStatus::VALID)));
    index.add_node(node.clone());
    node
}

/// Genesis node at height 0.
pub fn genesis(index: &BlockIndex) -> Arc<BlockNode> {
    add(index, header(Hash256::ZERO, 0, 0))
}

/// Grow `len` nodes above `from`; returns the branch tip-last (empty if `len == 0`).
pub fn branch(index: &BlockIndex, from: &Arc<BlockNode>, len: usize, salt: u64) -> Vec<Arc<BlockNode>> {
    let mut out = Vec::with_capacity(len);
    let mut parent = from.clone();
    for _ in 0..len {
        let node = add(index, header(parent.hash(), parent.height() + 1, salt));
        out.push(node.clone());
        parent = node;
    }
    out
}

// --- Chain services ---

/// A dev-mode chain service over a memory store.
pub fn dev_service() -> Arc<ChainService> {
    let config = ChainConfig::dev();
    let collaborators = Collaborators::defaults(&config);
    let svc = Arc::new(ChainService::new(
        config,
        Box::new(MemoryChainStore::new()),
        collaborators,
    ));
    if let Err(e) = svc.init_states() {
        panic!("init_states: {e}");
    }
    svc
}

/// Build one block on the current tip; `branch` shifts the timestamp so forks differ.
pub fn next_block(svc: &ChainService, branch: u64) -> Block {
    let tip = svc.best_chain().map(|n| n.timestamp()).unwrap_or_default();
    match svc.generate_template(PublicKey::default(), vec![], tip + 10 + branch) {
        Ok(block) => block,
        Err(e) => panic!("generate_template: {e}"),
    }
}

/// Extend `svc` by `count` blocks and return them.
pub fn extend(svc: &ChainService, count: usize, branch: u64) -> Vec<Block> {
    (0..count)
        .map(|_| {
            let block = next_block(svc, branch);
            if let Err(e) = svc.process_block(block.clone()) {
                panic!("process_block: {e}");
            }
            block
        })
        .collect()
}

/// Deliver `blocks` in order, ignoring duplicates.
pub fn deliver(svc: &ChainService, blocks: &[Block]) {
    for block in blocks {
        match svc.process_block(block.clone()) {
            Ok(_) => {}
            Err(e) if e.is_duplicate() => {}
            Err(e) => panic!("process_block: {e}"),
        }
    }
}

/// Whether both services agree on every main-chain height.
pub fn same_main_chain(a: &ChainService, b: &ChainService) -> bool {
    a.height() == b.height() && (0..=a.height()).all(|h| a.main_chain_hash(h) == b.main_chain_hash(h))
}

// --- In-process peers ---

/// A chain service with a block manager on a memory transport.
pub struct Peer {
    pub id: PeerId,
    pub chain: Arc<ChainService>,
    pub transport: Arc<MemoryTransport>,
    pub manager: Arc<BlockManager>,
}

/// Sync settings short enough for tests.
pub fn fast_sync_config() -> SyncConfig {
    SyncConfig {
        network_timeout_ms: 2_000,
        block_request_timeout_ms: 2_000,
        poll_interval_ms: 5,
        sync_interval_ms: 60_000,
        ..SyncConfig::default()
    }
}

pub fn peer(id: &str) -> Peer {
    peer_with(id, fast_sync_config())
}

pub fn peer_with(id: &str, config: SyncConfig) -> Peer {
    let chain = dev_service();
    let transport = Arc::new(MemoryTransport::new());
    let manager = Arc::new(BlockManager::new(config, chain.clone(), transport.clone()));
    Peer {
        id: PeerId::from(id),
        chain,
        transport,
        manager,
    }
}

/// Wire `a` and `b` together and wait for both handshakes.
pub async fn link(a: &Peer, b: &Peer) {
    let (to_b, b_inbound) = mpsc::channel(1024);
    let (to_a, a_inbound) = mpsc::channel(1024);
    a.transport.register(b.id.clone(), to_b);
    b.transport.register(a.id.clone(), to_a);

    let (manager, id) = (a.manager.clone(), b.id.clone());
    tokio::spawn(async move { manager.run_peer(id, a_inbound).await });
    let (manager, id) = (b.manager.clone(), a.id.clone());
    tokio::spawn(async move { manager.run_peer(id, b_inbound).await });

    wait_until(|| a.manager.peer(&b.id).is_some() && b.manager.peer(&a.id).is_some()).await;
}

/// Poll `cond` every 10 ms for up to five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
