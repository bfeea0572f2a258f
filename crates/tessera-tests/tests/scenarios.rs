//! End-to-end scenarios across chain service, block manager and node.

use tessera_chain::{ChainConfig, ChainEvent};
use tessera_core::error::ChainError;
use tessera_core::types::PublicKey;
use tessera_node_lib::{Node, NodeConfig};
use tessera_sync::SyncConfig;
use tessera_tests::helpers::*;

// ---------------------------------------------------------------------------
// Acceptance
// ---------------------------------------------------------------------------

#[test]
fn child_before_parent_is_promoted() {
    let source = dev_service();
    let prefix = extend(&source, 4, 0);
    let b1 = extend(&source, 1, 0).remove(0);
    let b2 = extend(&source, 1, 0).remove(0);
    assert_eq!((b1.header.height, b2.header.height), (5, 6));

    let target = dev_service();
    deliver(&target, &prefix);

    let outcome = target.process_block(b2.clone()).unwrap();
    assert!(outcome.orphan);
    assert!(target.is_known_orphan(&b2.hash()));
    assert_eq!(target.height(), 4);

    let outcome = target.process_block(b1.clone()).unwrap();
    assert!(outcome.main_chain);
    assert_eq!(target.height(), 6);
    assert_eq!(target.main_chain_hash(5), Some(b1.hash()));
    assert_eq!(target.main_chain_hash(6), Some(b2.hash()));
    assert!(!target.is_known_orphan(&b2.hash()));
    assert_eq!(target.orphan_count(), 0);
}

#[test]
fn redelivery_changes_nothing() {
    let svc = dev_service();
    let block = extend(&svc, 3, 0).remove(2);
    let leader = PublicKey::default().address();
    let (height, balance, state) = (svc.height(), svc.balance(&leader).unwrap(), svc.current_state());

    assert_eq!(
        svc.process_block(block.clone()),
        Err(ChainError::BlockAlreadyExists(block.hash()))
    );
    assert_eq!(svc.height(), height);
    assert_eq!(svc.balance(&leader).unwrap(), balance);
    assert_eq!(svc.current_state(), state);
}

// ---------------------------------------------------------------------------
// Gossip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn block_relays_across_a_line_of_peers() {
    let a = peer("a");
    let b = peer_with("b", SyncConfig { broadcast_ratio: 1.0, ..fast_sync_config() });
    let c = peer("c");
    link(&a, &b).await;
    link(&b, &c).await;

    let block = extend(&c.chain, 1, 0).remove(0);
    assert_eq!(c.manager.broadcast_block(&block, true), 1);

    wait_until(|| a.chain.height() == 1).await;
    assert_eq!(a.chain.main_chain_hash(1), Some(block.hash()));
    assert_eq!(b.chain.main_chain_hash(1), Some(block.hash()));
}

// ---------------------------------------------------------------------------
// Sync over TCP
// ---------------------------------------------------------------------------

fn node_config(dir: &tempfile::TempDir, peers: Vec<String>) -> NodeConfig {
    NodeConfig {
        data_dir: dir.path().to_path_buf(),
        chain: ChainConfig::dev(),
        sync: fast_sync_config(),
        listen: "127.0.0.1:0".to_string(),
        peers,
        ..NodeConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fork_at_eight_reorganises_over_tcp() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    // Shared prefix 1..=8; the remote then grows to 15.
    let remote = Node::init(node_config(&dir_b, vec![])).unwrap();
    let shared = extend(remote.chain(), 8, 0);
    extend(remote.chain(), 7, 5);
    let addr = remote.run().await.unwrap();

    // The local node grows its own branch to 10 before dialing.
    let local = Node::init(node_config(&dir_a, vec![addr.to_string()])).unwrap();
    deliver(local.chain(), &shared);
    let old = extend(local.chain(), 2, 0);
    assert_eq!(local.chain().height(), 10);
    assert_eq!(remote.chain().height(), 15);

    let mut events = local.chain().subscribe();
    local.run().await.unwrap();

    wait_until(|| local.chain().height() == 15).await;
    assert!(same_main_chain(local.chain(), remote.chain()));

    let mut detached = Vec::new();
    let mut attached = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            ChainEvent::Detached { hash, height } => detached.push((height, hash)),
            ChainEvent::Attached { height, .. } => attached.push(height),
        }
    }
    assert_eq!(detached, vec![(10, old[1].hash()), (9, old[0].hash())]);
    assert_eq!(attached, (9..=15).collect::<Vec<_>>());

    local.stop().await;
    remote.stop().await;
}
