//! Acceptance pipeline scenarios with signed blocks and the default collaborators.

use ed25519_dalek::{Signer, SigningKey};
use tokio::sync::broadcast::error::TryRecvError;

use tessera_chain::config::GenesisAccount;
use tessera_chain::{ChainConfig, ChainEvent, ChainService, Collaborators};
use tessera_core::block_node::BlockStatus;
use tessera_core::error::{BlockError, ChainError};
use tessera_core::store::MemoryChainStore;
use tessera_core::types::{Address, Block, PublicKey};

// ------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------

fn producer_keys() -> Vec<SigningKey> {
    (1..=3u8).map(|i| SigningKey::from_bytes(&[i; 32])).collect()
}

fn public(key: &SigningKey) -> PublicKey {
    PublicKey(key.verifying_key().to_bytes())
}

fn config() -> ChainConfig {
    let producers: Vec<PublicKey> = producer_keys().iter().map(public).collect();
    ChainConfig {
        producers,
        genesis_accounts: vec![GenesisAccount {
            address: Address([5; 20]),
            balance: 1_000,
        }],
        ..ChainConfig::default()
    }
}

fn service() -> ChainService {
    let cfg = config();
    let collaborators = Collaborators::defaults(&cfg);
    let svc = ChainService::new(cfg, Box::new(MemoryChainStore::new()), collaborators);
    svc.init_states().unwrap();
    svc
}

/// Template on the tip of `svc`, signed by every producer. `branch` shifts the
/// timestamp so sibling branches hash differently.
fn signed_block(svc: &ChainService, branch: u64) -> Block {
    let keys = producer_keys();
    let minors: Vec<PublicKey> = keys.iter().map(public).collect();
    let ts = svc.best_chain().unwrap().timestamp() + 10 + branch;
    let mut block = svc.generate_template(minors[0], minors.clone(), ts).unwrap();
    let hash = block.hash();
    for (i, key) in keys.iter().enumerate() {
        block.proof.set(i);
        block.proof.signatures.push(key.sign(hash.as_bytes()).to_bytes().to_vec());
    }
    block
}

/// Extend `svc` by `count` blocks, returning them.
fn extend(svc: &ChainService, count: usize, branch: u64) -> Vec<Block> {
    (0..count)
        .map(|_| {
            let block = signed_block(svc, branch);
            svc.process_block(block.clone()).unwrap();
            block
        })
        .collect()
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<ChainEvent>) -> Vec<ChainEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => out.push(ev),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return out,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
}

// ------------------------------------------------------------------
// Proof checks
// ------------------------------------------------------------------

#[test]
fn signed_chain_extends() {
    let svc = service();
    let blocks = extend(&svc, 3, 0);
    assert_eq!(svc.height(), 3);
    assert_eq!(svc.best_chain().unwrap().hash(), blocks[2].hash());
}

#[test]
fn missing_signature_rejected() {
    let svc = service();
    let mut block = signed_block(&svc, 0);
    block.proof.signatures.pop();
    assert_eq!(
        svc.process_block(block),
        Err(ChainError::Block(BlockError::InvalidMultisig))
    );
    assert_eq!(svc.height(), 0);
}

#[test]
fn outsider_leader_rejected() {
    let svc = service();
    let mut block = signed_block(&svc, 0);
    block.header.leader = PublicKey([0xEE; 32]);
    assert!(matches!(
        svc.process_block(block),
        Err(ChainError::Block(BlockError::SignerNotAuthorized(_)))
    ));
}

// ------------------------------------------------------------------
// Reorganization
// ------------------------------------------------------------------

#[test]
fn fork_at_eight_reorgs_to_fifteen() {
    let local = service();
    let remote = service();
    let shared = extend(&local, 8, 0);
    for block in &shared {
        remote.process_block(block.clone()).unwrap();
    }
    let old = extend(&local, 2, 0);
    let new = extend(&remote, 7, 3);
    assert_eq!(local.height(), 10);
    assert_eq!(remote.height(), 15);

    let mut events = local.subscribe();
    for block in &new {
        local.process_block(block.clone()).unwrap();
    }
    assert_eq!(local.height(), 15);
    assert_eq!(local.best_chain().unwrap().hash(), new[6].hash());
    for h in 0..=15 {
        assert_eq!(local.main_chain_hash(h), remote.main_chain_hash(h));
    }

    let events = drain(&mut events);
    let detached: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            ChainEvent::Detached { height, .. } => Some(*height),
            _ => None,
        })
        .collect();
    assert_eq!(detached, vec![10, 9]);
    for block in &old {
        let count = events
            .iter()
            .filter(|e| matches!(e, ChainEvent::Detached { hash, .. } if *hash == block.hash()))
            .count();
        assert_eq!(count, 1);
    }
    let attached: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            ChainEvent::Attached { height, .. } => Some(*height),
            _ => None,
        })
        .collect();
    assert_eq!(attached, (9..=15).collect::<Vec<_>>());
}

#[test]
fn reorg_stops_at_bad_block() {
    let local = service();
    let remote = service();
    let shared = extend(&local, 2, 0);
    for block in &shared {
        remote.process_block(block.clone()).unwrap();
    }
    extend(&local, 1, 0);

    // Remote branch: one valid block, then one with a forged state root.
    let r3 = signed_block(&remote, 4);
    remote.process_block(r3.clone()).unwrap();
    let mut r4 = signed_block(&remote, 4);
    r4.header.state_root.0[0] ^= 0xFF;
    let keys = producer_keys();
    let hash = r4.hash();
    r4.proof.signatures = keys
        .iter()
        .map(|k| k.sign(hash.as_bytes()).to_bytes().to_vec())
        .collect();

    local.process_block(r3.clone()).unwrap();
    let err = local.process_block(r4.clone()).unwrap_err();
    assert!(matches!(err, ChainError::Block(BlockError::StateRootMismatch { .. })));

    // Fork point plus the block that attached before the failure.
    assert_eq!(local.best_chain().unwrap().hash(), r3.hash());
    assert!(local.block_status(&r4.hash()).unwrap().contains(BlockStatus::VALIDATE_FAILED));
}

#[test]
fn child_of_invalid_block_rejected() {
    let svc = service();
    let producer = service();
    let mut bad = signed_block(&producer, 0);
    bad.header.gas_used += 1;
    let keys = producer_keys();
    let hash = bad.hash();
    bad.proof.signatures = keys
        .iter()
        .map(|k| k.sign(hash.as_bytes()).to_bytes().to_vec())
        .collect();
    assert!(svc.process_block(bad.clone()).is_err());
    assert!(svc.block_status(&bad.hash()).unwrap().known_invalid());

    let mut child = bad.clone();
    child.header.prev_hash = bad.hash();
    child.header.height += 1;
    child.header.timestamp += 10;
    assert_eq!(
        svc.process_block(child.clone()),
        Err(ChainError::InvalidAncestor(child.hash()))
    );
}

// ------------------------------------------------------------------
// Orphans
// ------------------------------------------------------------------

#[test]
fn multi_block_gap_resolves_in_one_call() {
    let producer = service();
    let blocks = extend(&producer, 5, 0);

    let svc = service();
    for block in blocks[1..].iter().rev() {
        let outcome = svc.process_block(block.clone()).unwrap();
        assert!(outcome.orphan);
    }
    assert_eq!(svc.orphan_count(), 4);

    let outcome = svc.process_block(blocks[0].clone()).unwrap();
    assert!(outcome.main_chain);
    assert_eq!(svc.height(), 5);
    assert_eq!(svc.orphan_count(), 0);
}

#[test]
fn idempotent_redelivery() {
    let svc = service();
    let block = signed_block(&svc, 0);
    svc.process_block(block.clone()).unwrap();
    let before = svc.current_state();
    assert_eq!(
        svc.process_block(block.clone()),
        Err(ChainError::BlockAlreadyExists(block.hash()))
    );
    assert_eq!(svc.current_state(), before);
}
