//! Block acceptance, fork choice and reorganization.
//!
//! [`ChainService`] owns the block index, the main-chain view and the orphan
//! pool, and drives the store through one transaction per executed block.
//! The whole acceptance pipeline runs under a single add-block mutex.
//!
//! Lock order: add-block, then store, then chain state. The index, view and
//! orphan pool have their own locks and never call back into the service.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use tessera_core::block_index::BlockIndex;
use tessera_core::block_node::{BlockNode, BlockNodeRecord, BlockStatus};
use tessera_core::chain_view::ChainView;
use tessera_core::constants::TX_GAS;
use tessera_core::error::{BlockError, ChainError, TxPoolError};
use tessera_core::merkle;
use tessera_core::orphan::OrphanPool;
use tessera_core::store::ChainStore;
use tessera_core::traits::{BlockExecutor, RewardDistributor, SignatureVerifier, TxPool};
use tessera_core::types::{Address, Block, BlockHeader, ChainState, Hash256, Proof, PublicKey, Transaction};

use crate::config::ChainConfig;
use crate::executor::{LeaderMinorReward, TransferExecutor};
use crate::gas::calc_gas_limit;
use crate::genesis::{apply_genesis, genesis_block};
use crate::txpool::SimpleTxPool;
use crate::validator::{BlockValidator, ChainValidator, Ed25519Verifier, MultisigValidator};

/// Capacity of the chain event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// Result of [`ChainService::process_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// The block is now on the main chain.
    pub main_chain: bool,
    /// The block was parked in the orphan pool.
    pub orphan: bool,
}

/// Main-chain change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Attached { hash: Hash256, height: u64 },
    Detached { hash: Hash256, height: u64 },
}

/// External collaborators of the chain service.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn BlockExecutor>,
    pub reward: Arc<dyn RewardDistributor>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub txpool: Arc<dyn TxPool>,
}

impl Collaborators {
    /// Transfer executor, leader/minor reward, ed25519 verifier and a simple pool.
    pub fn defaults(config: &ChainConfig) -> Self {
        Self {
            executor: Arc::new(TransferExecutor),
            reward: Arc::new(LeaderMinorReward::new(config.block_reward)),
            verifier: Arc::new(Ed25519Verifier),
            txpool: Arc::new(SimpleTxPool::default()),
        }
    }
}

/// The acceptance and reorganization pipeline.
pub struct ChainService {
    config: ChainConfig,
    index: Arc<BlockIndex>,
    view: ChainView,
    orphans: OrphanPool,
    store: RwLock<Box<dyn ChainStore>>,
    state: RwLock<Option<ChainState>>,
    add_block_lock: Mutex<()>,
    validator: Box<dyn BlockValidator>,
    multisig: MultisigValidator,
    verifier: Arc<dyn SignatureVerifier>,
    executor: Arc<dyn BlockExecutor>,
    reward: Arc<dyn RewardDistributor>,
    txpool: Arc<dyn TxPool>,
    events: broadcast::Sender<ChainEvent>,
}

impl ChainService {
    /// Create the service. Call [`init_states`](Self::init_states) before use.
    pub fn new(config: ChainConfig, store: Box<dyn ChainStore>, collaborators: Collaborators) -> Self {
        let index = Arc::new(BlockIndex::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        if config.producers.is_empty() {
            warn!("chain: empty producer set, signer membership is not enforced");
        }
        Self {
            validator: Box::new(ChainValidator::new(&config)),
            multisig: MultisigValidator::new(Arc::clone(&collaborators.verifier), config.skip_check_multisig),
            verifier: collaborators.verifier,
            executor: collaborators.executor,
            reward: collaborators.reward,
            txpool: collaborators.txpool,
            view: ChainView::new(Arc::clone(&index), None),
            index,
            orphans: OrphanPool::new(),
            store: RwLock::new(store),
            state: RwLock::new(None),
            add_block_lock: Mutex::new(()),
            events,
            config,
        }
    }

    /// Replace the orphan pool, e.g. with tighter limits in tests.
    pub fn with_orphan_pool(mut self, orphans: OrphanPool) -> Self {
        self.orphans = orphans;
        self
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Bring the service up from whatever the store holds.
    ///
    /// Writes genesis on an empty store, repairs a chain-state record one
    /// block ahead of the account journal, rebuilds the index and sets the
    /// recorded tip.
    pub fn init_states(&self) -> Result<(), ChainError> {
        let _guard = self.add_block_lock.lock();
        let mut store = self.store.write();
        let genesis = genesis_block(&self.config);

        let mut chain_state = match store.get_chain_state()? {
            Some(cs) => cs,
            None => {
                store.put_block(&genesis)?;
                store.begin();
                apply_genesis(store.state(), &self.config)?;
                let root = store.state_root()?;
                if root != genesis.header.state_root {
                    store.discard();
                    return Err(ChainError::InitState(format!(
                        "genesis state root {root} does not match header {}",
                        genesis.header.state_root
                    )));
                }
                store.put_block_node(&BlockNodeRecord {
                    header: genesis.header.clone(),
                    status: BlockStatus::DATA_STORED.union(BlockStatus::VALID),
                })?;
                let cs = ChainState::from_header(&genesis.header);
                store.put_chain_state(&cs)?;
                store.commit(0)?;
                info!(hash = %cs.tip_hash, "chain: wrote genesis");
                cs
            }
        };

        let journal = store
            .journal_height()?
            .ok_or_else(|| ChainError::InitState("no state journal".into()))?;
        if chain_state.height == journal + 1 {
            warn!(
                state_height = chain_state.height,
                journal, "chain: chain state ahead of journal, repairing"
            );
            store.rollback_to_height(journal)?;
            let parent = store
                .get_block_node(&chain_state.prev_hash)?
                .ok_or_else(|| ChainError::InitState(format!("missing header {}", chain_state.prev_hash)))?;
            chain_state = ChainState::from_header(&parent.header);
            store.put_chain_state(&chain_state)?;
        } else if chain_state.height > journal + 1 {
            return Err(ChainError::InitState(format!(
                "chain state height {} is beyond journal height {journal}",
                chain_state.height
            )));
        } else if chain_state.height < journal {
            warn!(
                state_height = chain_state.height,
                journal, "chain: journal ahead of chain state, rolling back"
            );
            store.rollback_to_height(chain_state.height)?;
        }

        let records = store.block_nodes()?;
        match records.first() {
            Some(first) if first.header.hash() == genesis.hash() => {}
            Some(_) => return Err(ChainError::InitState("stored genesis does not match config".into())),
            None => return Err(ChainError::InitState("no block nodes stored".into())),
        }
        for record in records {
            self.index.add_node_clean(Arc::new(BlockNode::from_record(record)));
        }

        let tip = self
            .index
            .lookup(&chain_state.tip_hash)
            .ok_or_else(|| ChainError::InitState(format!("tip {} not indexed", chain_state.tip_hash)))?;
        self.view.set_tip(&tip);
        for node in self.view.nodes() {
            if !node.status().known_valid() {
                self.index.set_status_flags(&node, BlockStatus::VALID);
            }
        }
        *self.state.write() = Some(chain_state);

        self.index
            .flush_to_db(|node| store.put_block_node(&node.record()))?;
        info!(
            height = chain_state.height,
            tip = %chain_state.tip_hash,
            blocks = self.index.len(),
            "chain: initialised"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Acceptance pipeline
    // ------------------------------------------------------------------

    /// Run one block through the acceptance pipeline.
    pub fn process_block(&self, block: Block) -> Result<ProcessOutcome, ChainError> {
        let _guard = self.add_block_lock.lock();
        let hash = block.hash();

        if self.index.have_block(&hash) {
            return Err(ChainError::BlockAlreadyExists(hash));
        }
        if self.orphans.is_known_orphan(&hash) {
            return Err(ChainError::OrphanAlreadyExists(hash));
        }

        let prev = block.header.prev_hash;
        if !prev.is_zero() && !self.index.have_block(&prev) {
            debug!(%hash, %prev, height = block.header.height, "chain: parent unknown, orphaning");
            self.orphans.add(block);
            return Ok(ProcessOutcome {
                main_chain: false,
                orphan: true,
            });
        }

        let main_chain = self.maybe_accept_block(block)?;
        self.process_orphans(hash);
        Ok(ProcessOutcome {
            main_chain,
            orphan: false,
        })
    }

    /// Accept promoted orphans breadth-first, starting from the children of `hash`.
    fn process_orphans(&self, hash: Hash256) {
        let mut queue = VecDeque::from([hash]);
        while let Some(parent) = queue.pop_front() {
            for child in self.orphans.children_of(&parent) {
                let Some(orphan) = self.orphans.remove(&child) else {
                    continue;
                };
                match self.maybe_accept_block(orphan.block) {
                    Ok(_) => {
                        debug!(hash = %child, "orphan: promoted");
                        queue.push_back(child);
                    }
                    Err(e) => warn!(hash = %child, error = %e, "orphan: promotion failed"),
                }
            }
        }
    }

    /// Validate and store a block whose parent is indexed, then connect it.
    /// Returns whether the block ended on the main chain.
    fn maybe_accept_block(&self, block: Block) -> Result<bool, ChainError> {
        let hash = block.hash();
        let parent = self
            .index
            .lookup(&block.header.prev_hash)
            .ok_or(BlockError::PrevHashMismatch)?;
        if parent.status().known_invalid() {
            return Err(ChainError::InvalidAncestor(hash));
        }

        let node = self.accept_block(&block, &parent)?;
        self.connect_best_chain(&node, &block)
    }

    /// Header, body and proof validation followed by persistence and indexing.
    fn accept_block(&self, block: &Block, parent: &BlockNode) -> Result<Arc<BlockNode>, ChainError> {
        let hash = block.hash();
        let checks = self
            .validator
            .verify_header(&block.header, parent.header_ref())
            .and_then(|()| self.validator.verify_body(block))
            .and_then(|()| self.verify_tx_signatures(block))
            .and_then(|()| self.multisig.verify(block));
        if let Err(e) = checks {
            debug!(%hash, error = %e, "chain: block rejected");
            if let Some(node) = self.index.lookup(&hash) {
                self.index.set_status_flags(&node, BlockStatus::VALIDATE_FAILED);
                self.flush_index();
            }
            return Err(e.into());
        }

        self.store.write().put_block(block)?;
        let node = Arc::new(BlockNode::new(block.header.clone(), BlockStatus::DATA_STORED));
        self.index.add_node(Arc::clone(&node));
        self.flush_index();
        debug!(%hash, height = node.height(), "chain: block stored");
        Ok(node)
    }

    /// Every transaction must carry its sender's signature.
    fn verify_tx_signatures(&self, block: &Block) -> Result<(), BlockError> {
        match block.transactions.iter().find(|tx| !self.verifier.verify_transaction(tx)) {
            Some(tx) => Err(BlockError::InvalidTxSignature(tx.hash())),
            None => Ok(()),
        }
    }

    /// Decide where an accepted node goes: tip extension, side chain or reorganization.
    fn connect_best_chain(&self, node: &Arc<BlockNode>, block: &Block) -> Result<bool, ChainError> {
        let tip = self
            .view
            .tip()
            .ok_or_else(|| ChainError::InitState("chain not initialised".into()))?;

        if node.parent() == Some(tip.hash()) {
            if let Err(e) = self.connect_block(node, block) {
                if e.is_block_fault() {
                    self.index.set_status_flags(node, BlockStatus::VALIDATE_FAILED);
                    self.flush_index();
                }
                return Err(e);
            }
            self.index.set_status_flags(node, BlockStatus::VALID);
            self.flush_index();
            self.notify(ChainEvent::Attached {
                hash: node.hash(),
                height: node.height(),
            });
            info!(height = node.height(), hash = %node.hash(), "chain: extended tip");
            return Ok(true);
        }

        if node.height() <= tip.height() {
            debug!(
                height = node.height(),
                hash = %node.hash(),
                tip_height = tip.height(),
                "chain: stored side chain block"
            );
            return Ok(false);
        }

        self.reorganize(node)?;
        Ok(true)
    }

    /// Switch the main chain to the branch ending at `node`.
    fn reorganize(&self, node: &Arc<BlockNode>) -> Result<(), ChainError> {
        let tip = self
            .view
            .tip()
            .ok_or_else(|| ChainError::InitState("chain not initialised".into()))?;
        let fork = self
            .view
            .find_fork(node)
            .ok_or(ChainError::InvalidAncestor(node.hash()))?;

        let detach: Vec<Arc<BlockNode>> = ((fork.height() + 1)..=tip.height())
            .rev()
            .filter_map(|h| self.view.node_by_height(h))
            .collect();
        let mut attach: Vec<Arc<BlockNode>> = Vec::new();
        let mut current = Some(Arc::clone(node));
        while let Some(n) = current {
            if n.hash() == fork.hash() {
                break;
            }
            current = self.index.parent(&n);
            attach.push(n);
        }
        attach.reverse();

        if let Some(pos) = attach.iter().position(|n| n.status().known_invalid()) {
            let bad = attach[pos].hash();
            for n in &attach[pos + 1..] {
                self.index.set_status_flags(n, BlockStatus::INVALID_ANCESTOR);
            }
            self.flush_index();
            warn!(%bad, "chain: reorganization aborted, branch has invalid ancestor");
            return Err(ChainError::InvalidAncestor(bad));
        }

        info!(
            fork_height = fork.height(),
            detach = detach.len(),
            attach = attach.len(),
            new_tip = %node.hash(),
            "chain: reorganizing"
        );

        {
            let mut store = self.store.write();
            let fork_state = ChainState::from_header(fork.header_ref());
            store.put_chain_state(&fork_state)?;
            store.rollback_to_height(fork.height())?;
            let mut current = self.state.write();
            self.view.set_tip(&fork);
            *current = Some(fork_state);
        }

        for n in &detach {
            self.notify(ChainEvent::Detached {
                hash: n.hash(),
                height: n.height(),
            });
        }

        for (i, n) in attach.iter().enumerate() {
            let stored = self.store.read().get_block(&n.hash());
            let result = stored
                .and_then(|b| b.ok_or(ChainError::BlockNotFound(n.hash())))
                .and_then(|block| self.connect_block(n, &block));
            if let Err(e) = result {
                if e.is_block_fault() {
                    self.index.set_status_flags(n, BlockStatus::VALIDATE_FAILED);
                    for rest in &attach[i + 1..] {
                        self.index.set_status_flags(rest, BlockStatus::INVALID_ANCESTOR);
                    }
                    self.flush_index();
                }
                warn!(hash = %n.hash(), height = n.height(), error = %e, "chain: reorganization aborted");
                return Err(e);
            }
            self.index.set_status_flags(n, BlockStatus::VALID);
            self.notify(ChainEvent::Attached {
                hash: n.hash(),
                height: n.height(),
            });
        }
        self.flush_index();
        info!(height = node.height(), hash = %node.hash(), "chain: reorganization complete");
        Ok(())
    }

    /// Execute `block` on top of the current tip and commit it.
    fn connect_block(&self, node: &Arc<BlockNode>, block: &Block) -> Result<(), ChainError> {
        let mut store = self.store.write();
        store.begin();
        if let Err(e) = self.execute(&mut **store, block) {
            store.discard();
            return Err(e);
        }
        self.mark_state(&mut **store, node, block)
    }

    /// Run execution and reward, then check the header's claims.
    fn execute(&self, store: &mut dyn ChainStore, block: &Block) -> Result<(), ChainError> {
        let header = &block.header;
        let outcome = self
            .executor
            .execute_block(store.state(), block, header.gas_limit)?;
        self.reward.apply_reward(store.state(), block, outcome.gas_fee)?;

        if outcome.gas_used != header.gas_used {
            return Err(BlockError::GasUsedMismatch {
                got: outcome.gas_used,
                expected: header.gas_used,
            }
            .into());
        }
        let root = store.state_root()?;
        if root != header.state_root {
            return Err(BlockError::StateRootMismatch {
                got: root,
                expected: header.state_root,
            }
            .into());
        }
        Ok(())
    }

    /// Make `node` the tip: view, snapshot, chain-state record, commit, pool update.
    fn mark_state(
        &self,
        store: &mut dyn ChainStore,
        node: &Arc<BlockNode>,
        block: &Block,
    ) -> Result<(), ChainError> {
        let chain_state = ChainState::from_header(node.header_ref());
        let previous = *self.state.read();
        if let Err(e) = store
            .put_chain_state(&chain_state)
            .and_then(|()| store.commit(node.height()))
        {
            store.discard();
            if let Some(previous) = previous {
                if let Err(restore) = store.put_chain_state(&previous) {
                    warn!(error = %restore, "chain: failed to restore chain state record");
                }
            }
            warn!(height = node.height(), hash = %node.hash(), error = %e, "chain: commit failed");
            return Err(e);
        }
        {
            let mut current = self.state.write();
            self.view.set_tip(node);
            *current = Some(chain_state);
        }

        let mut senders: Vec<Address> = block.transactions.iter().map(|tx| tx.sender()).collect();
        senders.sort();
        senders.dedup();
        let mut confirmed = Vec::with_capacity(senders.len());
        for sender in senders {
            confirmed.push((sender, store.nonce(&sender)?));
        }
        if !confirmed.is_empty() {
            self.txpool.notify_confirmed(&confirmed);
        }
        Ok(())
    }

    fn flush_index(&self) {
        let mut store = self.store.write();
        if let Err(e) = self.index.flush_to_db(|node| store.put_block_node(&node.record())) {
            warn!(error = %e, dirty = self.index.dirty_count(), "chain: index flush failed");
        }
    }

    fn notify(&self, event: ChainEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------
    // Block templates
    // ------------------------------------------------------------------

    /// Build an unsigned block on the current tip from pending pool transactions.
    ///
    /// Transactions that fail execution are skipped. State changes are
    /// discarded; only the resulting roots and gas figures are kept.
    pub fn generate_template(
        &self,
        leader: PublicKey,
        minors: Vec<PublicKey>,
        timestamp: u64,
    ) -> Result<Block, ChainError> {
        let _guard = self.add_block_lock.lock();
        let parent = self
            .view
            .tip()
            .ok_or_else(|| ChainError::InitState("chain not initialised".into()))?;
        let gas_limit = calc_gas_limit(parent.header_ref(), self.config.gas_floor, self.config.gas_ceil);
        let candidates = self.txpool.pending_transactions(gas_limit);

        let mut block = Block {
            header: BlockHeader {
                chain_id: self.config.chain_id,
                version: self.config.version,
                prev_hash: parent.hash(),
                gas_limit,
                gas_used: 0,
                height: parent.height() + 1,
                timestamp: timestamp.max(parent.timestamp() + 1),
                state_root: Hash256::ZERO,
                tx_root: Hash256::ZERO,
                receipt_root: Hash256::ZERO,
                leader,
                minors,
            },
            proof: Proof::default(),
            transactions: Vec::with_capacity(candidates.len()),
        };

        let mut store = self.store.write();
        store.begin();
        let mut gas_fee = 0u64;
        for tx in candidates {
            if !self.verifier.verify_transaction(&tx) {
                debug!(hash = %tx.hash(), "chain: template skipped unsigned transaction");
                continue;
            }
            let remaining = gas_limit - block.header.gas_used;
            match self.executor.execute_transaction(store.state(), &tx, remaining) {
                Ok(outcome) => {
                    block.header.gas_used += outcome.gas_used;
                    gas_fee = gas_fee.saturating_add(outcome.gas_fee);
                    block.transactions.push(tx);
                }
                Err(e) => debug!(hash = %tx.hash(), error = %e, "chain: template skipped transaction"),
            }
        }
        let roots = self
            .reward
            .apply_reward(store.state(), &block, gas_fee)
            .and_then(|()| store.state_root());
        store.discard();

        block.header.state_root = roots?;
        block.header.tx_root = merkle::tx_root(&block.transactions);
        debug!(
            height = block.header.height,
            txs = block.transactions.len(),
            gas_used = block.header.gas_used,
            "chain: generated template"
        );
        Ok(block)
    }

    /// [`Self::generate_template`] stamped with the current wall-clock time.
    pub fn generate_template_now(&self, leader: PublicKey, minors: Vec<PublicKey>) -> Result<Block, ChainError> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.generate_template(leader, minors, now)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Check `tx` against the current tip and admit it to the pool.
    ///
    /// The signature must verify, the gas limit must cover [`TX_GAS`] and fit
    /// the tip's gas limit, and the sender must hold `amount + gas * price`.
    pub fn add_transaction(&self, tx: Transaction, local: bool) -> Result<(), TxPoolError> {
        let hash = tx.hash();
        if !self.verifier.verify_transaction(&tx) {
            return Err(TxPoolError::InvalidSignature(hash));
        }
        if tx.gas_limit < TX_GAS {
            return Err(TxPoolError::IntrinsicGasTooLow { got: tx.gas_limit, min: TX_GAS });
        }
        let max = self.view.tip().map(|tip| tip.header_ref().gas_limit).unwrap_or(0);
        if tx.gas_limit > max {
            return Err(TxPoolError::GasLimitTooHigh { got: tx.gas_limit, max });
        }
        let need = tx.cost().ok_or(TxPoolError::CostOverflow)?;
        let have = self.store.read().balance(&tx.sender())?;
        if have < need {
            return Err(TxPoolError::InsufficientBalance { have, need });
        }
        self.txpool.add_transaction(tx, local)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn txpool(&self) -> Arc<dyn TxPool> {
        Arc::clone(&self.txpool)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    pub fn current_state(&self) -> Option<ChainState> {
        *self.state.read()
    }

    /// Main-chain tip node.
    pub fn best_chain(&self) -> Option<Arc<BlockNode>> {
        self.view.tip()
    }

    /// Height of the main-chain tip.
    pub fn height(&self) -> u64 {
        self.view.height()
    }

    pub fn block_exists(&self, hash: &Hash256) -> bool {
        self.index.have_block(hash)
    }

    pub fn block_status(&self, hash: &Hash256) -> Option<BlockStatus> {
        self.index.node_status(hash)
    }

    pub fn is_known_orphan(&self, hash: &Hash256) -> bool {
        self.orphans.is_known_orphan(hash)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Hash of the main-chain block at `height`.
    pub fn main_chain_hash(&self, height: u64) -> Option<Hash256> {
        self.view.node_by_height(height).map(|n| n.hash())
    }

    /// Whether `hash` is on the main chain.
    pub fn is_main_chain(&self, hash: &Hash256) -> bool {
        self.index.lookup(hash).is_some_and(|n| self.view.contains(&n))
    }

    pub fn get_header_by_hash(&self, hash: &Hash256) -> Option<BlockHeader> {
        self.index.lookup(hash).map(|n| n.header())
    }

    pub fn get_header_by_height(&self, height: u64) -> Option<BlockHeader> {
        self.view.node_by_height(height).map(|n| n.header())
    }

    pub fn get_block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        self.store.read().get_block(hash)
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, ChainError> {
        match self.view.node_by_height(height) {
            Some(node) => self.store.read().get_block(&node.hash()),
            None => Ok(None),
        }
    }

    /// Up to `size` main-chain blocks starting at height `start`.
    pub fn get_blocks_from(&self, start: u64, size: u64) -> Result<Vec<Block>, ChainError> {
        let store = self.store.read();
        let mut blocks = Vec::new();
        for height in start..start.saturating_add(size) {
            let Some(node) = self.view.node_by_height(height) else {
                break;
            };
            match store.get_block(&node.hash())? {
                Some(block) => blocks.push(block),
                None => return Err(ChainError::BlockNotFound(node.hash())),
            }
        }
        Ok(blocks)
    }

    /// Account balance in the committed state.
    pub fn balance(&self, addr: &Address) -> Result<u64, ChainError> {
        self.store.read().balance(addr)
    }

    pub fn nonce(&self, addr: &Address) -> Result<u64, ChainError> {
        self.store.read().nonce(addr)
    }

    /// Validate `header` as a child of `parent` without touching chain state.
    pub fn verify_header(&self, header: &BlockHeader, parent: &BlockHeader) -> Result<(), BlockError> {
        self.validator.verify_header(header, parent)
    }
}
