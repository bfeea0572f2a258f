//! Full node composition and lifecycle.
//!
//! [`Node::init`] opens storage and brings the chain service up,
//! [`Node::run`] starts the listener, the synchroniser and bootstrap dials,
//! and [`Node::stop`] cancels everything and waits for it to wind down.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tessera_chain::{ChainService, Collaborators, ProcessOutcome};
use tessera_core::error::{ChainError, TesseraError};
use tessera_core::types::{Block, Transaction};
use tessera_sync::BlockManager;

use crate::config::NodeConfig;
use crate::storage::RocksStore;
use crate::transport::TcpTransport;

/// A running Tessera node.
pub struct Node {
    config: NodeConfig,
    chain: Arc<ChainService>,
    manager: Arc<BlockManager>,
    transport: Arc<TcpTransport>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Open storage, reconcile it and build the block manager.
    pub fn init(config: NodeConfig) -> Result<Arc<Self>, TesseraError> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| TesseraError::Storage(format!("create {}: {e}", config.data_dir.display())))?;
        let store = RocksStore::open(config.db_path())?;

        let collaborators = Collaborators::defaults(&config.chain);
        let chain = Arc::new(ChainService::new(config.chain.clone(), Box::new(store), collaborators));
        chain.init_states()?;

        let transport = Arc::new(TcpTransport::new());
        let manager = Arc::new(BlockManager::new(config.sync.clone(), chain.clone(), transport.clone()));

        info!(
            height = chain.height(),
            data_dir = %config.data_dir.display(),
            "node: initialised"
        );
        Ok(Arc::new(Self {
            config,
            chain,
            manager,
            transport,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Bind the listener, start the synchroniser and dial bootstrap peers.
    /// Returns the bound listen address.
    pub async fn run(self: &Arc<Self>) -> Result<SocketAddr, TesseraError> {
        let listener = TcpListener::bind(&self.config.listen)
            .await
            .map_err(|e| TesseraError::Config(format!("bind {}: {e}", self.config.listen)))?;
        let local = listener
            .local_addr()
            .map_err(|e| TesseraError::Config(e.to_string()))?;
        info!(%local, "node: listening");

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(self.transport.clone().listen(
            listener,
            self.manager.clone(),
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(self.manager.clone().run()));

        for addr in &self.config.peers {
            match self
                .transport
                .clone()
                .dial(addr, self.manager.clone(), self.cancel.clone())
                .await
            {
                Ok(handle) => {
                    let addr = addr.clone();
                    tasks.push(tokio::spawn(async move {
                        match handle.await {
                            Ok(Err(e)) => warn!(%addr, error = %e, "node: bootstrap peer dropped"),
                            Err(e) => warn!(%addr, error = %e, "node: connection task failed"),
                            Ok(Ok(())) => {}
                        }
                    }));
                }
                Err(e) => warn!(%addr, error = %e, "node: dial failed"),
            }
        }

        self.tasks.lock().extend(tasks);
        Ok(local)
    }

    /// Cancel every task and wait for them to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.manager.stop();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!(height = self.chain.height(), "node: stopped");
    }

    /// Accept a locally produced block and announce it.
    pub fn submit_block(&self, block: Block) -> Result<ProcessOutcome, ChainError> {
        let outcome = self.chain.process_block(block.clone())?;
        if outcome.main_chain {
            self.manager.broadcast_block(&block, true);
        }
        Ok(outcome)
    }

    /// Add a local transaction to the pool and gossip it.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<(), TesseraError> {
        self.manager.send_transaction(tx, true)?;
        Ok(())
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<ChainService> {
        &self.chain
    }

    pub fn manager(&self) -> &Arc<BlockManager> {
        &self.manager
    }

    pub fn connection_count(&self) -> usize {
        self.transport.connection_count()
    }
}
