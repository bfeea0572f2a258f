//! Synchronisation and gossip tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the [`BlockManager`](crate::manager::BlockManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Header hashes asked for per `HeaderReq`.
    pub max_header_hash_count_req: u64,
    /// Blocks asked for per `BlockReq`, and per `BlockResp` batch when serving.
    pub max_block_count_req: usize,
    /// Pending tasks (and in-flight body batches) above which the fetch loops pause.
    pub pending_timer_count: usize,
    /// Round-trip timeout for handshake and header requests, in milliseconds.
    pub network_timeout_ms: u64,
    /// Deadline for one body batch before its tasks are re-queued, in milliseconds.
    pub block_request_timeout_ms: u64,
    /// Times a single height may be re-queued before the fetch gives up.
    pub max_block_retries: u32,
    /// Period of the best-peer sync check, in milliseconds.
    pub sync_interval_ms: u64,
    /// Idle wait of the fetch loops when there is nothing to do, in milliseconds.
    pub poll_interval_ms: u64,
    /// Connections refused beyond this many registered peers.
    pub max_live_peers: usize,
    /// Chance that a relayed (non-local) item is forwarded to a given peer.
    pub broadcast_ratio: f64,
    /// Transactions per message when pushing the pool to a new peer.
    pub max_txs_per_msg: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_header_hash_count_req: 255,
            max_block_count_req: 16,
            pending_timer_count: 512,
            network_timeout_ms: 15_000,
            block_request_timeout_ms: 30_000,
            max_block_retries: 5,
            sync_interval_ms: 10_000,
            poll_interval_ms: 50,
            max_live_peers: 200,
            broadcast_ratio: 1.0 / 3.0,
            max_txs_per_msg: 128,
        }
    }
}

impl SyncConfig {
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn block_request_timeout(&self) -> Duration {
        Duration::from_millis(self.block_request_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Ratio clamped to `[0, 1]` for `rand::Rng::gen_bool`.
    pub fn relay_probability(&self) -> f64 {
        if self.broadcast_ratio.is_nan() {
            return 0.0;
        }
        self.broadcast_ratio.clamp(0.0, 1.0)
    }
}
