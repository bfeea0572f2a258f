//! Error types for Tessera.
use thiserror::Error;

use crate::types::Hash256;

/// Structural and validation failures. Fatal to the block, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("chain id mismatch: got {got}, expected {expected}")] ChainIdMismatch { got: u64, expected: u64 },
    #[error("version mismatch: got {got}, expected {expected}")] VersionMismatch { got: u32, expected: u32 },
    #[error("previous hash does not match parent")] PrevHashMismatch,
    #[error("invalid height: got {got}, expected {expected}")] InvalidHeight { got: u64, expected: u64 },
    #[error("timestamp {got} not after parent {parent}")] InvalidTimestamp { got: u64, parent: u64 },
    #[error("gas limit too high: {0}")] GasLimitTooHigh(u64),
    #[error("gas used {used} exceeds gas limit {limit}")] GasUsedExceedsLimit { used: u64, limit: u64 },
    #[error("unexpected gas limit: got {got}, expected {expected}")] UnexpectedGasLimit { got: u64, expected: u64 },
    #[error("signer not in producer set: {0}")] SignerNotAuthorized(String),
    #[error("invalid multisignature")] InvalidMultisig,
    #[error("invalid transaction signature: {0}")] InvalidTxSignature(Hash256),
    #[error("transaction root mismatch: got {got}, expected {expected}")] TxRootMismatch { got: Hash256, expected: Hash256 },
    #[error("state root mismatch: got {got}, expected {expected}")] StateRootMismatch { got: Hash256, expected: Hash256 },
    #[error("gas used mismatch: got {got}, expected {expected}")] GasUsedMismatch { got: u64, expected: u64 },
    #[error("execution failed: {0}")] Execution(String),
}

/// Failures of the acceptance pipeline and the chain store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("block already exists: {0}")] BlockAlreadyExists(Hash256),
    #[error("orphan block already exists: {0}")] OrphanAlreadyExists(Hash256),
    #[error("block not found: {0}")] BlockNotFound(Hash256),
    #[error("block has a known invalid ancestor: {0}")] InvalidAncestor(Hash256),
    #[error(transparent)] Block(#[from] BlockError),
    #[error("init state: {0}")] InitState(String),
    #[error("storage: {0}")] Storage(String),
}

impl ChainError {
    /// Whether this error only reports a block we already hold.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            ChainError::BlockAlreadyExists(_) | ChainError::OrphanAlreadyExists(_)
        )
    }

    /// Whether the block itself is at fault, as opposed to the store.
    pub fn is_block_fault(&self) -> bool {
        matches!(self, ChainError::Block(_) | ChainError::InvalidAncestor(_))
    }
}

/// Protocol and timeout failures. Terminate the current sync attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("find ancestor timeout")] FindAncestorTimeout,
    #[error("get header hash timeout")] GetHeaderHashTimeout,
    #[error("fetch blocks timeout")] GetBlockTimeout,
    #[error("peer state timeout")] PeerStateTimeout,
    #[error("decode message: {0}")] Decode(String),
    #[error("encode message: {0}")] Encode(String),
    #[error("unexpected message: expected {expected}, got {got}")] UnexpectedMessage { expected: u64, got: u64 },
    #[error("unknown message type: {0}")] UnknownMessageType(u64),
    #[error("message too large: {size} > {max}")] MessageTooLarge { size: usize, max: usize },
    #[error("peer exceeds max peers")] TooManyPeers,
    #[error("no peers available")] NoPeers,
    #[error("no common ancestor")] NoCommonAncestor,
    #[error("non contiguous header at height {0}")] NonContiguousHeader(u64),
    #[error("peer disconnected: {0}")] PeerDisconnected(String),
    #[error("transport: {0}")] Transport(String),
    #[error("sync cancelled")] Cancelled,
    #[error(transparent)] Chain(#[from] ChainError),
}

/// Transaction pool rejections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxPoolError {
    #[error("transaction already in pool: {0}")] AlreadyKnown(Hash256),
    #[error("nonce too low: got {got}, expected at least {expected}")] NonceTooLow { got: u64, expected: u64 },
    #[error("pool full")] PoolFull,
    #[error("invalid transaction signature: {0}")] InvalidSignature(Hash256),
    #[error("intrinsic gas too low: got {got}, need {min}")] IntrinsicGasTooLow { got: u64, min: u64 },
    #[error("gas limit {got} exceeds block gas limit {max}")] GasLimitTooHigh { got: u64, max: u64 },
    #[error("insufficient balance: have {have}, need {need}")] InsufficientBalance { have: u64, need: u64 },
    #[error("transaction cost overflows")] CostOverflow,
    #[error(transparent)] Chain(#[from] ChainError),
}

#[derive(Error, Debug)]
pub enum TesseraError {
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Chain(#[from] ChainError),
    #[error(transparent)] Sync(#[from] SyncError),
    #[error(transparent)] TxPool(#[from] TxPoolError),
    #[error("storage: {0}")] Storage(String),
    #[error("config: {0}")] Config(String),
}
