//! Protocol constants. All balances are in base units (1 TSR = 10^8 units).

pub const COIN: u64 = 100_000_000;

/// Header version accepted by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Chain identifier used when no configuration overrides it.
pub const DEFAULT_CHAIN_ID: u64 = 0x5453_5201;

/// Minimum the gas limit may ever be.
pub const MIN_GAS_LIMIT: u64 = 18_000_000;

/// Gas limit of the genesis block.
pub const GENESIS_GAS_LIMIT: u64 = 18_000_000;

/// Upper bound used by the default gas ceiling and the per-block adjustment span.
pub const MAX_GAS_LIMIT: u64 = 70_000_000;

/// Absolute cap on any header gas limit (2^63 - 1).
pub const GAS_LIMIT_CAP: u64 = 0x7fff_ffff_ffff_ffff;

/// Per-block gas limit adjustment step.
pub const GAS_LIMIT_SPAN: u64 = MAX_GAS_LIMIT / 360;

/// Gas charged for a plain value transfer.
pub const TX_GAS: u64 = 21_000;

/// Block reward split between the leader and the minor signers.
pub const BLOCK_REWARD: u64 = 100 * COIN;

/// Maximum number of blocks held in the orphan pool.
pub const MAX_ORPHAN_BLOCKS: usize = 40_960;

/// Time an orphan may wait for its parent before it is dropped.
pub const ORPHAN_TTL_SECS: u64 = 60 * 60;

/// Capacity step used when the chain view grows (one week at ten-minute blocks).
pub const APPROX_NODES_PER_WEEK: usize = 6 * 24 * 7;

/// Default TCP port for peer connections.
pub const DEFAULT_P2P_PORT: u16 = 45_100;
