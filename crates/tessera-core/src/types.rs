//! Core protocol types: hashes, keys, transactions, blocks, chain state.
//!
//! Header hashes are double SHA-256 over a fixed little-endian layout.
//! Transaction ids, addresses and state roots use BLAKE3.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte hash value.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. A header whose parent is zero is a genesis header.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A 20-byte account address, derived from a public key.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// An Ed25519 public key of a producer or transaction sender.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// Account address: the first 20 bytes of `BLAKE3(key)`.
    pub fn address(&self) -> Address {
        let digest = blake3::hash(&self.0);
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&digest.as_bytes()[..20]);
        Address(addr)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A value transfer between accounts.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Sender's sequence number. Must equal the account nonce when executed.
    pub nonce: u64,
    /// Sender's public key.
    pub from: PublicKey,
    /// Recipient address.
    pub to: Address,
    /// Amount transferred in base units.
    pub amount: u64,
    /// Price paid per unit of gas.
    pub gas_price: u64,
    /// Maximum gas the sender allows this transaction to consume.
    pub gas_limit: u64,
    /// Opaque payload.
    pub data: Vec<u8>,
    /// Sender signature over the unsigned fields.
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Transaction id: BLAKE3 over the fixed field layout, signature included.
    pub fn hash(&self) -> Hash256 {
        let mut hasher = self.unsigned_hasher();
        hasher.update(&self.signature);
        Hash256(hasher.finalize().into())
    }

    /// Message the sender signs: BLAKE3 over every field except the signature.
    pub fn signing_hash(&self) -> Hash256 {
        Hash256(self.unsigned_hasher().finalize().into())
    }

    /// Total the sender must hold: `amount + gas_limit * gas_price`.
    pub fn cost(&self) -> Option<u64> {
        self.gas_limit
            .checked_mul(self.gas_price)
            .and_then(|fee| fee.checked_add(self.amount))
    }

    fn unsigned_hasher(&self) -> blake3::Hasher {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.nonce.to_le_bytes());
        hasher.update(&self.from.0);
        hasher.update(&self.to.0);
        hasher.update(&self.amount.to_le_bytes());
        hasher.update(&self.gas_price.to_le_bytes());
        hasher.update(&self.gas_limit.to_le_bytes());
        hasher.update(&(self.data.len() as u64).to_le_bytes());
        hasher.update(&self.data);
        hasher
    }

    /// Sender account address.
    pub fn sender(&self) -> Address {
        self.from.address()
    }
}

/// Block header signed by the round's producers.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Network identifier.
    pub chain_id: u64,
    /// Protocol version.
    pub version: u32,
    /// Hash of the parent header. Zero for genesis.
    pub prev_hash: Hash256,
    /// Gas allowance for the block.
    pub gas_limit: u64,
    /// Gas consumed by the block's transactions.
    pub gas_used: u64,
    /// Height in the chain; genesis is 0.
    pub height: u64,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Account state root after executing the block.
    pub state_root: Hash256,
    /// Merkle root of the block's transactions.
    pub tx_root: Hash256,
    /// Merkle root of execution receipts.
    pub receipt_root: Hash256,
    /// Producer that proposed the block.
    pub leader: PublicKey,
    /// Producers eligible to co-sign the block.
    pub minors: Vec<PublicKey>,
}

impl BlockHeader {
    /// Compute the header hash (double SHA-256).
    ///
    /// Layout: chain_id || version || prev_hash || gas_limit || gas_used || height ||
    /// timestamp || state_root || tx_root || receipt_root || leader || minor count ||
    /// minors, integers little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(8 * 6 + 4 + 32 * (5 + self.minors.len()));
        data.extend_from_slice(&self.chain_id.to_le_bytes());
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(&self.gas_limit.to_le_bytes());
        data.extend_from_slice(&self.gas_used.to_le_bytes());
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(self.state_root.as_bytes());
        data.extend_from_slice(self.tx_root.as_bytes());
        data.extend_from_slice(self.receipt_root.as_bytes());
        data.extend_from_slice(&self.leader.0);
        data.extend_from_slice(&(self.minors.len() as u64).to_le_bytes());
        for minor in &self.minors {
            data.extend_from_slice(&minor.0);
        }
        let first = Sha256::digest(&data);
        Hash256(Sha256::digest(first).into())
    }
}

/// Producer signatures over the header hash.
///
/// Bit `i` of `bitmap` marks `minors[i]` as a signer; `signatures` holds one
/// signature per set bit, in minor order.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Proof {
    pub bitmap: Vec<u8>,
    pub signatures: Vec<Vec<u8>>,
}

impl Proof {
    /// Whether minor `index` is marked in the bitmap.
    pub fn is_set(&self, index: usize) -> bool {
        self.bitmap
            .get(index / 8)
            .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
    }

    /// Mark minor `index` as a signer.
    pub fn set(&mut self, index: usize) {
        let byte = index / 8;
        if self.bitmap.len() <= byte {
            self.bitmap.resize(byte + 1, 0);
        }
        self.bitmap[byte] |= 1 << (index % 8);
    }

    /// Public keys of the signers selected by the bitmap.
    pub fn signers(&self, minors: &[PublicKey]) -> Vec<PublicKey> {
        minors
            .iter()
            .enumerate()
            .filter(|(i, _)| self.is_set(*i))
            .map(|(_, pk)| *pk)
            .collect()
    }
}

/// A complete block: header, producer proof and transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    pub proof: Proof,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }
}

/// Balance and nonce of one account.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Account {
    pub balance: u64,
    pub nonce: u64,
}

/// The persisted chain tip record.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ChainState {
    pub tip_hash: Hash256,
    pub prev_hash: Hash256,
    pub height: u64,
}

impl ChainState {
    pub fn from_header(header: &BlockHeader) -> Self {
        Self {
            tip_hash: header.hash(),
            prev_hash: header.prev_hash,
            height: header.height,
        }
    }
}
