//! Block validation.
//!
//! - [`ChainValidator`]: header linkage, gas bounds, signer membership and tx root
//! - [`MultisigValidator`]: producer proof against the header's minors
//! - [`Ed25519Verifier`]: per-signer ed25519 check used as the default verifier,
//!   for producer proofs and transaction signatures

use std::collections::HashSet;
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use tessera_core::constants::GAS_LIMIT_CAP;
use tessera_core::error::BlockError;
use tessera_core::merkle;
use tessera_core::traits::SignatureVerifier;
use tessera_core::types::{Block, BlockHeader, PublicKey, Transaction};

use crate::config::ChainConfig;
use crate::gas::calc_gas_limit;

/// Header and body rules applied before a block is stored.
pub trait BlockValidator: Send + Sync {
    /// Validate `header` as a child of `parent`.
    fn verify_header(&self, header: &BlockHeader, parent: &BlockHeader) -> Result<(), BlockError>;

    /// Validate the body against the header.
    fn verify_body(&self, block: &Block) -> Result<(), BlockError>;
}

/// Default [`BlockValidator`].
pub struct ChainValidator {
    chain_id: u64,
    version: u32,
    producers: HashSet<PublicKey>,
    gas_floor: u64,
    gas_ceil: u64,
}

impl ChainValidator {
    pub fn new(config: &ChainConfig) -> Self {
        Self {
            chain_id: config.chain_id,
            version: config.version,
            producers: config.producers.iter().copied().collect(),
            gas_floor: config.gas_floor,
            gas_ceil: config.gas_ceil,
        }
    }

    fn check_signer(&self, key: &PublicKey) -> Result<(), BlockError> {
        if self.producers.is_empty() || self.producers.contains(key) {
            Ok(())
        } else {
            Err(BlockError::SignerNotAuthorized(key.to_string()))
        }
    }
}

impl BlockValidator for ChainValidator {
    fn verify_header(&self, header: &BlockHeader, parent: &BlockHeader) -> Result<(), BlockError> {
        if header.chain_id != self.chain_id {
            return Err(BlockError::ChainIdMismatch {
                got: header.chain_id,
                expected: self.chain_id,
            });
        }
        if header.version != self.version {
            return Err(BlockError::VersionMismatch {
                got: header.version,
                expected: self.version,
            });
        }
        if header.prev_hash != parent.hash() {
            return Err(BlockError::PrevHashMismatch);
        }
        if header.height != parent.height + 1 {
            return Err(BlockError::InvalidHeight {
                got: header.height,
                expected: parent.height + 1,
            });
        }
        if header.timestamp <= parent.timestamp {
            return Err(BlockError::InvalidTimestamp {
                got: header.timestamp,
                parent: parent.timestamp,
            });
        }
        if header.gas_limit > GAS_LIMIT_CAP {
            return Err(BlockError::GasLimitTooHigh(header.gas_limit));
        }
        if header.gas_used > header.gas_limit {
            return Err(BlockError::GasUsedExceedsLimit {
                used: header.gas_used,
                limit: header.gas_limit,
            });
        }
        let expected = calc_gas_limit(parent, self.gas_floor, self.gas_ceil);
        if header.gas_limit != expected {
            return Err(BlockError::UnexpectedGasLimit {
                got: header.gas_limit,
                expected,
            });
        }
        self.check_signer(&header.leader)?;
        for minor in &header.minors {
            self.check_signer(minor)?;
        }
        Ok(())
    }

    fn verify_body(&self, block: &Block) -> Result<(), BlockError> {
        let root = merkle::tx_root(&block.transactions);
        if root != block.header.tx_root {
            return Err(BlockError::TxRootMismatch {
                got: root,
                expected: block.header.tx_root,
            });
        }
        Ok(())
    }
}

/// Checks the producer proof of a block.
pub struct MultisigValidator {
    verifier: Arc<dyn SignatureVerifier>,
    skip: bool,
}

impl MultisigValidator {
    pub fn new(verifier: Arc<dyn SignatureVerifier>, skip: bool) -> Self {
        Self { verifier, skip }
    }

    /// Require at least one signer, one signature per set bit, and a passing
    /// aggregate verification. A no-op when constructed with `skip`.
    pub fn verify(&self, block: &Block) -> Result<(), BlockError> {
        if self.skip {
            return Ok(());
        }
        let signers = block.proof.signers(&block.header.minors);
        if signers.is_empty() || signers.len() != block.proof.signatures.len() {
            return Err(BlockError::InvalidMultisig);
        }
        if !self.verifier.verify_aggregate(block, &signers) {
            return Err(BlockError::InvalidMultisig);
        }
        Ok(())
    }
}

/// Verifies each proof signature independently with ed25519 over the header hash.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify_aggregate(&self, block: &Block, signers: &[PublicKey]) -> bool {
        if signers.len() != block.proof.signatures.len() {
            return false;
        }
        let msg = block.hash();
        signers
            .iter()
            .zip(&block.proof.signatures)
            .all(|(signer, sig)| {
                let Ok(key) = VerifyingKey::from_bytes(&signer.0) else {
                    return false;
                };
                let Ok(sig) = Signature::from_slice(sig) else {
                    return false;
                };
                key.verify_strict(msg.as_bytes(), &sig).is_ok()
            })
    }

    fn verify_transaction(&self, tx: &Transaction) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&tx.from.0) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&tx.signature) else {
            return false;
        };
        key.verify_strict(tx.signing_hash().as_bytes(), &sig).is_ok()
    }
}

/// Set `tx.from` to `key`'s public key and sign the transaction.
pub fn sign_transaction(tx: &mut Transaction, key: &SigningKey) {
    tx.from = PublicKey(key.verifying_key().to_bytes());
    tx.signature = key.sign(tx.signing_hash().as_bytes()).to_bytes().to_vec();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::constants::{GENESIS_GAS_LIMIT, MIN_GAS_LIMIT};
    use tessera_core::types::{Hash256, Proof};

    fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn pk(key: &SigningKey) -> PublicKey {
        PublicKey(key.verifying_key().to_bytes())
    }

    fn parent() -> BlockHeader {
        BlockHeader {
            chain_id: 7,
            version: 1,
            prev_hash: Hash256::ZERO,
            gas_limit: GENESIS_GAS_LIMIT,
            gas_used: 0,
            height: 0,
            timestamp: 100,
            state_root: Hash256::ZERO,
            tx_root: merkle::tx_root(&[]),
            receipt_root: Hash256::ZERO,
            leader: PublicKey::default(),
            minors: vec![],
        }
    }

    fn child(parent: &BlockHeader, producers: &[PublicKey]) -> BlockHeader {
        BlockHeader {
            prev_hash: parent.hash(),
            height: parent.height + 1,
            timestamp: parent.timestamp + 10,
            gas_limit: MIN_GAS_LIMIT,
            leader: producers.first().copied().unwrap_or_default(),
            minors: producers.to_vec(),
            ..parent.clone()
        }
    }

    fn validator(producers: Vec<PublicKey>) -> ChainValidator {
        ChainValidator::new(&ChainConfig {
            chain_id: 7,
            producers,
            ..ChainConfig::default()
        })
    }

    // --- Header ---

    #[test]
    fn valid_child_passes() {
        let p = parent();
        let v = validator(vec![]);
        v.verify_header(&child(&p, &[]), &p).unwrap();
    }

    #[test]
    fn header_rule_violations() {
        let p = parent();
        let v = validator(vec![]);

        let mut h = child(&p, &[]);
        h.chain_id = 8;
        assert!(matches!(v.verify_header(&h, &p), Err(BlockError::ChainIdMismatch { .. })));

        let mut h = child(&p, &[]);
        h.version = 2;
        assert!(matches!(v.verify_header(&h, &p), Err(BlockError::VersionMismatch { .. })));

        let mut h = child(&p, &[]);
        h.prev_hash = Hash256([1; 32]);
        assert_eq!(v.verify_header(&h, &p), Err(BlockError::PrevHashMismatch));

        let mut h = child(&p, &[]);
        h.height = 5;
        assert_eq!(
            v.verify_header(&h, &p),
            Err(BlockError::InvalidHeight { got: 5, expected: 1 })
        );

        let mut h = child(&p, &[]);
        h.timestamp = p.timestamp;
        assert!(matches!(v.verify_header(&h, &p), Err(BlockError::InvalidTimestamp { .. })));

        let mut h = child(&p, &[]);
        h.gas_limit = GAS_LIMIT_CAP + 1;
        assert!(matches!(v.verify_header(&h, &p), Err(BlockError::GasLimitTooHigh(_))));

        let mut h = child(&p, &[]);
        h.gas_used = h.gas_limit + 1;
        assert!(matches!(v.verify_header(&h, &p), Err(BlockError::GasUsedExceedsLimit { .. })));

        let mut h = child(&p, &[]);
        h.gas_limit += 1;
        assert!(matches!(v.verify_header(&h, &p), Err(BlockError::UnexpectedGasLimit { .. })));
    }

    #[test]
    fn unknown_signer_rejected() {
        let p = parent();
        let member = pk(&signing_key(1));
        let outsider = pk(&signing_key(2));
        let v = validator(vec![member]);
        v.verify_header(&child(&p, &[member]), &p).unwrap();
        assert!(matches!(
            v.verify_header(&child(&p, &[member, outsider]), &p),
            Err(BlockError::SignerNotAuthorized(_))
        ));
    }

    #[test]
    fn tx_root_checked() {
        let p = parent();
        let mut block = Block {
            header: child(&p, &[]),
            proof: Proof::default(),
            transactions: vec![],
        };
        validator(vec![]).verify_body(&block).unwrap();
        block.header.tx_root = Hash256([3; 32]);
        assert!(matches!(
            validator(vec![]).verify_body(&block),
            Err(BlockError::TxRootMismatch { .. })
        ));
    }

    // --- Multisig ---

    fn signed_block(keys: &[SigningKey], signing: &[usize]) -> Block {
        let producers: Vec<PublicKey> = keys.iter().map(pk).collect();
        let mut block = Block {
            header: child(&parent(), &producers),
            proof: Proof::default(),
            transactions: vec![],
        };
        let hash = block.hash();
        for &i in signing {
            block.proof.set(i);
            block
                .proof
                .signatures
                .push(keys[i].sign(hash.as_bytes()).to_bytes().to_vec());
        }
        block
    }

    #[test]
    fn valid_proof_accepted() {
        let keys = vec![signing_key(1), signing_key(2), signing_key(3)];
        let block = signed_block(&keys, &[0, 2]);
        MultisigValidator::new(Arc::new(Ed25519Verifier), false)
            .verify(&block)
            .unwrap();
    }

    #[test]
    fn tampered_proof_rejected() {
        let keys = vec![signing_key(1), signing_key(2)];
        let mut block = signed_block(&keys, &[0, 1]);
        block.proof.signatures.swap(0, 1);
        let multisig = MultisigValidator::new(Arc::new(Ed25519Verifier), false);
        assert_eq!(multisig.verify(&block), Err(BlockError::InvalidMultisig));

        let empty = signed_block(&keys, &[]);
        assert_eq!(multisig.verify(&empty), Err(BlockError::InvalidMultisig));
    }

    #[test]
    fn skip_accepts_anything() {
        let keys = vec![signing_key(1)];
        let block = signed_block(&keys, &[]);
        MultisigValidator::new(Arc::new(Ed25519Verifier), true)
            .verify(&block)
            .unwrap();
    }

    // --- transaction signatures ---

    fn transfer() -> Transaction {
        Transaction {
            nonce: 0,
            from: PublicKey::default(),
            to: tessera_core::types::Address([9; 20]),
            amount: 100,
            gas_price: 1,
            gas_limit: 21_000,
            data: vec![],
            signature: vec![],
        }
    }

    #[test]
    fn signed_transaction_verifies() {
        let key = signing_key(4);
        let mut tx = transfer();
        sign_transaction(&mut tx, &key);
        assert_eq!(tx.from, pk(&key));
        assert!(Ed25519Verifier.verify_transaction(&tx));
    }

    #[test]
    fn forged_transactions_rejected() {
        let key = signing_key(4);
        let mut tx = transfer();
        sign_transaction(&mut tx, &key);

        let mut tampered = tx.clone();
        tampered.amount = 900_000;
        assert!(!Ed25519Verifier.verify_transaction(&tampered));

        let mut other_sender = tx.clone();
        other_sender.from = pk(&signing_key(5));
        assert!(!Ed25519Verifier.verify_transaction(&other_sender));

        let mut junk = tx;
        junk.signature = vec![0xDE, 0xAD];
        assert!(!Ed25519Verifier.verify_transaction(&junk));
        assert!(!Ed25519Verifier.verify_transaction(&transfer()));
    }
}
