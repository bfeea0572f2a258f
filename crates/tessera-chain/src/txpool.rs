//! Nonce-ordered pool of pending transfers.
//!
//! Transactions are grouped per sender and keyed by nonce. Template selection
//! takes each sender's contiguous run starting at its next expected nonce.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;
use tracing::debug;

use tessera_core::error::TxPoolError;
use tessera_core::traits::TxPool;
use tessera_core::types::{Address, Hash256, Transaction};

/// Default maximum number of pooled transactions.
pub const DEFAULT_MAX_COUNT: usize = 4_096;

#[derive(Default)]
struct PoolInner {
    by_sender: BTreeMap<Address, BTreeMap<u64, Transaction>>,
    known: HashSet<Hash256>,
    /// Next expected nonce per sender, from confirmed blocks.
    next_nonce: HashMap<Address, u64>,
}

impl PoolInner {
    fn len(&self) -> usize {
        self.known.len()
    }
}

/// Default [`TxPool`].
pub struct SimpleTxPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
}

impl Default for SimpleTxPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COUNT)
    }
}

impl SimpleTxPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            capacity,
        }
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.inner.lock().known.contains(hash)
    }
}

impl TxPool for SimpleTxPool {
    fn pending_transactions(&self, gas_limit: u64) -> Vec<Transaction> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        let mut gas = 0u64;
        for (sender, txs) in &inner.by_sender {
            let mut expected = inner
                .next_nonce
                .get(sender)
                .copied()
                .or_else(|| txs.keys().next().copied())
                .unwrap_or(0);
            for (nonce, tx) in txs.range(expected..) {
                if *nonce != expected {
                    break;
                }
                let Some(total) = gas.checked_add(tx.gas_limit).filter(|t| *t <= gas_limit) else {
                    return out;
                };
                gas = total;
                out.push(tx.clone());
                expected += 1;
            }
        }
        out
    }

    fn add_transaction(&self, tx: Transaction, local: bool) -> Result<(), TxPoolError> {
        let hash = tx.hash();
        let sender = tx.sender();
        let mut inner = self.inner.lock();
        if inner.known.contains(&hash) {
            return Err(TxPoolError::AlreadyKnown(hash));
        }
        if let Some(&expected) = inner.next_nonce.get(&sender) {
            if tx.nonce < expected {
                return Err(TxPoolError::NonceTooLow { got: tx.nonce, expected });
            }
        }
        let replaces = inner
            .by_sender
            .get(&sender)
            .is_some_and(|txs| txs.contains_key(&tx.nonce));
        if !replaces && inner.len() >= self.capacity {
            return Err(TxPoolError::PoolFull);
        }

        let nonce = tx.nonce;
        if let Some(old) = inner.by_sender.entry(sender).or_default().insert(nonce, tx) {
            inner.known.remove(&old.hash());
        }
        inner.known.insert(hash);
        debug!(%hash, %sender, nonce, local, "txpool: added");
        Ok(())
    }

    fn notify_confirmed(&self, confirmed: &[(Address, u64)]) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        for (sender, next) in confirmed {
            inner.next_nonce.insert(*sender, *next);
            let Some(txs) = inner.by_sender.get_mut(sender) else {
                continue;
            };
            let keep = txs.split_off(next);
            for stale in std::mem::replace(txs, keep).into_values() {
                inner.known.remove(&stale.hash());
            }
            if txs.is_empty() {
                inner.by_sender.remove(sender);
            }
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::constants::TX_GAS;
    use tessera_core::types::PublicKey;

    fn tx(seed: u8, nonce: u64) -> Transaction {
        Transaction {
            nonce,
            from: PublicKey([seed; 32]),
            to: Address([0xEE; 20]),
            amount: 1,
            gas_price: 1,
            gas_limit: TX_GAS,
            data: vec![],
            signature: vec![],
        }
    }

    #[test]
    fn duplicate_rejected() {
        let pool = SimpleTxPool::default();
        pool.add_transaction(tx(1, 0), true).unwrap();
        assert_eq!(
            pool.add_transaction(tx(1, 0), false),
            Err(TxPoolError::AlreadyKnown(tx(1, 0).hash()))
        );
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn pending_stops_at_nonce_gap() {
        let pool = SimpleTxPool::default();
        for n in [0, 1, 3] {
            pool.add_transaction(tx(1, n), true).unwrap();
        }
        let nonces: Vec<u64> = pool
            .pending_transactions(u64::MAX)
            .iter()
            .map(|t| t.nonce)
            .collect();
        assert_eq!(nonces, vec![0, 1]);
    }

    #[test]
    fn pending_respects_gas_limit() {
        let pool = SimpleTxPool::default();
        for n in 0..5 {
            pool.add_transaction(tx(1, n), true).unwrap();
        }
        assert_eq!(pool.pending_transactions(TX_GAS * 3).len(), 3);
        assert!(pool.pending_transactions(TX_GAS - 1).is_empty());
    }

    #[test]
    fn confirmed_nonces_evict_stale() {
        let pool = SimpleTxPool::default();
        for n in 0..4 {
            pool.add_transaction(tx(1, n), true).unwrap();
        }
        pool.add_transaction(tx(2, 0), true).unwrap();
        let sender = PublicKey([1; 32]).address();
        pool.notify_confirmed(&[(sender, 2)]);

        assert_eq!(pool.len(), 3);
        assert!(!pool.contains(&tx(1, 1).hash()));
        assert!(pool.contains(&tx(1, 2).hash()));
        assert_eq!(
            pool.add_transaction(tx(1, 1), false),
            Err(TxPoolError::NonceTooLow { got: 1, expected: 2 })
        );
    }

    #[test]
    fn full_pool_rejects() {
        let pool = SimpleTxPool::new(2);
        pool.add_transaction(tx(1, 0), true).unwrap();
        pool.add_transaction(tx(2, 0), true).unwrap();
        assert_eq!(pool.add_transaction(tx(3, 0), true), Err(TxPoolError::PoolFull));
        assert_eq!(pool.len(), 2);
    }
}
