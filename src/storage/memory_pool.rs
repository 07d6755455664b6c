use crate::core::Transaction;
use data_encoding::HEXLOWER;
use log::error;
use std::collections::{HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// A handler that panicked mid-update poisons the lock. The pools stay usable
// after that, the poisoning is only logged.
fn read_guard<'a, T>(lock: &'a RwLock<T>, name: &str) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        error!("Read lock on {name} was poisoned");
        poisoned.into_inner()
    })
}

fn write_guard<'a, T>(lock: &'a RwLock<T>, name: &str) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        error!("Write lock on {name} was poisoned");
        poisoned.into_inner()
    })
}

/// Pending transactions of a node, keyed by hex transaction ID
#[derive(Default)]
pub struct MemoryPool {
    inner: RwLock<HashMap<String, Transaction>>,
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        MemoryPool::default()
    }

    fn pool(&self) -> RwLockReadGuard<'_, HashMap<String, Transaction>> {
        read_guard(&self.inner, "memory pool")
    }

    fn pool_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Transaction>> {
        write_guard(&self.inner, "memory pool")
    }

    pub fn get(&self, txid_hex: &str) -> Option<Transaction> {
        self.pool().get(txid_hex).cloned()
    }

    /// Inserts `tx`, returning `false` if it was already pending
    pub fn add(&self, tx: Transaction) -> bool {
        self.pool_mut()
            .insert(HEXLOWER.encode(tx.get_id()), tx)
            .is_none()
    }

    pub fn contains(&self, txid_hex: &str) -> bool {
        self.pool().contains_key(txid_hex)
    }

    pub fn remove(&self, txid_hex: &str) -> Option<Transaction> {
        self.pool_mut().remove(txid_hex)
    }

    pub fn len(&self) -> usize {
        self.pool().len()
    }

    /// Snapshot of every pending transaction
    pub fn get_all(&self) -> Vec<Transaction> {
        self.pool().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pool().is_empty()
    }
}

/// Block hashes announced by a peer and not yet downloaded, in request order
#[derive(Default)]
pub struct BlockInTransit {
    inner: RwLock<VecDeque<Vec<u8>>>,
}

impl BlockInTransit {
    pub fn new() -> BlockInTransit {
        BlockInTransit::default()
    }

    /// Drops whatever was queued and queues `blocks` instead
    pub fn replace(&self, blocks: &[Vec<u8>]) {
        let mut queue = write_guard(&self.inner, "blocks in transit");
        queue.clear();
        queue.extend(blocks.iter().cloned());
    }

    pub fn pop_front(&self) -> Option<Vec<u8>> {
        write_guard(&self.inner, "blocks in transit").pop_front()
    }

    pub fn len(&self) -> usize {
        read_guard(&self.inner, "blocks in transit").len()
    }

    pub fn is_empty(&self) -> bool {
        read_guard(&self.inner, "blocks in transit").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_ADDRESS: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";

    #[test]
    fn test_memory_pool_add_and_remove() {
        let pool = MemoryPool::new();
        let tx = Transaction::new_coinbase_tx(TEST_ADDRESS, b"").unwrap();
        let txid_hex = HEXLOWER.encode(tx.get_id());

        assert!(pool.add(tx.clone()));
        assert!(!pool.add(tx.clone()));
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&txid_hex));
        assert_eq!(pool.get(&txid_hex), Some(tx.clone()));
        assert_eq!(pool.get_all(), vec![tx.clone()]);

        assert_eq!(pool.remove(&txid_hex), Some(tx));
        assert!(pool.is_empty());
        assert!(pool.remove(&txid_hex).is_none());
    }

    #[test]
    fn test_block_in_transit_order() {
        let transit = BlockInTransit::new();
        transit.replace(&[vec![1], vec![2], vec![3]]);
        assert_eq!(transit.len(), 3);
        assert_eq!(transit.pop_front(), Some(vec![1]));

        transit.replace(&[vec![9]]);
        assert_eq!(transit.pop_front(), Some(vec![9]));
        assert!(transit.is_empty());
        assert_eq!(transit.pop_front(), None);
    }
}
