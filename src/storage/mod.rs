//! Data storage and persistence
//!
//! This module manages the UTXO index kept next to the blocks and the
//! in-memory pools of pending transactions and blocks in transit.

pub mod memory_pool;
pub mod utxo_set;

pub use memory_pool::{BlockInTransit, MemoryPool};
pub use utxo_set::{IndexedOutput, UTXOSet};
