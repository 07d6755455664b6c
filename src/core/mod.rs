//! Core blockchain functionality
//!
//! This module contains the fundamental blockchain components including
//! blocks, transactions, blockchain management, and proof-of-work consensus.

pub mod block;
pub mod blockchain;
pub mod merkle;
pub mod proof_of_work;
pub mod transaction;

pub use block::Block;
pub use blockchain::{Blockchain, BlockchainIterator, UnspentOutputs, GENESIS_COINBASE_DATA};
pub use merkle::MerkleTree;
pub use proof_of_work::{ProofOfWork, TARGET_BITS};
pub use transaction::{PrevTransactions, TXInput, TXOutput, Transaction, COINBASE_VOUT, SUBSIDY};
