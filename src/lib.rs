//! # minicoin
//!
//! A minimal proof-of-work cryptocurrency: an append-only ledger of blocks
//! holding signed UTXO transactions, kept in sync between nodes over a small
//! TCP protocol.
//!
//! ## Layout
//! - `core/`: blocks, transactions, Merkle root, proof-of-work and the ledger store
//! - `wallet/`: key pairs, address derivation, the per-node wallet file
//! - `storage/`: the UTXO index and the in-memory pools used by a running node
//! - `network/`: wire messages, known peers and the node server
//! - `config/`: node identity and settings
//! - `utils/`: hashing, ECDSA and serialization helpers
//! - `cli/`: command-line definitions used by the binary

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub mod testnet;

pub use cli::{Command, Opt};
pub use config::{Config, Settings};
pub use core::{
    Block, Blockchain, MerkleTree, ProofOfWork, TXInput, TXOutput, Transaction, SUBSIDY,
    TARGET_BITS,
};
pub use error::{BlockchainError, Result};
pub use network::{send_tx, MineOutcome, Node, Nodes, Server, ServerConfig};
pub use storage::{BlockInTransit, MemoryPool, UTXOSet};
pub use utils::{
    base58_decode, base58_encode, current_timestamp, ecdsa_p256_sha256_sign_digest,
    ecdsa_p256_sha256_sign_verify, new_key_pair, ripemd160_digest, sha256_digest,
};
pub use wallet::{
    convert_address, hash_pub_key, pub_key_hash_from_address, validate_address, Wallet, Wallets,
    ADDRESS_CHECK_SUM_LEN,
};
