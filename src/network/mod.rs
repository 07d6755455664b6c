//! Peer-to-peer networking
//!
//! Command-tagged messages exchanged over short-lived TCP connections for
//! version reconciliation, inventory announcement, block and transaction
//! transfer, and batch mining on miner nodes.

pub mod message;
pub mod node;
pub mod server;

pub use crate::storage::BlockInTransit;
pub use message::{OpType, Package, COMMAND_LENGTH, NODE_VERSION};
pub use node::{Node, Nodes};
pub use server::{send_addr, send_tx, MineOutcome, Server, ServerConfig, MIN_MEMPOOL_BATCH};
