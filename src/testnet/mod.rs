//! Test fixtures
//!
//! Temporary ledgers and funded wallets shared by the unit tests.

pub mod test_utils;

pub use test_utils::*;
