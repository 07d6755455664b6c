//! Shared fixtures for unit tests

use crate::core::{Block, Blockchain, Transaction};
use crate::error::{BlockchainError, Result};
use crate::storage::UTXOSet;
use crate::wallet::Wallet;
use tempfile::TempDir;

/// Ledger in a temporary directory whose genesis reward belongs to `owner`.
/// The UTXO index is already built.
pub struct TestLedger {
    pub dir: TempDir,
    pub owner: Wallet,
    pub utxo_set: UTXOSet,
}

impl TestLedger {
    pub fn blockchain(&self) -> &Blockchain {
        self.utxo_set.get_blockchain()
    }

    /// Mines a reward-only block paying `wallet` and applies it to the index
    pub fn fund(&self, wallet: &Wallet) -> Result<Block> {
        let coinbase_tx = Transaction::new_coinbase_tx(&wallet.get_address(), b"")?;
        let block = self.blockchain().mine_block(&[coinbase_tx])?;
        self.utxo_set.update(&block)?;
        Ok(block)
    }
}

pub fn create_temp_dir() -> Result<TempDir> {
    tempfile::tempdir().map_err(|e| BlockchainError::Io(e.to_string()))
}

pub fn create_test_ledger() -> Result<TestLedger> {
    let dir = create_temp_dir()?;
    let owner = Wallet::new()?;
    let blockchain =
        Blockchain::create_blockchain(&owner.get_address(), &dir.path().join("blockchain"))?;
    let utxo_set = UTXOSet::new(blockchain);
    utxo_set.reindex()?;
    Ok(TestLedger {
        dir,
        owner,
        utxo_set,
    })
}
