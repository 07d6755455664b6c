use crate::core::{Block, Blockchain, TXOutput};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use data_encoding::HEXLOWER;
use log::info;
use sled::{Batch, Tree};
use std::collections::HashMap;

const UTXO_TREE: &str = "chainstate";

/// Unspent output together with its position in the transaction that created it
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct IndexedOutput {
    index: usize,
    output: TXOutput,
}

impl IndexedOutput {
    pub fn get_index(&self) -> usize {
        self.index
    }

    pub fn get_output(&self) -> &TXOutput {
        &self.output
    }
}

/// Derived index of unspent outputs, `txid -> [IndexedOutput]`, stored beside the
/// blocks in the same sled database. It can always be rebuilt from the chain.
pub struct UTXOSet {
    blockchain: Blockchain,
}

impl UTXOSet {
    pub fn new(blockchain: Blockchain) -> UTXOSet {
        UTXOSet { blockchain }
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    fn tree(&self) -> Result<Tree> {
        self.blockchain
            .get_db()
            .open_tree(UTXO_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open UTXO tree: {e}")))
    }

    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<IndexedOutput>)>> {
        let mut entries = vec![];
        for item in self.tree()?.iter() {
            let (k, v) = item.map_err(|e| {
                BlockchainError::Database(format!("Failed to iterate UTXO tree: {e}"))
            })?;
            let outs: Vec<IndexedOutput> = deserialize(v.as_ref())?;
            entries.push((k.to_vec(), outs));
        }
        Ok(entries)
    }

    /// Greedily collects outputs locked to `pub_key_hash` until they cover `amount`.
    ///
    /// The returned total may fall short of `amount`; callers must check it.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, HashMap<String, Vec<usize>>)> {
        let mut unspent_outputs: HashMap<String, Vec<usize>> = HashMap::new();
        let mut accumulated = 0;

        'entries: for (txid, outs) in self.entries()? {
            for out in outs {
                if accumulated >= amount {
                    break 'entries;
                }
                if out.output.is_locked_with_key(pub_key_hash) {
                    accumulated += out.output.get_value();
                    unspent_outputs
                        .entry(HEXLOWER.encode(&txid))
                        .or_default()
                        .push(out.index);
                }
            }
        }
        Ok((accumulated, unspent_outputs))
    }

    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TXOutput>> {
        let mut utxos = vec![];
        for (_, outs) in self.entries()? {
            utxos.extend(
                outs.into_iter()
                    .filter(|out| out.output.is_locked_with_key(pub_key_hash))
                    .map(|out| out.output),
            );
        }
        Ok(utxos)
    }

    /// Whether output `index` of transaction `txid` is still unspent
    pub fn contains_output(&self, txid: &[u8], index: usize) -> Result<bool> {
        match self.tree()?.get(txid)? {
            Some(outs_bytes) => {
                let outs: Vec<IndexedOutput> = deserialize(outs_bytes.as_ref())?;
                Ok(outs.iter().any(|out| out.index == index))
            }
            None => Ok(false),
        }
    }

    pub fn get_balance(&self, pub_key_hash: &[u8]) -> Result<u64> {
        Ok(self
            .find_utxo(pub_key_hash)?
            .iter()
            .map(TXOutput::get_value)
            .sum())
    }

    /// Number of transactions that still have at least one unspent output
    pub fn count_transactions(&self) -> Result<usize> {
        let mut counter = 0;
        for item in self.tree()?.iter() {
            item?;
            counter += 1;
        }
        Ok(counter)
    }

    /// Rebuilds the whole index from a chain scan, replacing the old content in
    /// one batch
    pub fn reindex(&self) -> Result<()> {
        let utxo_tree = self.tree()?;
        let mut batch = Batch::default();

        for key in utxo_tree.iter().keys() {
            batch.remove(key?);
        }

        let utxo_map = self.blockchain.find_utxo()?;
        for (txid_hex, outs) in &utxo_map {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::Serialization(format!("Failed to decode transaction ID: {e}"))
            })?;
            let outs: Vec<IndexedOutput> = outs
                .iter()
                .map(|(index, output)| IndexedOutput {
                    index: *index,
                    output: output.clone(),
                })
                .collect();
            batch.insert(txid, serialize(&outs)?);
        }

        utxo_tree.apply_batch(batch)?;
        utxo_tree.flush()?;
        info!("Reindexed UTXO set: {} transactions", utxo_map.len());
        Ok(())
    }

    /// Applies a freshly added block: its inputs leave the index and its outputs
    /// join it. Transactions are applied in block order, so an output spent by a
    /// later transaction of the same block never lands in the index.
    pub fn update(&self, block: &Block) -> Result<()> {
        let utxo_tree = self.tree()?;
        let mut staged: HashMap<Vec<u8>, Vec<IndexedOutput>> = HashMap::new();

        for tx in block.get_transactions() {
            if !tx.is_coinbase() {
                for vin in tx.get_vin() {
                    let txid = vin.get_txid().to_vec();
                    if !staged.contains_key(&txid) {
                        let outs_bytes = utxo_tree.get(&txid)?.ok_or_else(|| {
                            BlockchainError::Transaction(format!(
                                "UTXO entry for {} not found",
                                HEXLOWER.encode(&txid)
                            ))
                        })?;
                        staged.insert(txid.clone(), deserialize(outs_bytes.as_ref())?);
                    }

                    let vout = vin.output_index()?;
                    let outs = staged.entry(txid).or_default();
                    let position = outs
                        .iter()
                        .position(|out| out.index == vout)
                        .ok_or_else(|| {
                            BlockchainError::Transaction(format!(
                                "Output {vout} of {} is not unspent",
                                HEXLOWER.encode(vin.get_txid())
                            ))
                        })?;
                    outs.remove(position);
                }
            }

            let new_outputs = tx
                .get_vout()
                .iter()
                .enumerate()
                .map(|(index, output)| IndexedOutput {
                    index,
                    output: output.clone(),
                })
                .collect();
            staged.insert(tx.get_id().to_vec(), new_outputs);
        }

        let mut batch = Batch::default();
        for (txid, outs) in staged {
            if outs.is_empty() {
                batch.remove(txid);
            } else {
                batch.insert(txid, serialize(&outs)?);
            }
        }
        utxo_tree.apply_batch(batch)?;
        utxo_tree.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Transaction, SUBSIDY};
    use crate::testnet::create_test_ledger;
    use crate::wallet::{hash_pub_key, Wallet};

    fn pkh(wallet: &Wallet) -> Vec<u8> {
        hash_pub_key(wallet.get_public_key())
    }

    #[test]
    fn test_reindex_after_genesis() {
        let f = create_test_ledger().unwrap();
        assert_eq!(f.utxo_set.count_transactions().unwrap(), 1);
        assert_eq!(f.utxo_set.get_balance(&pkh(&f.owner)).unwrap(), SUBSIDY);
        assert_eq!(f.utxo_set.get_balance(&[0u8; 20]).unwrap(), 0);

        let chain = f.blockchain();
        let genesis = chain.get_block(&chain.get_tip_hash()).unwrap().unwrap();
        let coinbase_id = genesis.get_transactions()[0].get_id();
        assert!(f.utxo_set.contains_output(coinbase_id, 0).unwrap());
        assert!(!f.utxo_set.contains_output(coinbase_id, 1).unwrap());
        assert!(!f.utxo_set.contains_output(&[0u8; 32], 0).unwrap());
    }

    #[test]
    fn test_spend_selection_reports_shortfall() {
        let f = create_test_ledger().unwrap();
        let (accumulated, outputs) = f
            .utxo_set
            .find_spendable_outputs(&pkh(&f.owner), SUBSIDY + 1)
            .unwrap();
        assert_eq!(accumulated, SUBSIDY);
        assert_eq!(outputs.values().map(Vec::len).sum::<usize>(), 1);
    }

    #[test]
    fn test_spend_selection_stops_when_covered() {
        let f = create_test_ledger().unwrap();
        f.fund(&f.owner).unwrap();

        let (accumulated, outputs) = f.utxo_set.find_spendable_outputs(&pkh(&f.owner), 3).unwrap();
        assert_eq!(accumulated, SUBSIDY);
        assert_eq!(outputs.len(), 1);

        let (accumulated, outputs) = f
            .utxo_set
            .find_spendable_outputs(&pkh(&f.owner), 2 * SUBSIDY)
            .unwrap();
        assert_eq!(accumulated, 2 * SUBSIDY);
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn test_update_matches_reindex() {
        let f = create_test_ledger().unwrap();
        let recipient = Wallet::new().unwrap();

        let tx =
            Transaction::new_utxo_transaction(&f.owner, &recipient.get_address(), 4, &f.utxo_set)
                .unwrap();
        let reward = Transaction::new_coinbase_tx(&recipient.get_address(), b"").unwrap();
        let block = f.blockchain().mine_block(&[reward, tx]).unwrap();
        f.utxo_set.update(&block).unwrap();

        assert_eq!(f.utxo_set.get_balance(&pkh(&f.owner)).unwrap(), 6);
        assert_eq!(
            f.utxo_set.get_balance(&pkh(&recipient)).unwrap(),
            4 + SUBSIDY
        );
        let incremental_count = f.utxo_set.count_transactions().unwrap();

        f.utxo_set.reindex().unwrap();
        assert_eq!(f.utxo_set.get_balance(&pkh(&f.owner)).unwrap(), 6);
        assert_eq!(
            f.utxo_set.get_balance(&pkh(&recipient)).unwrap(),
            4 + SUBSIDY
        );
        assert_eq!(f.utxo_set.count_transactions().unwrap(), incremental_count);
    }

    #[test]
    fn test_reindex_follows_chain_of_spends() {
        let f = create_test_ledger().unwrap();
        let middle = Wallet::new().unwrap();
        let last = Wallet::new().unwrap();

        let first_hop =
            Transaction::new_utxo_transaction(&f.owner, &middle.get_address(), 10, &f.utxo_set)
                .unwrap();
        let block = f.blockchain().mine_block(&[first_hop]).unwrap();
        f.utxo_set.update(&block).unwrap();
        let second_hop =
            Transaction::new_utxo_transaction(&middle, &last.get_address(), 10, &f.utxo_set)
                .unwrap();
        let block = f.blockchain().mine_block(&[second_hop]).unwrap();
        f.utxo_set.update(&block).unwrap();

        f.utxo_set.reindex().unwrap();
        assert_eq!(f.utxo_set.get_balance(&pkh(&f.owner)).unwrap(), 0);
        assert_eq!(f.utxo_set.get_balance(&pkh(&middle)).unwrap(), 0);
        assert_eq!(f.utxo_set.get_balance(&pkh(&last)).unwrap(), SUBSIDY);
        assert_eq!(f.utxo_set.count_transactions().unwrap(), 1);
    }

    #[test]
    fn test_update_rejects_unknown_spend() {
        let f = create_test_ledger().unwrap();
        let recipient = Wallet::new().unwrap();

        let tx =
            Transaction::new_utxo_transaction(&f.owner, &recipient.get_address(), 4, &f.utxo_set)
                .unwrap();
        let block = f.blockchain().mine_block(&[tx]).unwrap();
        f.utxo_set.update(&block).unwrap();

        // the same block applied twice spends outputs that are gone
        assert!(matches!(
            f.utxo_set.update(&block),
            Err(BlockchainError::Transaction(_))
        ));
    }

    #[test]
    fn test_exact_balance_exhausts_outputs() {
        let f = create_test_ledger().unwrap();
        let recipient = Wallet::new().unwrap();

        let tx = Transaction::new_utxo_transaction(
            &f.owner,
            &recipient.get_address(),
            SUBSIDY,
            &f.utxo_set,
        )
        .unwrap();
        assert_eq!(tx.get_vout().len(), 1);
        let block = f.blockchain().mine_block(&[tx]).unwrap();
        f.utxo_set.update(&block).unwrap();

        assert!(f.utxo_set.find_utxo(&pkh(&f.owner)).unwrap().is_empty());
        assert!(matches!(
            Transaction::new_utxo_transaction(&f.owner, &recipient.get_address(), 1, &f.utxo_set),
            Err(BlockchainError::InsufficientFunds {
                required: 1,
                available: 0
            })
        ));
    }
}
