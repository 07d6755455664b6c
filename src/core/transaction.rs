// Transactions follow the UTXO model: inputs consume outputs of earlier transactions,
// outputs lock value to a public key hash until a later input spends them.

use crate::error::{BlockchainError, Result};
use crate::storage::UTXOSet;
use crate::utils::{
    deserialize, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, random_bytes,
    serialize, sha256_digest,
};
use crate::wallet::{hash_pub_key, pub_key_hash_from_address, Wallet};
use data_encoding::HEXLOWER;
use log::{debug, warn};
use std::collections::HashMap;

/// Reward paid by every coinbase transaction
pub const SUBSIDY: u64 = 10;

/// Output index carried by the single input of a coinbase transaction
pub const COINBASE_VOUT: i64 = -1;

const COINBASE_MEMO_LEN: usize = 20;

/// Transactions referenced by a transaction's inputs, keyed by hex transaction ID
pub type PrevTransactions = HashMap<String, Transaction>;

#[derive(Debug, Clone, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TXInput {
    txid: Vec<u8>,      // ID of the transaction holding the spent output
    vout: i64,          // index of that output, -1 for coinbase
    signature: Vec<u8>, // r || s
    pub_key: Vec<u8>,   // X || Y of the spender, memo bytes for coinbase
}

impl TXInput {
    pub fn new(txid: &[u8], vout: i64) -> TXInput {
        TXInput {
            txid: txid.to_vec(),
            vout,
            signature: vec![],
            pub_key: vec![],
        }
    }

    pub fn get_txid(&self) -> &[u8] {
        self.txid.as_slice()
    }

    pub fn get_vout(&self) -> i64 {
        self.vout
    }

    pub fn get_signature(&self) -> &[u8] {
        self.signature.as_slice()
    }

    pub fn get_pub_key(&self) -> &[u8] {
        self.pub_key.as_slice()
    }

    /// Whether this input was signed by the owner of `pub_key_hash`
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        let locking_hash = hash_pub_key(self.pub_key.as_slice());
        locking_hash.eq(pub_key_hash)
    }

    /// Index of the referenced output; fails for the coinbase marker
    pub fn output_index(&self) -> Result<usize> {
        usize::try_from(self.vout).map_err(|_| {
            BlockchainError::Transaction(format!("Invalid output index {}", self.vout))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TXOutput {
    value: u64,
    pub_key_hash: Vec<u8>,
}

impl TXOutput {
    /// Output of `value` locked to the public key hash encoded in `address`
    pub fn new(value: u64, address: &str) -> Result<TXOutput> {
        let pub_key_hash = pub_key_hash_from_address(address)?;
        Ok(TXOutput {
            value,
            pub_key_hash,
        })
    }

    pub fn get_value(&self) -> u64 {
        self.value
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash.eq(pub_key_hash)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Transaction {
    id: Vec<u8>,
    vin: Vec<TXInput>,
    vout: Vec<TXOutput>,
}

impl Transaction {
    /// Minted transaction paying [`SUBSIDY`] to `to`.
    ///
    /// An empty `memo` is replaced with random bytes so that two coinbases to the
    /// same address never share an ID.
    pub fn new_coinbase_tx(to: &str, memo: &[u8]) -> Result<Transaction> {
        let memo = if memo.is_empty() {
            random_bytes(COINBASE_MEMO_LEN)
        } else {
            memo.to_vec()
        };

        let tx_input = TXInput {
            txid: vec![],
            vout: COINBASE_VOUT,
            signature: vec![],
            pub_key: memo,
        };
        let txout = TXOutput::new(SUBSIDY, to)?;

        let mut tx = Transaction {
            id: vec![],
            vin: vec![tx_input],
            vout: vec![txout],
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Builds and signs a transfer of `amount` from `wallet` to `to`.
    ///
    /// Inputs are picked from the UTXO index; any surplus goes back to the sender
    /// as a change output.
    pub fn new_utxo_transaction(
        wallet: &Wallet,
        to: &str,
        amount: u64,
        utxo_set: &UTXOSet,
    ) -> Result<Transaction> {
        if amount == 0 {
            return Err(BlockchainError::Transaction(
                "Amount must be positive".to_string(),
            ));
        }

        let to_output = TXOutput::new(amount, to)?;
        let public_key_hash = hash_pub_key(wallet.get_public_key());
        let (accumulated, valid_outputs) =
            utxo_set.find_spendable_outputs(public_key_hash.as_slice(), amount)?;

        if accumulated < amount {
            return Err(BlockchainError::InsufficientFunds {
                required: amount,
                available: accumulated,
            });
        }

        let mut inputs = vec![];
        for (txid_hex, outs) in valid_outputs {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::Transaction(format!("Invalid transaction ID: {e}"))
            })?;
            for out in outs {
                let vout = i64::try_from(out).map_err(|_| {
                    BlockchainError::Transaction(format!("Output index {out} out of range"))
                })?;
                inputs.push(TXInput {
                    txid: txid.clone(),
                    vout,
                    signature: vec![],
                    pub_key: wallet.get_public_key().to_vec(),
                });
            }
        }

        let mut outputs = vec![to_output];
        if accumulated > amount {
            outputs.push(TXOutput {
                value: accumulated - amount,
                pub_key_hash: public_key_hash,
            });
        }

        let mut tx = Transaction {
            id: vec![],
            vin: inputs,
            vout: outputs,
        };
        tx.id = tx.hash()?;

        utxo_set
            .get_blockchain()
            .sign_transaction(&mut tx, wallet.get_pkcs8())?;
        // signatures are part of the serialized form, so the ID is taken again
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Copy with every input stripped of its signature and public key
    pub fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .vin
            .iter()
            .map(|input| TXInput::new(input.get_txid(), input.get_vout()))
            .collect();
        Transaction {
            id: self.id.clone(),
            vin: inputs,
            vout: self.vout.clone(),
        }
    }

    /// Public key hash locking the output that `input` spends
    fn locking_key(input: &TXInput, prev_txs: &PrevTransactions) -> Result<Vec<u8>> {
        let txid_hex = HEXLOWER.encode(input.get_txid());
        let prev_tx = prev_txs.get(&txid_hex).ok_or_else(|| {
            BlockchainError::Transaction(format!("Previous transaction {txid_hex} not found"))
        })?;
        let out_idx = input.output_index()?;
        prev_tx
            .vout
            .get(out_idx)
            .map(|output| output.pub_key_hash.clone())
            .ok_or_else(|| {
                BlockchainError::Transaction(format!(
                    "Output {out_idx} does not exist in transaction {txid_hex}"
                ))
            })
    }

    /// Digest signed for input `idx`: the trimmed copy with that input temporarily
    /// carrying the locking key of the output it spends.
    fn signing_digest(
        tx_copy: &mut Transaction,
        idx: usize,
        prev_txs: &PrevTransactions,
    ) -> Result<Vec<u8>> {
        let locking_key = Self::locking_key(&tx_copy.vin[idx], prev_txs)?;

        tx_copy.vin[idx].signature = vec![];
        tx_copy.vin[idx].pub_key = locking_key;
        tx_copy.id = tx_copy.hash()?;
        tx_copy.vin[idx].pub_key = vec![];

        Ok(tx_copy.id.clone())
    }

    /// Signs every input with the PKCS#8 encoded private key. Coinbase
    /// transactions are left untouched.
    pub fn sign(&mut self, pkcs8: &[u8], prev_txs: &PrevTransactions) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut tx_copy = self.trimmed_copy();
        for idx in 0..self.vin.len() {
            let digest = Self::signing_digest(&mut tx_copy, idx, prev_txs)?;
            self.vin[idx].signature = ecdsa_p256_sha256_sign_digest(pkcs8, &digest)?;
        }
        Ok(())
    }

    /// Checks every input signature against the outputs it spends.
    ///
    /// Any missing reference, foreign public key or bad signature rejects the
    /// whole transaction.
    pub fn verify(&self, prev_txs: &PrevTransactions) -> bool {
        if self.is_coinbase() {
            return true;
        }
        if self.vin.is_empty() {
            warn!("Transaction has no inputs");
            return false;
        }

        let mut tx_copy = self.trimmed_copy();
        for (idx, vin) in self.vin.iter().enumerate() {
            // the spender's key must hash to the lock on the spent output
            match Self::locking_key(vin, prev_txs) {
                Ok(locking_key) if vin.uses_key(&locking_key) => {}
                Ok(_) => {
                    debug!(
                        "Input {idx} of {} does not own the output it spends",
                        HEXLOWER.encode(&self.id)
                    );
                    return false;
                }
                Err(e) => {
                    warn!("Cannot verify input {idx}: {e}");
                    return false;
                }
            }

            let digest = match Self::signing_digest(&mut tx_copy, idx, prev_txs) {
                Ok(digest) => digest,
                Err(e) => {
                    warn!("Cannot verify input {idx}: {e}");
                    return false;
                }
            };

            if !ecdsa_p256_sha256_sign_verify(
                vin.pub_key.as_slice(),
                vin.signature.as_slice(),
                &digest,
            ) {
                debug!(
                    "Signature check failed for input {idx} of {}",
                    HEXLOWER.encode(&self.id)
                );
                return false;
            }
        }
        true
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].txid.is_empty() && self.vin[0].vout == COINBASE_VOUT
    }

    /// SHA-256 of the serialized transaction with its ID cleared
    pub fn hash(&self) -> Result<Vec<u8>> {
        let tx_copy = Transaction {
            id: vec![],
            vin: self.vin.clone(),
            vout: self.vout.clone(),
        };
        Ok(sha256_digest(&tx_copy.serialize()?))
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }
}
