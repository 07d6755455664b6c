// The ledger keeps every block in one sled tree keyed by block hash. A sentinel key in
// the same tree points at the tip, and both are always written in one transaction.

use crate::core::{Block, PrevTransactions, ProofOfWork, TXOutput, Transaction};
use crate::error::{BlockchainError, Result};
use crate::wallet::validate_address;
use data_encoding::HEXLOWER;
use log::{debug, info, warn};
use sled::transaction::TransactionError;
use sled::{Db, Tree};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

const TIP_BLOCK_HASH_KEY: &str = "tip_block_hash";
const BLOCKS_TREE: &str = "blocks";

pub const GENESIS_COINBASE_DATA: &str =
    "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

/// Unspent outputs keyed by hex transaction ID, each tagged with its output index
pub type UnspentOutputs = HashMap<String, Vec<(usize, TXOutput)>>;

#[derive(Clone, Debug)]
pub struct Blockchain {
    tip_hash: Arc<RwLock<Vec<u8>>>,
    // serialises every write of a block and the tip
    write_lock: Arc<Mutex<()>>,
    db: Db,
    blocks: Tree,
    db_path: PathBuf,
}

impl Blockchain {
    /// Creates a new ledger at `db_path` whose genesis block pays the subsidy to
    /// `genesis_address`.
    pub fn create_blockchain(genesis_address: &str, db_path: &Path) -> Result<Blockchain> {
        if !validate_address(genesis_address) {
            return Err(BlockchainError::InvalidAddress(genesis_address.to_string()));
        }

        let (db, blocks) = Self::open_db(db_path)?;
        if blocks.get(TIP_BLOCK_HASH_KEY)?.is_some() {
            return Err(BlockchainError::LedgerExists(
                db_path.display().to_string(),
            ));
        }

        info!("Creating genesis block for address: {genesis_address}");
        let coinbase_tx =
            Transaction::new_coinbase_tx(genesis_address, GENESIS_COINBASE_DATA.as_bytes())?;
        let genesis = Block::generate_genesis_block(&coinbase_tx)?;
        Self::write_block(&blocks, &genesis, true)?;
        db.flush()?;

        Ok(Blockchain {
            tip_hash: Arc::new(RwLock::new(genesis.get_hash().to_vec())),
            write_lock: Arc::new(Mutex::new(())),
            db,
            blocks,
            db_path: db_path.to_path_buf(),
        })
    }

    /// Opens an existing ledger
    pub fn open(db_path: &Path) -> Result<Blockchain> {
        if !db_path.exists() {
            return Err(BlockchainError::LedgerNotFound(
                db_path.display().to_string(),
            ));
        }

        let (db, blocks) = Self::open_db(db_path)?;
        let tip_hash = blocks.get(TIP_BLOCK_HASH_KEY)?.ok_or_else(|| {
            BlockchainError::LedgerNotFound(db_path.display().to_string())
        })?;

        Ok(Blockchain {
            tip_hash: Arc::new(RwLock::new(tip_hash.to_vec())),
            write_lock: Arc::new(Mutex::new(())),
            db,
            blocks,
            db_path: db_path.to_path_buf(),
        })
    }

    fn open_db(db_path: &Path) -> Result<(Db, Tree)> {
        let db = sled::open(db_path)
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        let blocks = db
            .open_tree(BLOCKS_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open blocks tree: {e}")))?;
        Ok((db, blocks))
    }

    /// Stores the block and, when `advance_tip` is set, moves the tip to it in
    /// the same transaction
    fn write_block(blocks: &Tree, block: &Block, advance_tip: bool) -> Result<()> {
        let block_hash = block.get_hash();
        let block_data = block.serialize()?;

        blocks
            .transaction(|tx_db| {
                tx_db.insert(block_hash, block_data.as_slice())?;
                if advance_tip {
                    tx_db.insert(TIP_BLOCK_HASH_KEY, block_hash)?;
                }
                Ok(())
            })
            .map_err(|e: TransactionError| {
                BlockchainError::Database(format!("Failed to update blocks tree: {e:?}"))
            })?;

        Ok(())
    }

    pub fn get_db(&self) -> &Db {
        &self.db
    }

    pub fn get_db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub fn get_tip_hash(&self) -> Vec<u8> {
        self.tip_hash
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_tip_hash(&self, new_tip_hash: &[u8]) {
        let mut tip_hash = self
            .tip_hash
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *tip_hash = new_tip_hash.to_vec();
    }

    /// Mines a block holding `transactions` on top of the current tip.
    ///
    /// Every transaction must verify against the chain. The block and the new
    /// tip are persisted atomically.
    pub fn mine_block(&self, transactions: &[Transaction]) -> Result<Block> {
        for (i, transaction) in transactions.iter().enumerate() {
            if !self.verify_transaction(transaction)? {
                return Err(BlockchainError::InvalidSignature(format!(
                    "Transaction at index {i} failed verification: {}",
                    HEXLOWER.encode(transaction.get_id())
                )));
            }
        }

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let tip_hash = self.get_tip_hash();
        let best_height = self.get_best_height()?;
        let block = Block::new_block(&tip_hash, transactions, best_height + 1)?;

        Self::write_block(&self.blocks, &block, true)?;
        self.db.flush()?;
        self.set_tip_hash(block.get_hash());

        info!(
            "Added mined block {} at height {}",
            block.get_hash_hex(),
            block.get_height()
        );
        Ok(block)
    }

    /// Stores a block received from a peer.
    ///
    /// Returns `false` when the block was already known. The tip only moves when
    /// the block is higher than the current tip and its parent chain is complete.
    pub fn add_block(&self, block: &Block) -> Result<bool> {
        if !ProofOfWork::validate(block) {
            return Err(BlockchainError::InvalidBlock(format!(
                "Proof of work check failed for block {}",
                block.get_hash_hex()
            )));
        }

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let known = self.blocks.contains_key(block.get_hash())?;
        // a block whose ancestry is incomplete is kept, but only becomes the tip
        // once it is offered again with its parents in place
        let advance_tip = block.get_height() > self.get_best_height()?
            && self.reaches_genesis(block.get_prev_block_hash())?;
        if known && !advance_tip {
            debug!("Block {} already stored", block.get_hash_hex());
            return Ok(false);
        }

        Self::write_block(&self.blocks, block, advance_tip)?;
        self.db.flush()?;
        if advance_tip {
            self.set_tip_hash(block.get_hash());
        }

        info!(
            "Added block {} at height {}{}",
            block.get_hash_hex(),
            block.get_height(),
            if advance_tip { " (new tip)" } else { "" }
        );
        Ok(!known)
    }

    /// Whether `block_hash` is stored together with every ancestor down to a
    /// genesis block
    fn reaches_genesis(&self, block_hash: &[u8]) -> Result<bool> {
        let mut current = block_hash.to_vec();
        loop {
            match self.get_block(&current)? {
                Some(block) if block.is_genesis() => return Ok(true),
                Some(block) => current = block.get_prev_block_hash().to_vec(),
                None => return Ok(false),
            }
        }
    }

    /// Walks the chain from the current tip back to genesis. Every call starts a
    /// fresh walk.
    pub fn iter(&self) -> BlockchainIterator {
        BlockchainIterator::new(self.get_tip_hash(), self.blocks.clone())
    }

    pub fn get_best_height(&self) -> Result<usize> {
        let tip_hash = self.get_tip_hash();
        let tip_block = self.get_block(&tip_hash)?.ok_or_else(|| {
            BlockchainError::Database(format!(
                "Tip block {} not found",
                HEXLOWER.encode(&tip_hash)
            ))
        })?;
        Ok(tip_block.get_height())
    }

    pub fn get_block(&self, block_hash: &[u8]) -> Result<Option<Block>> {
        match self.blocks.get(block_hash)? {
            Some(block_bytes) => Ok(Some(Block::deserialize(block_bytes.as_ref())?)),
            None => Ok(None),
        }
    }

    /// Hashes of the chain from tip to genesis
    pub fn get_block_hashes(&self) -> Result<Vec<Vec<u8>>> {
        let mut hashes = vec![];
        for block in self.iter() {
            hashes.push(block?.get_hash().to_vec());
        }
        Ok(hashes)
    }

    /// Full scan of the chain for outputs never referenced by an input.
    ///
    /// Blocks are visited tip first and each block's inputs are recorded before
    /// its outputs, so spends later in the chain and within the same block are
    /// both seen before the output they consume.
    pub fn find_utxo(&self) -> Result<UnspentOutputs> {
        let mut utxo: UnspentOutputs = HashMap::new();
        let mut spent_txos: HashSet<(Vec<u8>, i64)> = HashSet::new();

        for block in self.iter() {
            let block = block?;
            for tx in block.get_transactions() {
                if tx.is_coinbase() {
                    continue;
                }
                for txin in tx.get_vin() {
                    spent_txos.insert((txin.get_txid().to_vec(), txin.get_vout()));
                }
            }

            for tx in block.get_transactions() {
                let txid = tx.get_id();
                for (idx, out) in tx.get_vout().iter().enumerate() {
                    let vout = i64::try_from(idx).map_err(|_| {
                        BlockchainError::Transaction(format!("Output index {idx} out of range"))
                    })?;
                    if spent_txos.contains(&(txid.to_vec(), vout)) {
                        continue;
                    }
                    utxo.entry(HEXLOWER.encode(txid))
                        .or_default()
                        .push((idx, out.clone()));
                }
            }
        }
        Ok(utxo)
    }

    pub fn find_transaction(&self, txid: &[u8]) -> Result<Option<Transaction>> {
        for block in self.iter() {
            let block = block?;
            if let Some(transaction) = block
                .get_transactions()
                .iter()
                .find(|transaction| txid.eq(transaction.get_id()))
            {
                return Ok(Some(transaction.clone()));
            }
        }
        Ok(None)
    }

    fn prev_transactions(&self, tx: &Transaction) -> Result<Option<PrevTransactions>> {
        let mut prev_txs = PrevTransactions::new();
        for vin in tx.get_vin() {
            let txid_hex = HEXLOWER.encode(vin.get_txid());
            if prev_txs.contains_key(&txid_hex) {
                continue;
            }
            match self.find_transaction(vin.get_txid())? {
                Some(prev_tx) => {
                    prev_txs.insert(txid_hex, prev_tx);
                }
                None => {
                    warn!("Referenced transaction {txid_hex} is not in the chain");
                    return Ok(None);
                }
            }
        }
        Ok(Some(prev_txs))
    }

    /// Signs `tx` with the PKCS#8 key after looking up the transactions it spends
    pub fn sign_transaction(&self, tx: &mut Transaction, pkcs8: &[u8]) -> Result<()> {
        if tx.is_coinbase() {
            return Ok(());
        }
        let prev_txs = self.prev_transactions(tx)?.ok_or_else(|| {
            BlockchainError::Transaction(
                "Transaction spends an output that is not in the chain".to_string(),
            )
        })?;
        tx.sign(pkcs8, &prev_txs)
    }

    /// `Ok(false)` for a bad signature or an input that references an unknown transaction
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        match self.prev_transactions(tx)? {
            Some(prev_txs) => Ok(tx.verify(&prev_txs)),
            None => Ok(false),
        }
    }
}

/// Backward walk over the stored chain. Yields an error and stops if a link is
/// missing or unreadable.
pub struct BlockchainIterator {
    blocks: Tree,
    current_hash: Option<Vec<u8>>,
}

impl BlockchainIterator {
    fn new(tip_hash: Vec<u8>, blocks: Tree) -> BlockchainIterator {
        BlockchainIterator {
            blocks,
            current_hash: Some(tip_hash),
        }
    }

    fn load(&self, hash: &[u8]) -> Result<Block> {
        let data = self.blocks.get(hash)?.ok_or_else(|| {
            BlockchainError::Database(format!("Block {} not found", HEXLOWER.encode(hash)))
        })?;
        Block::deserialize(data.as_ref())
    }
}

impl Iterator for BlockchainIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current_hash.take()?;
        match self.load(&hash) {
            Ok(block) => {
                if !block.is_genesis() {
                    self.current_hash = Some(block.get_prev_block_hash().to_vec());
                }
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
