use crate::core::{MerkleTree, ProofOfWork, Transaction};
use crate::error::{BlockchainError, Result};
use crate::utils::{current_timestamp, deserialize, serialize};
use data_encoding::HEXLOWER;
use log::info;

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Block {
    timestamp: i64,
    transactions: Vec<Transaction>,
    prev_block_hash: Vec<u8>,
    hash: Vec<u8>,
    nonce: i64,
    height: usize,
}

impl Block {
    /// Builds and mines a block on top of `prev_block_hash`
    pub fn new_block(
        prev_block_hash: &[u8],
        transactions: &[Transaction],
        height: usize,
    ) -> Result<Block> {
        if transactions.is_empty() {
            return Err(BlockchainError::InvalidBlock(
                "Block must contain at least one transaction".to_string(),
            ));
        }

        let mut block = Block {
            timestamp: current_timestamp()?,
            transactions: transactions.to_vec(),
            prev_block_hash: prev_block_hash.to_vec(),
            hash: vec![],
            nonce: 0,
            height,
        };

        let (nonce, hash) = {
            let pow = ProofOfWork::new_proof_of_work(&block)?;
            pow.run()?
        };
        block.nonce = nonce;
        block.hash = hash;
        info!(
            "Mined block {} at height {height} (nonce {nonce})",
            HEXLOWER.encode(&block.hash)
        );

        Ok(block)
    }

    /// Genesis block: height 0, no previous hash
    pub fn generate_genesis_block(transaction: &Transaction) -> Result<Block> {
        Block::new_block(&[], &[transaction.clone()], 0)
    }

    /// Merkle root over the serialized transactions
    pub fn hash_transactions(&self) -> Result<Vec<u8>> {
        let mut leaves = Vec::with_capacity(self.transactions.len());
        for transaction in &self.transactions {
            leaves.push(transaction.serialize()?);
        }
        let tree = MerkleTree::new(&leaves)?;
        Ok(tree.root_hash().to_vec())
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_prev_block_hash(&self) -> &[u8] {
        self.prev_block_hash.as_slice()
    }

    pub fn get_hash(&self) -> &[u8] {
        self.hash.as_slice()
    }

    pub fn get_hash_hex(&self) -> String {
        HEXLOWER.encode(&self.hash)
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_height(&self) -> usize {
        self.height
    }

    pub fn get_nonce(&self) -> i64 {
        self.nonce
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_block_hash.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn with_nonce(&self, nonce: i64) -> Block {
        Block {
            nonce,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_ADDRESS: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";

    fn coinbase(memo: &[u8]) -> Transaction {
        Transaction::new_coinbase_tx(TEST_ADDRESS, memo).unwrap()
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::generate_genesis_block(&coinbase(b"genesis")).unwrap();

        assert!(genesis.is_genesis());
        assert_eq!(genesis.get_height(), 0);
        assert_eq!(genesis.get_hash().len(), 32);
        assert_eq!(genesis.get_transactions().len(), 1);
        assert!(ProofOfWork::validate(&genesis));
    }

    #[test]
    fn test_child_links_to_parent() {
        let genesis = Block::generate_genesis_block(&coinbase(b"genesis")).unwrap();
        let child = Block::new_block(genesis.get_hash(), &[coinbase(b"second")], 1).unwrap();

        assert!(!child.is_genesis());
        assert_eq!(child.get_prev_block_hash(), genesis.get_hash());
        assert_eq!(child.get_height(), 1);
    }

    #[test]
    fn test_empty_block_is_rejected() {
        assert!(matches!(
            Block::new_block(&[], &[], 0),
            Err(BlockchainError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_merkle_root_depends_on_order() {
        let (a, b) = (coinbase(b"a"), coinbase(b"b"));
        let block = Block::new_block(&[], &[a.clone(), b.clone()], 0).unwrap();
        let swapped = Block {
            transactions: vec![b, a],
            ..block.clone()
        };

        assert_ne!(
            block.hash_transactions().unwrap(),
            swapped.hash_transactions().unwrap()
        );
        assert!(!ProofOfWork::validate(&swapped));
    }

    #[test]
    fn test_serialization_round_trip() {
        let block = Block::generate_genesis_block(&coinbase(b"genesis")).unwrap();
        let bytes = block.serialize().unwrap();
        let decoded = Block::deserialize(&bytes).unwrap();

        assert_eq!(decoded, block);
        assert_eq!(decoded.serialize().unwrap(), bytes);
        assert!(ProofOfWork::validate(&decoded));
    }
}
