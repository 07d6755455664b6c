use crate::core::Block;
use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;
use data_encoding::HEXLOWER;
use log::debug;
use num_bigint::{BigInt, Sign};
use once_cell::sync::Lazy;
use std::ops::ShlAssign;

/// Leading zero bits required of every block hash on this chain
pub const TARGET_BITS: u32 = 16;

const MAX_NONCE: i64 = i64::MAX;

static TARGET: Lazy<BigInt> = Lazy::new(|| {
    let mut target = BigInt::from(1);
    target.shl_assign(256 - TARGET_BITS);
    target
});

pub struct ProofOfWork<'a> {
    block: &'a Block,
    merkle_root: Vec<u8>,
}

impl<'a> ProofOfWork<'a> {
    pub fn new_proof_of_work(block: &'a Block) -> Result<ProofOfWork<'a>> {
        let merkle_root = block.hash_transactions()?;
        Ok(ProofOfWork { block, merkle_root })
    }

    pub fn target() -> &'static BigInt {
        &TARGET
    }

    /// Recomputes the header hash for the stored nonce. The block is valid when
    /// that hash is the one it carries and it falls below the target.
    pub fn validate(block: &Block) -> bool {
        let pow = match ProofOfWork::new_proof_of_work(block) {
            Ok(pow) => pow,
            Err(e) => {
                debug!("Cannot rebuild header: {e}");
                return false;
            }
        };
        let hash = sha256_digest(pow.prepare_data(block.get_nonce()).as_slice());
        hash.as_slice() == block.get_hash() && meets_target(&hash)
    }

    /// prev_hash || merkle_root || timestamp || target_bits || nonce, integers big-endian
    fn prepare_data(&self, nonce: i64) -> Vec<u8> {
        let mut data_bytes = vec![];
        data_bytes.extend(self.block.get_prev_block_hash());
        data_bytes.extend(self.merkle_root.as_slice());
        data_bytes.extend(self.block.get_timestamp().to_be_bytes());
        data_bytes.extend(i64::from(TARGET_BITS).to_be_bytes());
        data_bytes.extend(nonce.to_be_bytes());
        data_bytes
    }

    /// Searches nonces from zero upward for the first hash below the target
    pub fn run(&self) -> Result<(i64, Vec<u8>)> {
        let mut nonce = 0;
        while nonce < MAX_NONCE {
            let hash = sha256_digest(self.prepare_data(nonce).as_slice());
            if meets_target(&hash) {
                debug!("Found nonce {nonce}: {}", HEXLOWER.encode(&hash));
                return Ok((nonce, hash));
            }
            nonce += 1;
        }
        Err(BlockchainError::Mining(
            "Nonce space exhausted without meeting the target".to_string(),
        ))
    }
}

/// Whether `hash`, read as a big-endian unsigned integer, is below the target
pub fn meets_target(hash: &[u8]) -> bool {
    BigInt::from_bytes_be(Sign::Plus, hash) < *TARGET
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Transaction;

    fn mined_block() -> Block {
        let test_address = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";
        let coinbase_tx = Transaction::new_coinbase_tx(test_address, b"pow test").unwrap();
        Block::new_block(&[], &[coinbase_tx], 0).unwrap()
    }

    #[test]
    fn test_target_has_leading_zero_bits() {
        let bytes = ProofOfWork::target().to_bytes_be().1;
        // 2^240 is one byte followed by 30 zero bytes
        assert_eq!(bytes.len(), 31);
        assert_eq!(bytes[0], 1);
    }

    #[test]
    fn test_mined_block_validates() {
        let block = mined_block();
        assert!(ProofOfWork::validate(&block));
        assert_eq!(&block.get_hash()[..2], &[0, 0]);
    }

    #[test]
    fn test_validate_matches_run() {
        let block = mined_block();
        let pow = ProofOfWork::new_proof_of_work(&block).unwrap();
        let (nonce, hash) = pow.run().unwrap();

        assert_eq!(nonce, block.get_nonce());
        assert_eq!(hash.as_slice(), block.get_hash());
    }

    #[test]
    fn test_wrong_nonce_fails_validation() {
        let block = mined_block();
        let tampered = block.with_nonce(block.get_nonce() + 1);
        assert!(!ProofOfWork::validate(&tampered));
    }

    #[test]
    fn test_prepare_data_layout() {
        let block = mined_block();
        let pow = ProofOfWork::new_proof_of_work(&block).unwrap();
        let data = pow.prepare_data(7);

        // genesis has no previous hash: merkle root + three 8-byte integers
        assert_eq!(data.len(), 32 + 8 * 3);
        assert_eq!(&data[data.len() - 8..], &7i64.to_be_bytes());
        assert_eq!(&data[32..40], &block.get_timestamp().to_be_bytes());
        assert_eq!(&data[40..48], &16i64.to_be_bytes());
    }

    #[test]
    fn test_meets_target_boundary() {
        let mut below = vec![0u8; 32];
        below[2] = 0xFF;
        assert!(meets_target(&below));

        let mut above = vec![0u8; 32];
        above[1] = 0x01;
        assert!(!meets_target(&above));
    }
}
