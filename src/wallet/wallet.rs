use crate::error::{BlockchainError, Result};
use crate::utils::{
    base58_decode, base58_encode, new_key_pair, public_key_from_pkcs8, ripemd160_digest,
    sha256_digest,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

const VERSION: u8 = 0x00;
pub const ADDRESS_CHECK_SUM_LEN: usize = 4;
/// Length of RIPEMD160(SHA256(pub_key))
pub const PUB_KEY_HASH_LEN: usize = 20;

/// One P-256 key pair. The private key is kept PKCS#8 encoded and wiped on drop.
#[derive(Clone, bincode::Encode, bincode::Decode, Zeroize, ZeroizeOnDrop)]
pub struct Wallet {
    pkcs8: Vec<u8>,
    #[zeroize(skip)]
    public_key: Vec<u8>,
}

impl Wallet {
    pub fn new() -> Result<Wallet> {
        let pkcs8 = new_key_pair()?;
        let public_key = public_key_from_pkcs8(&pkcs8)?;
        Ok(Wallet { pkcs8, public_key })
    }

    /// base58(version || pub_key_hash || checksum)
    pub fn get_address(&self) -> String {
        let pub_key_hash = hash_pub_key(self.public_key.as_slice());
        convert_address(pub_key_hash.as_slice())
    }

    /// Uncompressed public key as `X || Y`
    pub fn get_public_key(&self) -> &[u8] {
        self.public_key.as_slice()
    }

    pub fn get_pkcs8(&self) -> &[u8] {
        self.pkcs8.as_slice()
    }
}

pub fn hash_pub_key(pub_key: &[u8]) -> Vec<u8> {
    let pub_key_sha256 = sha256_digest(pub_key);
    ripemd160_digest(pub_key_sha256.as_slice())
}

fn checksum(payload: &[u8]) -> Vec<u8> {
    let first_sha = sha256_digest(payload);
    let second_sha = sha256_digest(first_sha.as_slice());
    second_sha[0..ADDRESS_CHECK_SUM_LEN].to_vec()
}

pub fn validate_address(address: &str) -> bool {
    let payload = match base58_decode(address) {
        Ok(payload) => payload,
        Err(_) => return false,
    };

    if payload.len() != 1 + PUB_KEY_HASH_LEN + ADDRESS_CHECK_SUM_LEN || payload[0] != VERSION {
        return false;
    }

    let (versioned, actual_checksum) = payload.split_at(payload.len() - ADDRESS_CHECK_SUM_LEN);
    let target_checksum = checksum(versioned);
    actual_checksum.eq(target_checksum.as_slice())
}

/// Extracts the public key hash from a checksummed address
pub fn pub_key_hash_from_address(address: &str) -> Result<Vec<u8>> {
    if !validate_address(address) {
        return Err(BlockchainError::InvalidAddress(address.to_string()));
    }
    let payload = base58_decode(address)?;
    Ok(payload[1..payload.len() - ADDRESS_CHECK_SUM_LEN].to_vec())
}

pub fn convert_address(pub_hash_key: &[u8]) -> String {
    let mut payload: Vec<u8> = vec![];
    payload.push(VERSION);
    payload.extend(pub_hash_key);
    let checksum = checksum(payload.as_slice());
    payload.extend(checksum.as_slice());
    base58_encode(payload.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_wallet_address_is_valid() {
        let wallet = Wallet::new().unwrap();
        let address = wallet.get_address();

        assert!(validate_address(&address));
        assert_eq!(wallet.get_public_key().len(), 64);
        assert_eq!(
            pub_key_hash_from_address(&address).unwrap(),
            hash_pub_key(wallet.get_public_key())
        );
    }

    #[test]
    fn test_known_address_validates() {
        let address = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";
        assert!(validate_address(address));
        assert_eq!(
            pub_key_hash_from_address(address).unwrap().len(),
            PUB_KEY_HASH_LEN
        );
    }

    #[test]
    fn test_checksum_mismatch_is_rejected() {
        let wallet = Wallet::new().unwrap();
        let mut payload = base58_decode(&wallet.get_address()).unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 0xFF;
        let tampered = base58_encode(&payload);

        assert!(!validate_address(&tampered));
        assert!(matches!(
            pub_key_hash_from_address(&tampered),
            Err(BlockchainError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_wrong_version_or_length_is_rejected() {
        let hash = hash_pub_key(Wallet::new().unwrap().get_public_key());

        let mut versioned = vec![0x05];
        versioned.extend(&hash);
        versioned.extend(checksum(&versioned));
        assert!(!validate_address(&base58_encode(&versioned)));

        // correctly checksummed, but the hash is too short
        let short = convert_address(&hash[..8]);
        assert!(!validate_address(&short));
        assert!(pub_key_hash_from_address(&short).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(!validate_address(""));
        assert!(!validate_address("not-base58-0OIl"));
        assert!(!validate_address("1111"));
    }

    #[test]
    fn test_convert_address_round_trip() {
        let wallet = Wallet::new().unwrap();
        let hash = hash_pub_key(wallet.get_public_key());
        assert_eq!(convert_address(&hash), wallet.get_address());
    }
}
