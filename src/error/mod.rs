//! Error handling for the ledger node
//!
//! Every fallible operation in the crate returns [`Result`]. The variants follow
//! the failure classes a node can hit: bad configuration, ledger state, crypto and
//! validation rejections, storage I/O and peer protocol problems.

use std::fmt;

/// Result type alias for blockchain operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

#[derive(Debug, Clone)]
pub enum BlockchainError {
    /// Missing or invalid node configuration
    Config(String),
    /// `createblockchain` against a path that already holds a ledger
    LedgerExists(String),
    /// Opening a ledger that was never created
    LedgerNotFound(String),
    /// Database-related errors
    Database(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// File I/O errors
    Io(String),
    /// Key handling and signing failures
    Crypto(String),
    /// Invalid address format or checksum
    InvalidAddress(String),
    /// A transaction failed signature verification
    InvalidSignature(String),
    /// Insufficient funds for transaction
    InsufficientFunds { required: u64, available: u64 },
    /// Transaction construction errors
    Transaction(String),
    /// Block validation errors
    InvalidBlock(String),
    /// Mining errors
    Mining(String),
    /// Network communication errors
    Network(String),
    /// Malformed payload or unknown command on the wire
    Protocol(String),
    /// No wallet for the requested address
    WalletNotFound(String),
    /// The wallet file does not exist
    WalletFileNotFound(String),
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::Config(msg) => write!(f, "Configuration error: {msg}"),
            BlockchainError::LedgerExists(path) => {
                write!(f, "Blockchain already exists at {path}")
            }
            BlockchainError::LedgerNotFound(path) => {
                write!(f, "No existing blockchain found at {path}. Create one first.")
            }
            BlockchainError::Database(msg) => write!(f, "Database error: {msg}"),
            BlockchainError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            BlockchainError::Io(msg) => write!(f, "I/O error: {msg}"),
            BlockchainError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            BlockchainError::InvalidAddress(addr) => write!(f, "Invalid address: {addr}"),
            BlockchainError::InvalidSignature(msg) => write!(f, "Invalid signature: {msg}"),
            BlockchainError::InsufficientFunds {
                required,
                available,
            } => {
                write!(
                    f,
                    "Insufficient funds: required {required}, available {available}"
                )
            }
            BlockchainError::Transaction(msg) => write!(f, "Transaction error: {msg}"),
            BlockchainError::InvalidBlock(msg) => write!(f, "Invalid block: {msg}"),
            BlockchainError::Mining(msg) => write!(f, "Mining error: {msg}"),
            BlockchainError::Network(msg) => write!(f, "Network error: {msg}"),
            BlockchainError::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            BlockchainError::WalletNotFound(addr) => {
                write!(f, "Wallet not found for address: {addr}")
            }
            BlockchainError::WalletFileNotFound(path) => {
                write!(f, "Wallet file not found: {path}")
            }
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<sled::Error> for BlockchainError {
    fn from(err: sled::Error) -> Self {
        BlockchainError::Database(err.to_string())
    }
}

impl From<sled::transaction::TransactionError> for BlockchainError {
    fn from(err: sled::transaction::TransactionError) -> Self {
        BlockchainError::Database(format!("{err:?}"))
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BlockchainError {
    fn from(err: toml::de::Error) -> Self {
        BlockchainError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_funds_display() {
        let err = BlockchainError::InsufficientFunds {
            required: 12,
            available: 10,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient funds: required 12, available 10"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: BlockchainError = io.into();
        assert!(matches!(err, BlockchainError::Io(_)));
    }
}
