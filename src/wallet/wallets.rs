use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use crate::wallet::Wallet;
use log::info;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Wallet set of one node identity, persisted as a single bincode file
/// mapping address to wallet.
pub struct Wallets {
    wallets: HashMap<String, Wallet>,
    path: PathBuf,
}

impl Wallets {
    /// Loads the wallet file at `path`.
    ///
    /// A missing file yields [`BlockchainError::WalletFileNotFound`]; unreadable
    /// content yields a serialization error.
    pub fn load_from_file(path: &Path) -> Result<Wallets> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BlockchainError::WalletFileNotFound(
                    path.display().to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        let mut buf = vec![];
        file.read_to_end(&mut buf)?;
        let wallets: HashMap<String, Wallet> = deserialize(&buf[..])?;
        Ok(Wallets {
            wallets,
            path: path.to_path_buf(),
        })
    }

    /// Loads the wallet file, starting from an empty set when it does not exist yet
    pub fn load_or_default(path: &Path) -> Result<Wallets> {
        match Self::load_from_file(path) {
            Err(BlockchainError::WalletFileNotFound(_)) => Ok(Wallets {
                wallets: HashMap::new(),
                path: path.to_path_buf(),
            }),
            other => other,
        }
    }

    pub fn create_wallet(&mut self) -> Result<String> {
        let wallet = Wallet::new()?;
        let address = wallet.get_address();
        self.wallets.insert(address.clone(), wallet);
        self.save_to_file()?;
        info!("Created wallet {address}");
        Ok(address)
    }

    pub fn get_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.wallets.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn get_wallet(&self, address: &str) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    pub fn save_to_file(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        let wallets_bytes = serialize(&self.wallets)?;
        writer.write_all(wallets_bytes.as_slice())?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_distinguishable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wallet_3000.dat");

        assert!(matches!(
            Wallets::load_from_file(&path),
            Err(BlockchainError::WalletFileNotFound(_))
        ));
        assert!(Wallets::load_or_default(&path).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_a_serialization_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wallet_3000.dat");
        std::fs::write(&path, [0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap();

        assert!(matches!(
            Wallets::load_from_file(&path),
            Err(BlockchainError::Serialization(_))
        ));
    }

    #[test]
    fn test_wallets_persist_across_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("wallet_3000.dat");

        let mut wallets = Wallets::load_or_default(&path).unwrap();
        let first = wallets.create_wallet().unwrap();
        let second = wallets.create_wallet().unwrap();

        let reloaded = Wallets::load_from_file(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        let mut expected = vec![first.clone(), second];
        expected.sort();
        assert_eq!(reloaded.get_addresses(), expected);

        let original = wallets.get_wallet(&first).unwrap();
        let loaded = reloaded.get_wallet(&first).unwrap();
        assert_eq!(original.get_public_key(), loaded.get_public_key());
        assert_eq!(original.get_pkcs8(), loaded.get_pkcs8());
    }
}
