//! # Key Store
//!
//! Scrypt-encrypted keystore directory (standard Ethereum keystore JSON
//! format via ethers). The passphrase comes from a configured environment
//! variable; private-key export is additionally gated by configuration at
//! the API edge.

use std::path::{Path, PathBuf};

use ethers::core::rand::thread_rng;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes};
use tracing::info;

use crate::errors::KeysError;

#[derive(Debug)]
pub struct KeysManager {
    dir: PathBuf,
    passphrase: String,
}

impl KeysManager {
    pub fn new<P: AsRef<Path>>(dir: P, passphrase: String) -> Result<Self, KeysError> {
        let dir = dir.as_ref();
        if dir.as_os_str().is_empty() {
            return Err(KeysError::MissingDir);
        }
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            passphrase,
        })
    }

    pub fn passphrase_set(&self) -> bool {
        !self.passphrase.is_empty()
    }

    /// Generates a new account, encrypting its key into the keystore dir.
    pub fn create_account(&self) -> Result<Address, KeysError> {
        if self.passphrase.is_empty() {
            return Err(KeysError::EmptyPassphrase);
        }
        let (wallet, _uuid) =
            LocalWallet::new_keystore(&self.dir, &mut thread_rng(), &self.passphrase, None)
                .map_err(|e| KeysError::Wallet(e.to_string()))?;
        let address = wallet.address();
        info!(target: "keys", address = %format!("{address:#x}"), "account created");
        Ok(address)
    }

    /// All addresses present in the keystore directory.
    pub fn accounts(&self) -> Vec<Address> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().is_file() {
                continue;
            }
            if let Some(addr) = keystore_address(&entry.path()) {
                out.push(addr);
            }
        }
        out.sort();
        out
    }

    fn find_keystore_file(&self, addr: Address) -> Result<PathBuf, KeysError> {
        let entries = std::fs::read_dir(&self.dir)?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && keystore_address(&path) == Some(addr) {
                return Ok(path);
            }
        }
        Err(KeysError::AccountNotFound(format!("{addr:#x}")))
    }

    fn decrypt(&self, addr: Address) -> Result<LocalWallet, KeysError> {
        if self.passphrase.is_empty() {
            return Err(KeysError::EmptyPassphrase);
        }
        let path = self.find_keystore_file(addr)?;
        LocalWallet::decrypt_keystore(&path, &self.passphrase)
            .map_err(|e| KeysError::Wallet(e.to_string()))
    }

    /// Signs a transaction for `addr`, returning the raw RLP-encoded signed
    /// transaction ready for `eth_sendRawTransaction`.
    pub fn sign_transaction(
        &self,
        addr: Address,
        tx: &TypedTransaction,
        chain_id: u64,
    ) -> Result<Bytes, KeysError> {
        let wallet = self.decrypt(addr)?.with_chain_id(chain_id);
        let signature = wallet
            .sign_transaction_sync(tx)
            .map_err(|e| KeysError::Signing(e.to_string()))?;
        Ok(tx.rlp_signed(&signature))
    }

    /// The raw keystore JSON for `addr`.
    pub fn export_key_json(&self, addr: Address) -> Result<String, KeysError> {
        let path = self.find_keystore_file(addr)?;
        Ok(std::fs::read_to_string(path)?)
    }

    /// The decrypted private key as 0x-prefixed hex.
    pub fn export_private_key_hex(&self, addr: Address) -> Result<String, KeysError> {
        let wallet = self.decrypt(addr)?;
        let bytes = wallet.signer().to_bytes();
        Ok(format!("0x{}", hex::encode(bytes)))
    }
}

/// Reads the `address` field of a keystore JSON file.
fn keystore_address(path: &Path) -> Option<Address> {
    let contents = std::fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&contents).ok()?;
    let addr = value.get("address")?.as_str()?;
    let addr = addr.strip_prefix("0x").unwrap_or(addr);
    format!("0x{addr}").parse().ok()
}
