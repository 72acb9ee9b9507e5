//! Keystore: holds the local sending keys and signs transactions

use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer as _};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes};
use std::collections::{HashMap, HashSet};
use std::env;
use tracing::{info, warn};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Keystore: Send + Sync {
    /// Signs `tx` for `chain_id`, returning the raw RLP bytes ready to send
    async fn sign(&self, from: Address, tx: &TypedTransaction, chain_id: u64) -> TxmResult<Bytes>;

    /// Addresses allowed to send
    fn enabled_addresses(&self) -> Vec<Address>;
}

/// In-process keystore backed by ethers `LocalWallet`s
pub struct LocalKeystore {
    wallets: HashMap<Address, LocalWallet>,
    disabled: HashSet<Address>,
}

impl LocalKeystore {
    pub fn new(wallets: Vec<LocalWallet>, disabled: Vec<Address>) -> Self {
        Self {
            wallets: wallets.into_iter().map(|w| (w.address(), w)).collect(),
            disabled: disabled.into_iter().collect(),
        }
    }

    /// Parses comma separated hex private keys
    pub fn from_private_keys(keys: &str, disabled: Vec<Address>) -> TxmResult<Self> {
        let mut wallets = Vec::new();
        for key in keys.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            let wallet = key
                .trim_start_matches("0x")
                .parse::<LocalWallet>()
                .map_err(|e| TxmError::Config(format!("Invalid private key: {}", e)))?;
            wallets.push(wallet);
        }
        Ok(Self::new(wallets, disabled))
    }

    /// Load keys from an environment variable
    pub fn from_env(var: &str, disabled: Vec<Address>) -> TxmResult<Self> {
        let keys = env::var(var)
            .map_err(|_| TxmError::Config(format!("Private keys not found in env var {}", var)))?;
        let keystore = Self::from_private_keys(&keys, disabled)?;
        if keystore.wallets.is_empty() {
            return Err(TxmError::Config(format!("No private keys in env var {}", var)));
        }
        for address in keystore.wallets.keys() {
            if keystore.disabled.contains(address) {
                warn!("Key {:?} is loaded but disabled", address);
            } else {
                info!("Loaded sending key {:?}", address);
            }
        }
        Ok(keystore)
    }
}

#[async_trait]
impl Keystore for LocalKeystore {
    async fn sign(&self, from: Address, tx: &TypedTransaction, chain_id: u64) -> TxmResult<Bytes> {
        if self.disabled.contains(&from) {
            return Err(TxmError::AddressDisabled { address: from });
        }
        let wallet = self
            .wallets
            .get(&from)
            .ok_or(TxmError::AddressDisabled { address: from })?
            .clone()
            .with_chain_id(chain_id);

        let mut tx = tx.clone();
        tx.set_chain_id(chain_id);
        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| TxmError::Signer(e.to_string()))?;

        Ok(tx.rlp_signed(&signature))
    }

    fn enabled_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self
            .wallets
            .keys()
            .filter(|a| !self.disabled.contains(*a))
            .copied()
            .collect();
        addresses.sort();
        addresses
    }
}

#[cfg(test)]
pub(crate) const TEST_PRIVATE_KEY: &str =
    "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Eip1559TransactionRequest, TransactionRequest};
    use ethers::utils::keccak256;

    #[tokio::test]
    async fn test_signs_legacy_and_dynamic_transactions() {
        let keystore = LocalKeystore::from_private_keys(TEST_PRIVATE_KEY, vec![]).unwrap();
        let from = keystore.enabled_addresses()[0];

        let legacy: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(Address::repeat_byte(0x11))
            .nonce(0u64)
            .gas(21_000u64)
            .gas_price(1_000_000_000u64)
            .into();
        let raw = keystore.sign(from, &legacy, 1337).await.unwrap();
        assert!(!raw.is_empty());

        let dynamic: TypedTransaction = Eip1559TransactionRequest::new()
            .from(from)
            .to(Address::repeat_byte(0x11))
            .nonce(0u64)
            .gas(21_000u64)
            .max_fee_per_gas(2_000_000_000u64)
            .max_priority_fee_per_gas(1_000_000_000u64)
            .into();
        let raw_dynamic = keystore.sign(from, &dynamic, 1337).await.unwrap();
        // Typed envelope starts with the EIP-1559 type byte
        assert_eq!(raw_dynamic[0], 0x02);
        assert_ne!(keccak256(&raw), keccak256(&raw_dynamic));
    }

    #[tokio::test]
    async fn test_disabled_address_cannot_sign() {
        let keystore = LocalKeystore::from_private_keys(TEST_PRIVATE_KEY, vec![]).unwrap();
        let from = keystore.enabled_addresses()[0];
        let keystore = LocalKeystore::from_private_keys(TEST_PRIVATE_KEY, vec![from]).unwrap();
        assert!(keystore.enabled_addresses().is_empty());

        let tx: TypedTransaction = TransactionRequest::new().from(from).into();
        let err = keystore.sign(from, &tx, 1).await.unwrap_err();
        assert!(matches!(err, TxmError::AddressDisabled { .. }));
    }
}
