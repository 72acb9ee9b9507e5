//! Chain client with multi-RPC support and automatic failover

use super::{BlockHeader, ChainClient, SendResult, SendResultCode, SimulationOutcome};
use crate::config::ChainConfig;
use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Node error fragments, checked in order; anything unmatched is retryable
const SEND_ERROR_CLASSES: &[(&str, SendResultCode)] = &[
    ("nonce too low", SendResultCode::NonceTooLow),
    ("nonce is too low", SendResultCode::NonceTooLow),
    ("oldnonce", SendResultCode::NonceTooLow),
    ("already known", SendResultCode::TransactionAlreadyKnown),
    ("known transaction", SendResultCode::TransactionAlreadyKnown),
    ("already imported", SendResultCode::TransactionAlreadyKnown),
    ("already in mempool", SendResultCode::TransactionAlreadyKnown),
    ("replacement transaction underpriced", SendResultCode::Underpriced),
    ("transaction underpriced", SendResultCode::Underpriced),
    ("fee too low", SendResultCode::Underpriced),
    ("gas price too low", SendResultCode::Underpriced),
    ("max fee per gas less than block base fee", SendResultCode::Underpriced),
    ("exceeds the configured cap", SendResultCode::ExceedsMaxFee),
    ("fee cap exceeded", SendResultCode::ExceedsMaxFee),
    ("insufficient funds", SendResultCode::InsufficientFunds),
    ("insufficient balance", SendResultCode::InsufficientFunds),
    ("exceeds block gas limit", SendResultCode::Fatal),
    ("intrinsic gas too low", SendResultCode::Fatal),
    ("invalid sender", SendResultCode::Fatal),
    ("invalid chain id", SendResultCode::Fatal),
    ("oversized data", SendResultCode::Fatal),
    ("transaction type not supported", SendResultCode::Fatal),
    ("tip higher than fee cap", SendResultCode::Fatal),
    ("max priority fee per gas higher than max fee per gas", SendResultCode::Fatal),
    ("nonce too high", SendResultCode::Fatal),
];

/// Maps a node's error text onto the closed send classification
pub fn classify_send_error(message: &str) -> SendResultCode {
    let lower = message.to_lowercase();
    SEND_ERROR_CLASSES
        .iter()
        .find(|(fragment, _)| lower.contains(fragment))
        .map(|(_, code)| *code)
        .unwrap_or(SendResultCode::Retryable)
}

/// Multi-provider client with automatic failover
pub struct EthersChainClient {
    chain_id: u64,
    name: String,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EthersChainClient {
    pub fn new(chain_id: u64, config: &ChainConfig) -> TxmResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(TxmError::ChainConnection {
                chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            chain_id,
            name: config.name.clone(),
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} ({}) failover to provider {}", self.chain_id, self.name, next);
    }

    fn connection_error(&self, e: impl std::fmt::Display) -> TxmError {
        TxmError::ChainConnection {
            chain_id: self.chain_id,
            message: e.to_string(),
        }
    }

    fn header_from_block(&self, block: Block<H256>) -> TxmResult<BlockHeader> {
        let number = block
            .number
            .ok_or_else(|| self.connection_error("block has no number (pending)"))?;
        let hash = block
            .hash
            .ok_or_else(|| self.connection_error("block has no hash (pending)"))?;
        Ok(BlockHeader {
            number: number.as_u64(),
            hash,
            parent_hash: block.parent_hash,
            base_fee_per_gas: block.base_fee_per_gas,
        })
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> TxmResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number from chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        self.get_block_number().await.is_ok()
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    fn configured_chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn pending_nonce_at(&self, account: Address) -> TxmResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self
                .http()
                .get_transaction_count(account, Some(BlockNumber::Pending.into()))
                .await
            {
                Ok(nonce) => return Ok(nonce.as_u64()),
                Err(e) => {
                    warn!("Failed to get pending nonce for {:?}: {}", account, e);
                    self.failover();
                }
            }
        }

        Err(TxmError::Nonce {
            address: account,
            message: "All providers failed to return a pending nonce".to_string(),
        })
    }

    async fn send_transaction(&self, signed_raw_tx: &Bytes) -> SendResult {
        match self.http().send_raw_transaction(signed_raw_tx.clone()).await {
            Ok(pending) => {
                debug!("Chain {} accepted tx {:?}", self.chain_id, pending.tx_hash());
                SendResult::successful()
            }
            Err(e) => {
                let message = e.to_string();
                let code = classify_send_error(&message);
                if code == SendResultCode::Retryable {
                    // Transport trouble on this endpoint, next send goes elsewhere
                    self.failover();
                }
                SendResult::new(code, message)
            }
        }
    }

    async fn batch_fetch_receipts(
        &self,
        hashes: &[H256],
    ) -> TxmResult<Vec<TxmResult<Option<TransactionReceipt>>>> {
        let provider = self.http();
        let requests = hashes
            .iter()
            .map(|hash| provider.get_transaction_receipt(*hash));
        let results = join_all(requests).await;

        Ok(results
            .into_iter()
            .map(|r| r.map_err(|e| self.connection_error(e)))
            .collect())
    }

    async fn gas_price(&self) -> TxmResult<U256> {
        self.http()
            .get_gas_price()
            .await
            .map_err(|e| self.connection_error(e))
    }

    async fn latest_header(&self) -> TxmResult<BlockHeader> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block(BlockNumber::Latest).await {
                Ok(Some(block)) => return self.header_from_block(block),
                Ok(None) => return Err(self.connection_error("No latest block")),
                Err(e) => {
                    warn!("Failed to get latest block from chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to return the latest block"))
    }

    async fn header_by_hash(&self, hash: H256) -> TxmResult<Option<BlockHeader>> {
        match self.http().get_block(hash).await {
            Ok(Some(block)) => self.header_from_block(block).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(self.connection_error(e)),
        }
    }

    async fn simulate(&self, tx: &TypedTransaction) -> TxmResult<SimulationOutcome> {
        match self.http().call(tx, None).await {
            Ok(_) => Ok(SimulationOutcome::Success),
            Err(e) => {
                let message = e.to_string();
                if message.to_lowercase().contains("revert") {
                    Ok(SimulationOutcome::Reverted(message))
                } else {
                    Err(self.connection_error(message))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_send_error() {
        assert_eq!(
            classify_send_error("(code: -32000, message: nonce too low, data: None)"),
            SendResultCode::NonceTooLow
        );
        assert_eq!(
            classify_send_error("replacement transaction underpriced"),
            SendResultCode::Underpriced
        );
        assert_eq!(classify_send_error("already known"), SendResultCode::TransactionAlreadyKnown);
        assert_eq!(
            classify_send_error("tx fee (1.10 ether) exceeds the configured cap (1.00 ether)"),
            SendResultCode::ExceedsMaxFee
        );
        assert_eq!(
            classify_send_error("insufficient funds for gas * price + value"),
            SendResultCode::InsufficientFunds
        );
        assert_eq!(classify_send_error("exceeds block gas limit"), SendResultCode::Fatal);
        assert_eq!(
            classify_send_error("error sending request: connection refused"),
            SendResultCode::Retryable
        );
    }

    #[test]
    fn test_new_requires_a_valid_url() {
        let config = ChainConfig {
            name: "local".into(),
            rpc_urls: vec!["not a url".into()],
        };
        assert!(EthersChainClient::new(1337, &config).is_err());

        let config = ChainConfig {
            name: "local".into(),
            rpc_urls: vec!["http://localhost:8545".into()],
        };
        let client = EthersChainClient::new(1337, &config).unwrap();
        assert_eq!(client.configured_chain_id(), 1337);
    }
}
