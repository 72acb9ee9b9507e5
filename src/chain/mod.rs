//! Chain module - the RPC surface the transaction manager consumes
//!
//! This module provides:
//! - The `ChainClient` trait and the closed `SendResultCode` classification
//! - An ethers-backed client with multi-RPC failover
//! - Head tracking with parent chains for reorg detection
//! - Chain-specific finality defaults

pub mod finality;
pub mod head;
pub mod listener;
pub mod provider;

pub use head::Head;
pub use listener::HeadTracker;
pub use provider::EthersChainClient;

use crate::error::TxmResult;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};
use std::fmt;
use std::time::Duration;

/// Outcome of submitting a signed transaction, classified by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResultCode {
    Successful,
    TransactionAlreadyKnown,
    /// Nonce already consumed on chain, i.e. this or a competing tx was mined
    NonceTooLow,
    Underpriced,
    ExceedsMaxFee,
    InsufficientFunds,
    Retryable,
    Fatal,
}

impl fmt::Display for SendResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SendResultCode::Successful => "successful",
            SendResultCode::TransactionAlreadyKnown => "already_known",
            SendResultCode::NonceTooLow => "nonce_too_low",
            SendResultCode::Underpriced => "underpriced",
            SendResultCode::ExceedsMaxFee => "exceeds_max_fee",
            SendResultCode::InsufficientFunds => "insufficient_funds",
            SendResultCode::Retryable => "retryable",
            SendResultCode::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub code: SendResultCode,
    /// Node's message, empty on success
    pub message: String,
}

impl SendResult {
    pub fn new(code: SendResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn successful() -> Self {
        Self::new(SendResultCode::Successful, "")
    }
}

/// Minimal block header used to build head chains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub base_fee_per_gas: Option<U256>,
}

/// Result of an `eth_call` simulation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationOutcome {
    Success,
    Reverted(String),
}

/// Chain RPC operations used by the broadcaster, confirmer and housekeeping jobs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn configured_chain_id(&self) -> u64;

    /// Next nonce including pending mempool transactions
    async fn pending_nonce_at(&self, account: Address) -> TxmResult<u64>;

    async fn send_transaction(&self, signed_raw_tx: &Bytes) -> SendResult;

    /// One result per hash, in the same order
    async fn batch_fetch_receipts(
        &self,
        hashes: &[H256],
    ) -> TxmResult<Vec<TxmResult<Option<TransactionReceipt>>>>;

    async fn gas_price(&self) -> TxmResult<U256>;

    async fn latest_header(&self) -> TxmResult<BlockHeader>;

    async fn header_by_hash(&self, hash: H256) -> TxmResult<Option<BlockHeader>>;

    async fn simulate(&self, tx: &TypedTransaction) -> TxmResult<SimulationOutcome>;
}

/// Sends with a bounded timeout; a timeout is always retryable since the tx may still land
pub async fn send_with_timeout(
    client: &dyn ChainClient,
    signed_raw_tx: &Bytes,
    timeout: Duration,
) -> SendResult {
    match tokio::time::timeout(timeout, client.send_transaction(signed_raw_tx)).await {
        Ok(result) => result,
        Err(_) => SendResult::new(
            SendResultCode::Retryable,
            format!("send timed out after {:?}", timeout),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_passes_through_classification() {
        let mut client = MockChainClient::new();
        client
            .expect_send_transaction()
            .returning(|_| SendResult::new(SendResultCode::Underpriced, "transaction underpriced"));
        let result = send_with_timeout(&client, &Bytes::default(), Duration::from_secs(1)).await;
        assert_eq!(result.code, SendResultCode::Underpriced);
        assert_eq!(result.message, "transaction underpriced");
    }
}
