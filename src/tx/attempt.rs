//! Attempt builder: turns a transaction and a fee into a signed attempt

use super::gas::FeeEstimator;
use super::models::{AttemptState, Fee, Transaction, TxAttempt};
use crate::error::{TxmError, TxmResult};
use crate::keystore::Keystore;

use chrono::Utc;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Eip1559TransactionRequest, TransactionRequest, H256};
use ethers::utils::keccak256;
use std::sync::Arc;
use tracing::debug;

pub struct AttemptBuilder {
    keystore: Arc<dyn Keystore>,
    estimator: Arc<FeeEstimator>,
    chain_id: u64,
}

impl AttemptBuilder {
    pub fn new(keystore: Arc<dyn Keystore>, estimator: Arc<FeeEstimator>, chain_id: u64) -> Self {
        Self {
            keystore,
            estimator,
            chain_id,
        }
    }

    pub fn estimator(&self) -> &FeeEstimator {
        &self.estimator
    }

    /// First attempt for `tx` at the estimator's initial fee
    pub async fn new_attempt(&self, tx: &Transaction) -> TxmResult<TxAttempt> {
        let fee = self.estimator.initial_fee().await?;
        let gas_limit = self.estimator.chain_specific_gas_limit(tx.fee_limit);
        self.new_attempt_with_fee(tx, fee, gas_limit).await
    }

    /// Replacement for `previous` at a strictly higher fee, same nonce and gas limit
    pub async fn new_bumped_attempt(&self, tx: &Transaction, previous: &TxAttempt) -> TxmResult<TxAttempt> {
        let fee = self.estimator.bump(&previous.fee)?;
        debug!(
            "Bumping tx {} (nonce {:?}) from {} to {}",
            tx.id, tx.sequence, previous.fee, fee
        );
        self.new_attempt_with_fee(tx, fee, previous.chain_specific_gas_limit)
            .await
    }

    pub async fn new_attempt_with_fee(
        &self,
        tx: &Transaction,
        fee: Fee,
        gas_limit: u64,
    ) -> TxmResult<TxAttempt> {
        let unsigned = unsigned_transaction(tx, &fee, gas_limit, self.chain_id)?;
        let signed_raw_tx = self
            .keystore
            .sign(tx.from_address, &unsigned, self.chain_id)
            .await?;

        Ok(TxAttempt {
            id: 0,
            tx_id: tx.id,
            fee,
            chain_specific_gas_limit: gas_limit,
            hash: H256::from(keccak256(&signed_raw_tx)),
            signed_raw_tx,
            state: AttemptState::InProgress,
            broadcast_before_block_num: None,
            created_at: Utc::now(),
            receipts: Vec::new(),
        })
    }
}

/// Unsigned chain transaction for `tx` at `fee`; the nonce must already be assigned
pub fn unsigned_transaction(
    tx: &Transaction,
    fee: &Fee,
    gas_limit: u64,
    chain_id: u64,
) -> TxmResult<TypedTransaction> {
    let nonce = tx.sequence.ok_or_else(|| {
        TxmError::Internal(format!("cannot build an attempt for tx {} without a nonce", tx.id))
    })?;

    let typed: TypedTransaction = match fee {
        Fee::Legacy { gas_price } => TransactionRequest::new()
            .from(tx.from_address)
            .to(tx.to_address)
            .value(tx.value)
            .data(tx.encoded_payload.clone())
            .nonce(nonce)
            .gas(gas_limit)
            .gas_price(*gas_price)
            .chain_id(chain_id)
            .into(),
        Fee::Dynamic { tip_cap, fee_cap } => Eip1559TransactionRequest::new()
            .from(tx.from_address)
            .to(tx.to_address)
            .value(tx.value)
            .data(tx.encoded_payload.clone())
            .nonce(nonce)
            .gas(gas_limit)
            .max_priority_fee_per_gas(*tip_cap)
            .max_fee_per_gas(*fee_cap)
            .chain_id(chain_id)
            .into(),
    };
    Ok(typed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::config::{FeeConfig, FeeEstimatorMode};
    use crate::keystore::{LocalKeystore, TEST_PRIVATE_KEY};
    use crate::tx::models::{NewTransaction, TxStrategy};
    use ethers::types::{Address, Bytes, U256};

    fn fee_config() -> FeeConfig {
        FeeConfig {
            mode: FeeEstimatorMode::Fixed,
            price_default_wei: 10_000_000_000,
            price_min_wei: 0,
            price_max_wei: 100_000_000_000,
            tip_cap_default_wei: 1_000_000_000,
            tip_cap_min_wei: 0,
            bump_percent: 20,
            bump_min_wei: 0,
            bump_threshold: 3,
            bump_tx_depth: 0,
            limit_multiplier: 2.0,
        }
    }

    fn builder() -> (AttemptBuilder, Address) {
        let keystore = LocalKeystore::from_private_keys(TEST_PRIVATE_KEY, vec![]).unwrap();
        let from = keystore.enabled_addresses()[0];
        let estimator = FeeEstimator::new(Arc::new(MockChainClient::new()), fee_config(), false);
        (
            AttemptBuilder::new(Arc::new(keystore), Arc::new(estimator), 1337),
            from,
        )
    }

    fn tx(from: Address, nonce: Option<u64>) -> Transaction {
        let mut tx = Transaction::unstarted(
            1337,
            &NewTransaction {
                from_address: from,
                to_address: Address::repeat_byte(0x33),
                encoded_payload: Bytes::from(vec![0xde, 0xad]),
                value: U256::from(142),
                fee_limit: 50_000,
                strategy: TxStrategy::SendEvery,
                min_confirmations: None,
                pipeline_task_run_id: None,
                signal_callback: false,
            },
        );
        tx.id = 7;
        tx.sequence = nonce;
        tx
    }

    #[tokio::test]
    async fn test_new_attempt_is_signed_and_hashed() {
        let (builder, from) = builder();
        let attempt = builder.new_attempt(&tx(from, Some(3))).await.unwrap();

        assert_eq!(attempt.tx_id, 7);
        assert_eq!(attempt.state, AttemptState::InProgress);
        assert_eq!(attempt.chain_specific_gas_limit, 100_000);
        assert_eq!(attempt.fee, Fee::Legacy { gas_price: U256::from(10_000_000_000u64) });
        assert_eq!(attempt.hash, H256::from(keccak256(&attempt.signed_raw_tx)));
    }

    #[tokio::test]
    async fn test_bumped_attempt_keeps_gas_limit_and_changes_hash() {
        let (builder, from) = builder();
        let tx = tx(from, Some(3));
        let first = builder.new_attempt(&tx).await.unwrap();
        let bumped = builder.new_bumped_attempt(&tx, &first).await.unwrap();

        assert_eq!(bumped.fee, Fee::Legacy { gas_price: U256::from(12_000_000_000u64) });
        assert_eq!(bumped.chain_specific_gas_limit, first.chain_specific_gas_limit);
        assert_ne!(bumped.hash, first.hash);
    }

    #[tokio::test]
    async fn test_attempt_requires_nonce() {
        let (builder, from) = builder();
        let err = builder.new_attempt(&tx(from, None)).await.unwrap_err();
        assert!(matches!(err, TxmError::Internal(_)));
    }
}
