//! Transmit checkers: pluggable veto run before an attempt is sent

use super::attempt::unsigned_transaction;
use super::models::{Transaction, TxAttempt};
use crate::chain::{ChainClient, SimulationOutcome};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckerError {
    /// The tx must never be sent
    #[error("transmit check vetoed tx: {0}")]
    Veto(String),

    /// The check could not reach a verdict; callers send anyway
    #[error("transmit check inconclusive: {0}")]
    Unknown(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransmitChecker: Send + Sync {
    async fn check(&self, tx: &Transaction, attempt: &TxAttempt) -> Result<(), CheckerError>;
}

/// Always allows sending
pub struct NoopChecker;

#[async_trait]
impl TransmitChecker for NoopChecker {
    async fn check(&self, _tx: &Transaction, _attempt: &TxAttempt) -> Result<(), CheckerError> {
        Ok(())
    }
}

/// Vetoes txs whose `eth_call` simulation reverts
pub struct SimulateChecker {
    client: Arc<dyn ChainClient>,
}

impl SimulateChecker {
    pub fn new(client: Arc<dyn ChainClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TransmitChecker for SimulateChecker {
    async fn check(&self, tx: &Transaction, attempt: &TxAttempt) -> Result<(), CheckerError> {
        let unsigned = unsigned_transaction(
            tx,
            &attempt.fee,
            attempt.chain_specific_gas_limit,
            self.client.configured_chain_id(),
        )
        .map_err(|e| CheckerError::Unknown(e.to_string()))?;

        match self.client.simulate(&unsigned).await {
            Ok(SimulationOutcome::Success) => {
                debug!("Simulation of tx {} succeeded", tx.id);
                Ok(())
            }
            Ok(SimulationOutcome::Reverted(reason)) => Err(CheckerError::Veto(format!(
                "simulation reverted: {}",
                reason
            ))),
            Err(e) => Err(CheckerError::Unknown(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::error::TxmError;
    use crate::tx::models::{AttemptState, Fee, NewTransaction, TxStrategy};
    use chrono::Utc;
    use ethers::types::{Address, Bytes, H256, U256};

    fn fixture() -> (Transaction, TxAttempt) {
        let mut tx = Transaction::unstarted(
            1,
            &NewTransaction {
                from_address: Address::repeat_byte(1),
                to_address: Address::repeat_byte(2),
                encoded_payload: Bytes::default(),
                value: U256::zero(),
                fee_limit: 21_000,
                strategy: TxStrategy::SendEvery,
                min_confirmations: None,
                pipeline_task_run_id: None,
                signal_callback: false,
            },
        );
        tx.sequence = Some(0);
        let attempt = TxAttempt {
            id: 1,
            tx_id: tx.id,
            fee: Fee::Legacy {
                gas_price: U256::from(1),
            },
            chain_specific_gas_limit: 21_000,
            signed_raw_tx: Bytes::default(),
            hash: H256::zero(),
            state: AttemptState::InProgress,
            broadcast_before_block_num: None,
            created_at: Utc::now(),
            receipts: vec![],
        };
        (tx, attempt)
    }

    #[tokio::test]
    async fn test_simulation_outcomes_map_to_verdicts() {
        let (tx, attempt) = fixture();

        let mut client = MockChainClient::new();
        client.expect_configured_chain_id().return_const(1u64);
        client
            .expect_simulate()
            .returning(|_| Ok(SimulationOutcome::Reverted("out of gas".to_string())));
        let checker = SimulateChecker::new(Arc::new(client));
        assert!(matches!(
            checker.check(&tx, &attempt).await,
            Err(CheckerError::Veto(_))
        ));

        let mut client = MockChainClient::new();
        client.expect_configured_chain_id().return_const(1u64);
        client.expect_simulate().returning(|_| {
            Err(TxmError::ChainConnection {
                chain_id: 1,
                message: "timeout".to_string(),
            })
        });
        let checker = SimulateChecker::new(Arc::new(client));
        assert!(matches!(
            checker.check(&tx, &attempt).await,
            Err(CheckerError::Unknown(_))
        ));

        assert!(NoopChecker.check(&tx, &attempt).await.is_ok());
    }
}
