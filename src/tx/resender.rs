//! Resender: periodically re-sends attempts that have sat unconfirmed for a while,
//! in case the node dropped them from its mempool.

use crate::chain::{send_with_timeout, ChainClient, SendResultCode};
use crate::error::TxmResult;
use crate::store::TxStore;

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Resender {
    chain_id: u64,
    store: Arc<dyn TxStore>,
    client: Arc<dyn ChainClient>,
    interval: Duration,
    resend_after: Duration,
    batch_size: usize,
    max_in_flight: u32,
    send_timeout: Duration,
}

impl Resender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: u64,
        store: Arc<dyn TxStore>,
        client: Arc<dyn ChainClient>,
        interval: Duration,
        resend_after: Duration,
        batch_size: usize,
        max_in_flight: u32,
        send_timeout: Duration,
    ) -> Self {
        Self {
            chain_id,
            store,
            client,
            interval,
            resend_after,
            batch_size: batch_size.max(1),
            max_in_flight,
            send_timeout,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Resender started for chain {} (every {:?}, after {:?})",
            self.chain_id, self.interval, self.resend_after
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            if let Err(e) = self.resend_unconfirmed().await {
                warn!("Failed to resend unconfirmed txs: {}", e);
            }
        }
        info!("Resender stopped");
    }

    /// Returns how many attempts the node accepted
    pub async fn resend_unconfirmed(&self) -> TxmResult<usize> {
        let older_than = Utc::now()
            - chrono::Duration::from_std(self.resend_after).unwrap_or_else(|_| chrono::Duration::zero());
        let attempts = self
            .store
            .find_attempts_requiring_resend(older_than, self.max_in_flight, self.chain_id)
            .await?;
        if attempts.is_empty() {
            return Ok(0);
        }
        debug!("Re-sending {} unconfirmed attempts", attempts.len());

        let mut accepted = Vec::new();
        for batch in attempts.chunks(self.batch_size) {
            let results = join_all(batch.iter().map(|attempt| {
                send_with_timeout(self.client.as_ref(), &attempt.signed_raw_tx, self.send_timeout)
            }))
            .await;

            for (attempt, result) in batch.iter().zip(results) {
                match result.code {
                    SendResultCode::Successful
                    | SendResultCode::TransactionAlreadyKnown
                    | SendResultCode::NonceTooLow => accepted.push(attempt.tx_id),
                    code => debug!(
                        "Resend of attempt {:?} for tx {} returned {}: {}",
                        attempt.hash, attempt.tx_id, code, result.message
                    ),
                }
            }
        }

        if !accepted.is_empty() {
            self.store.update_broadcast_ats(Utc::now(), &accepted).await?;
        }
        info!(
            "Re-sent {} attempts, {} accepted",
            attempts.len(),
            accepted.len()
        );
        Ok(accepted.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainClient, SendResult};
    use crate::store::MemoryTxStore;
    use crate::tx::models::{AttemptState, Fee, NewTransaction, Transaction, TxAttempt, TxState, TxStrategy};
    use chrono::Duration as ChronoDuration;
    use ethers::types::{Address, Bytes, H256, U256};
    use tokio_test::assert_ok;

    const CHAIN_ID: u64 = 1337;

    fn unconfirmed(nonce: u64, raw: u8, broadcast_at: chrono::DateTime<Utc>) -> Transaction {
        let mut tx = Transaction::unstarted(
            CHAIN_ID,
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
        tx.state = TxState::Unconfirmed;
        tx.sequence = Some(nonce);
        tx.broadcast_at = Some(broadcast_at);
        tx.initial_broadcast_at = Some(broadcast_at);
        tx.attempts = vec![TxAttempt {
            id: 0,
            tx_id: 0,
            fee: Fee::Legacy {
                gas_price: U256::from(1_000),
            },
            chain_specific_gas_limit: 21_000,
            signed_raw_tx: Bytes::from(vec![raw]),
            hash: H256::from_low_u64_be(raw as u64),
            state: AttemptState::Broadcast,
            broadcast_before_block_num: Some(1),
            created_at: broadcast_at,
            receipts: vec![],
        }];
        tx
    }

    fn resender(client: MockChainClient, store: Arc<MemoryTxStore>) -> Resender {
        Resender::new(
            CHAIN_ID,
            store,
            Arc::new(client),
            Duration::from_secs(30),
            Duration::from_secs(60),
            2,
            0,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_resends_only_stale_attempts() {
        let store = Arc::new(MemoryTxStore::new());
        let stale_at = Utc::now() - ChronoDuration::minutes(5);
        let stale = store.insert_transaction(unconfirmed(0, 1, stale_at)).await;
        let dropped = store.insert_transaction(unconfirmed(1, 2, stale_at)).await;
        let fresh = store.insert_transaction(unconfirmed(2, 3, Utc::now())).await;

        let mut client = MockChainClient::new();
        client.expect_send_transaction().times(2).returning(|raw| {
            if raw.to_vec() == vec![1u8] {
                SendResult::new(SendResultCode::TransactionAlreadyKnown, "already known")
            } else {
                SendResult::new(SendResultCode::Retryable, "connection refused")
            }
        });
        let resender = resender(client, store.clone());

        let accepted = assert_ok!(resender.resend_unconfirmed().await);
        assert_eq!(accepted, 1);

        let stale = store.find_transaction(stale.id).await.unwrap().unwrap();
        assert!(stale.broadcast_at.unwrap() > stale_at);
        assert_eq!(stale.initial_broadcast_at, Some(stale_at));

        let dropped = store.find_transaction(dropped.id).await.unwrap().unwrap();
        assert_eq!(dropped.broadcast_at, Some(stale_at));

        let fresh_after = store.find_transaction(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh_after.broadcast_at, fresh.broadcast_at);
    }

    #[tokio::test]
    async fn test_nothing_to_resend() {
        let store = Arc::new(MemoryTxStore::new());
        let mut client = MockChainClient::new();
        client.expect_send_transaction().times(0);
        let resender = resender(client, store);

        assert_eq!(assert_ok!(resender.resend_unconfirmed().await), 0);
    }
}
