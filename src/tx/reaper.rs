//! Reaper: deletes finished txs once they are old and final

use crate::chain::Head;
use crate::error::TxmResult;
use crate::store::TxStore;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Reaper {
    chain_id: u64,
    store: Arc<dyn TxStore>,
    heads: watch::Receiver<Option<Arc<Head>>>,
    finality_depth: u64,
    interval: Duration,
    threshold: Duration,
}

impl Reaper {
    pub fn new(
        chain_id: u64,
        store: Arc<dyn TxStore>,
        heads: watch::Receiver<Option<Arc<Head>>>,
        finality_depth: u64,
        interval: Duration,
        threshold: Duration,
    ) -> Self {
        Self {
            chain_id,
            store,
            heads,
            finality_depth,
            interval,
            threshold,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Reaper started for chain {} (every {:?}, threshold {:?})",
            self.chain_id, self.interval, self.threshold
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let latest = self.heads.borrow().as_ref().map(|head| head.number);
            match latest {
                Some(number) => {
                    if let Err(e) = self.reap(number).await {
                        warn!("Failed to reap old txs: {}", e);
                    }
                }
                None => debug!("No head yet, skipping reap"),
            }
        }
        info!("Reaper stopped");
    }

    /// Deletes txs created before the threshold whose receipts are below
    /// `head - finality_depth`, plus fatally errored ones
    pub async fn reap(&self, head_number: u64) -> TxmResult<u64> {
        let min_block_to_keep = head_number.saturating_sub(self.finality_depth);
        let older_than = Utc::now()
            - chrono::Duration::from_std(self.threshold).unwrap_or_else(|_| chrono::Duration::zero());

        let deleted = self
            .store
            .reap_txs(min_block_to_keep, older_than, self.chain_id)
            .await?;
        if deleted > 0 {
            info!(
                "Reaped {} txs older than {} (keeping blocks >= {})",
                deleted, older_than, min_block_to_keep
            );
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::models::{
        AttemptState, Fee, NewTransaction, Receipt, Transaction, TxAttempt, TxState, TxStrategy,
    };
    use crate::store::MemoryTxStore;
    use chrono::Duration as ChronoDuration;
    use ethers::types::{Address, Bytes, H256, U256};

    const CHAIN_ID: u64 = 1337;

    fn finished(state: TxState, receipt_block: Option<u64>, age: ChronoDuration) -> Transaction {
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
        tx.state = state;
        tx.created_at = Utc::now() - age;
        if let Some(block) = receipt_block {
            tx.attempts = vec![TxAttempt {
                id: 0,
                tx_id: 0,
                fee: Fee::Legacy {
                    gas_price: U256::from(1),
                },
                chain_specific_gas_limit: 21_000,
                signed_raw_tx: Bytes::default(),
                hash: H256::from_low_u64_be(block),
                state: AttemptState::Broadcast,
                broadcast_before_block_num: Some(block),
                created_at: tx.created_at,
                receipts: vec![Receipt {
                    id: 0,
                    tx_hash: H256::from_low_u64_be(block),
                    block_hash: H256::repeat_byte(block as u8),
                    block_number: block,
                    transaction_index: 0,
                    status: Some(1),
                    raw: serde_json::Value::Null,
                }],
            }];
        }
        tx
    }

    #[tokio::test]
    async fn test_reaps_only_old_final_txs() {
        let store = Arc::new(MemoryTxStore::new());
        let day = ChronoDuration::days(1);
        let final_confirmed = store.insert_transaction(finished(TxState::Confirmed, Some(10), day)).await;
        let recent_block = store.insert_transaction(finished(TxState::Confirmed, Some(95), day)).await;
        let young = store
            .insert_transaction(finished(TxState::Confirmed, Some(10), ChronoDuration::minutes(1)))
            .await;
        let fatal = store.insert_transaction(finished(TxState::FatalError, None, day)).await;
        let pending = store.insert_transaction(finished(TxState::Unconfirmed, None, day)).await;

        let (_tx, heads) = watch::channel(None);
        let reaper = Reaper::new(
            CHAIN_ID,
            store.clone(),
            heads,
            10,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );

        assert_eq!(reaper.reap(100).await.unwrap(), 2);

        assert!(store.find_transaction(final_confirmed.id).await.unwrap().is_none());
        assert!(store.find_transaction(fatal.id).await.unwrap().is_none());
        for kept in [recent_block, young, pending] {
            assert!(store.find_transaction(kept.id).await.unwrap().is_some());
        }
    }
}
