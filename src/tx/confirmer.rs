//! Confirmer: one pass per new canonical head
//!
//! Each pass fetches receipts, bumps or resubmits stuck attempts, resolves
//! confirmed-missing-receipt txs, unconfirms txs whose block was reorged out,
//! and finally resumes callbacks whose receipts are deep enough.

use super::attempt::AttemptBuilder;
use super::callback::{ResumeCallback, ResumeError};
use super::models::{AttemptState, Receipt, Transaction, TxAttempt};
use crate::chain::{send_with_timeout, ChainClient, Head, SendResultCode};
use crate::config::TxmConfig;
use crate::error::{TxmError, TxmResult};
use crate::store::{TxStore, ERR_COULD_NOT_GET_RECEIPT};

use chrono::Utc;
use ethers::types::{Address, H256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const ERR_REVERTED_ON_CHAIN: &str = "transaction reverted on-chain";

#[derive(Debug, Clone)]
pub struct ConfirmerOptions {
    pub finality_depth: u64,
    pub rpc_batch_size: usize,
    /// Caps rebroadcast candidates per account and pass; zero means unlimited
    pub max_in_flight: u32,
    pub send_timeout: Duration,
    pub process_head_timeout: Duration,
}

impl ConfirmerOptions {
    pub fn from_config(config: &TxmConfig) -> Self {
        Self {
            finality_depth: config.effective_finality_depth(),
            rpc_batch_size: config.rpc_batch_size,
            max_in_flight: config.max_in_flight,
            send_timeout: config.broadcaster.send_timeout(),
            process_head_timeout: Duration::from_millis(config.confirmer.process_head_timeout_ms),
        }
    }
}

pub struct Confirmer {
    chain_id: u64,
    store: Arc<dyn TxStore>,
    client: Arc<dyn ChainClient>,
    builder: Arc<AttemptBuilder>,
    addresses: Vec<Address>,
    resume_callback: Option<Arc<dyn ResumeCallback>>,
    options: ConfirmerOptions,
}

impl Confirmer {
    pub fn new(
        chain_id: u64,
        store: Arc<dyn TxStore>,
        client: Arc<dyn ChainClient>,
        builder: Arc<AttemptBuilder>,
        addresses: Vec<Address>,
        options: ConfirmerOptions,
    ) -> Self {
        Self {
            chain_id,
            store,
            client,
            builder,
            addresses,
            resume_callback: None,
            options,
        }
    }

    pub fn with_resume_callback(mut self, callback: Arc<dyn ResumeCallback>) -> Self {
        self.resume_callback = Some(callback);
        self
    }

    /// Processes the latest head each time it changes; heads that arrive while a
    /// pass is running collapse into the newest one
    pub async fn run(
        &self,
        mut heads: watch::Receiver<Option<Arc<Head>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Confirmer started for chain {}", self.chain_id);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = heads.changed() => {
                    if changed.is_err() {
                        warn!("Head channel closed");
                        break;
                    }
                }
            }

            let head = heads.borrow_and_update().clone();
            let head = match head {
                Some(head) => head,
                None => continue,
            };

            match tokio::time::timeout(self.options.process_head_timeout, self.process_head(&head)).await {
                Ok(Ok(())) => debug!("Processed head {}", head.number),
                Ok(Err(e)) if e.should_alert() => error!("Failed to process head {}: {}", head.number, e),
                Ok(Err(e)) => warn!("Failed to process head {}: {}", head.number, e),
                Err(_) => warn!(
                    "Processing head {} timed out after {:?}",
                    head.number, self.options.process_head_timeout
                ),
            }
        }
        info!("Confirmer stopped");
    }

    pub async fn process_head(&self, head: &Head) -> TxmResult<()> {
        self.store
            .set_broadcast_before_block_num(head.number, self.chain_id)
            .await?;

        self.check_for_receipts(head.number).await?;
        self.rebroadcast_where_necessary(head.number).await;
        self.check_confirmed_missing_receipt().await?;
        self.ensure_confirmed_transactions_in_longest_chain(head).await?;
        self.resume_pending_task_runs(head.number).await
    }

    async fn check_for_receipts(&self, block_num: u64) -> TxmResult<()> {
        let txs = self
            .store
            .find_txs_requiring_receipt_fetch(self.chain_id)
            .await?;

        let sent_at: HashMap<H256, Option<u64>> = txs
            .iter()
            .flat_map(|tx| tx.attempts.iter())
            .map(|a| (a.hash, a.broadcast_before_block_num))
            .collect();
        let hashes: Vec<H256> = txs
            .iter()
            .flat_map(|tx| tx.attempts.iter().map(|a| a.hash))
            .collect();
        if !hashes.is_empty() {
            debug!("Fetching receipts for {} attempts of {} txs", hashes.len(), txs.len());
        }

        for chunk in hashes.chunks(self.options.rpc_batch_size.max(1)) {
            let results = self.client.batch_fetch_receipts(chunk).await?;

            let mut receipts = Vec::new();
            for (hash, result) in chunk.iter().zip(results) {
                match result {
                    Ok(Some(chain_receipt)) => match Receipt::from_chain(&chain_receipt) {
                        Some(receipt) if receipt.tx_hash == *hash => receipts.push(receipt),
                        Some(receipt) => warn!(
                            "Receipt for {:?} reports hash {:?}, ignoring",
                            hash, receipt.tx_hash
                        ),
                        None => debug!("Receipt for {:?} has no block hash yet", hash),
                    },
                    Ok(None) => {}
                    Err(e) => debug!("Failed to fetch receipt for {:?}: {}", hash, e),
                }
            }

            if receipts.is_empty() {
                continue;
            }
            self.store
                .save_fetched_receipts(&receipts, self.chain_id)
                .await?;
            for receipt in &receipts {
                let blocks = sent_at
                    .get(&receipt.tx_hash)
                    .copied()
                    .flatten()
                    .map(|sent| receipt.block_number.saturating_sub(sent));
                crate::metrics::record_confirmed(self.chain_id, blocks);
                info!(
                    "Receipt for {:?} in block {} ({:?}){}",
                    receipt.tx_hash,
                    receipt.block_number,
                    receipt.block_hash,
                    if receipt.is_reverted() { ", reverted" } else { "" }
                );
            }
        }

        let marked = self
            .store
            .mark_all_confirmed_missing_receipt(self.chain_id)
            .await?;
        if marked > 0 {
            info!("Marked {} txs as confirmed_missing_receipt", marked);
        }

        let errored = self
            .store
            .mark_old_txs_missing_receipt_as_errored(block_num, self.options.finality_depth, self.chain_id)
            .await?;
        for tx in errored {
            error!(
                "Tx {} from {:?} (nonce {:?}) never produced a receipt within {} blocks of finality. \
                 This usually means the account is used by another wallet; the tx is now fatally errored",
                tx.id, tx.from_address, tx.sequence, self.options.finality_depth
            );
            crate::metrics::record_fatal(self.chain_id, "missing_receipt");
            self.resume_errored_callback(&tx).await;
        }
        Ok(())
    }

    async fn resume_errored_callback(&self, tx: &Transaction) {
        let (run_id, callback) = match (tx.pipeline_task_run_id, &self.resume_callback) {
            (Some(run_id), Some(callback)) if tx.signal_callback && !tx.callback_completed => {
                (run_id, callback)
            }
            _ => return,
        };

        match callback
            .resume(run_id, None, Some(ERR_COULD_NOT_GET_RECEIPT.to_string()))
            .await
        {
            Ok(()) | Err(ResumeError::NotFound(_)) => {
                if let Err(e) = self
                    .store
                    .update_tx_callback_completed(run_id, self.chain_id)
                    .await
                {
                    warn!("Failed to mark callback completed for tx {}: {}", tx.id, e);
                }
            }
            Err(e) => error!("Failed to resume run {} for errored tx {}: {}", run_id, tx.id, e),
        }
    }

    /// Accounts fail independently; one account's error is logged and the rest proceed
    async fn rebroadcast_where_necessary(&self, block_num: u64) {
        for &address in &self.addresses {
            if let Err(e) = self.rebroadcast_for(address, block_num).await {
                if e.should_alert() {
                    error!("Rebroadcast for {:?} failed: {}", address, e);
                } else {
                    warn!("Rebroadcast for {:?} failed: {}", address, e);
                }
            }
        }
    }

    async fn rebroadcast_for(&self, address: Address, block_num: u64) -> TxmResult<()> {
        self.handle_any_in_progress_attempts(address).await?;

        let fee = self.builder.estimator().config();
        let mut candidates = self
            .store
            .find_txs_requiring_resubmission_due_to_insufficient_funds(address, self.chain_id)
            .await?;
        candidates.extend(
            self.store
                .find_txs_requiring_gas_bump(
                    address,
                    block_num,
                    fee.bump_threshold,
                    fee.bump_tx_depth,
                    self.chain_id,
                )
                .await?,
        );
        candidates.sort_by_key(|tx| (tx.sequence, tx.id));
        candidates.dedup_by_key(|tx| tx.id);
        if self.options.max_in_flight > 0 {
            candidates.truncate(self.options.max_in_flight as usize);
        }
        if !candidates.is_empty() {
            debug!("Rebroadcasting {} txs for {:?}", candidates.len(), address);
        }

        for tx in candidates {
            let mut attempt = self.attempt_for_rebroadcast(&tx).await?;
            self.store.save_in_progress_attempt(&mut attempt).await?;
            self.handle_in_progress_attempt(&tx, attempt).await?;
        }
        Ok(())
    }

    /// Attempts left in progress by an interrupted pass
    async fn handle_any_in_progress_attempts(&self, address: Address) -> TxmResult<()> {
        for (tx, attempt) in self
            .store
            .get_in_progress_attempts(address, self.chain_id)
            .await?
        {
            self.handle_in_progress_attempt(&tx, attempt).await?;
        }
        Ok(())
    }

    async fn attempt_for_rebroadcast(&self, tx: &Transaction) -> TxmResult<TxAttempt> {
        let previous = tx.highest_priced_attempt().ok_or_else(|| {
            TxmError::InvariantViolation(format!("unconfirmed tx {} has no attempts", tx.id))
        })?;

        if previous.state == AttemptState::InsufficientFunds {
            debug!(
                "Resubmitting tx {} (nonce {:?}) at {} after running out of funds",
                tx.id, tx.sequence, previous.fee
            );
            let mut attempt = previous.clone();
            attempt.state = AttemptState::InProgress;
            return Ok(attempt);
        }

        match self.builder.new_bumped_attempt(tx, previous).await {
            Ok(bumped) => {
                crate::metrics::record_gas_bump(self.chain_id);
                info!(
                    "Bumping tx {} (nonce {:?}) from {} to {}",
                    tx.id, tx.sequence, previous.fee, bumped.fee
                );
                Ok(bumped)
            }
            Err(e @ TxmError::FeeBumpExceedsLimit { .. }) => {
                crate::metrics::record_gas_bump_exceeds_limit(self.chain_id);
                warn!(
                    "Tx {} (nonce {:?}) cannot be bumped further, resending attempt {:?}: {}",
                    tx.id, tx.sequence, previous.hash, e
                );
                let mut attempt = previous.clone();
                attempt.state = AttemptState::InProgress;
                attempt.broadcast_before_block_num = None;
                Ok(attempt)
            }
            Err(e @ TxmError::FeeBumpConfig { .. }) => {
                error!(
                    "Tx {} from {:?} (nonce {:?}) is stuck and the bump settings cannot raise its fee: {}",
                    tx.id, tx.from_address, tx.sequence, e
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Sends an in-progress attempt and records the outcome. Never touches nonces.
    async fn handle_in_progress_attempt(&self, tx: &Transaction, mut attempt: TxAttempt) -> TxmResult<()> {
        if attempt.state != AttemptState::InProgress {
            return Err(TxmError::InvariantViolation(format!(
                "attempt {} of tx {} must be in_progress, found {}",
                attempt.id, tx.id, attempt.state
            )));
        }

        loop {
            let now = Utc::now();
            let result =
                send_with_timeout(self.client.as_ref(), &attempt.signed_raw_tx, self.options.send_timeout).await;

            match result.code {
                SendResultCode::Successful | SendResultCode::TransactionAlreadyKnown => {
                    debug!("Rebroadcast tx {} attempt {:?} ({})", tx.id, attempt.hash, result.code);
                    return self.store.save_sent_attempt(&mut attempt, now).await;
                }
                SendResultCode::NonceTooLow => {
                    debug!(
                        "Nonce {:?} of tx {} already used on chain; awaiting a receipt",
                        tx.sequence, tx.id
                    );
                    return self
                        .store
                        .save_confirmed_missing_receipt_attempt(&mut attempt, now)
                        .await;
                }
                SendResultCode::Underpriced => {
                    warn!(
                        "Node rejected bumped attempt {:?} of tx {} as underpriced at {}; the node's minimum may have changed: {}",
                        attempt.hash, tx.id, attempt.fee, result.message
                    );
                    let mut replacement = self.builder.new_bumped_attempt(tx, &attempt).await?;
                    crate::metrics::record_gas_bump(self.chain_id);
                    self.store
                        .save_replacement_in_progress_attempt(&attempt, &mut replacement)
                        .await?;
                    attempt = replacement;
                }
                SendResultCode::ExceedsMaxFee => {
                    // Another node may have accepted it already
                    error!(
                        "Node rejected attempt {:?} of tx {} as above its fee cap; check the RPC node's fee cap: {}",
                        attempt.hash, tx.id, result.message
                    );
                    return self.store.save_sent_attempt(&mut attempt, now).await;
                }
                SendResultCode::Fatal => {
                    error!(
                        "Fatal error re-sending attempt {:?} of tx {} (nonce {:?}); operator action required: {}",
                        attempt.hash, tx.id, tx.sequence, result.message
                    );
                    return self.discard_in_progress_attempt(tx, &mut attempt, now).await;
                }
                SendResultCode::InsufficientFunds => {
                    error!(
                        "Account {:?} is out of funds to rebroadcast tx {} (nonce {:?}, attempt {:?}, {}): {}",
                        tx.from_address, tx.id, tx.sequence, attempt.hash, attempt.fee, result.message
                    );
                    return self
                        .store
                        .save_insufficient_funds_attempt(&mut attempt, now)
                        .await;
                }
                SendResultCode::Retryable => {
                    return Err(TxmError::SendFailed {
                        tx_id: tx.id,
                        address: tx.from_address,
                        nonce: tx.sequence.unwrap_or_default(),
                        hash: attempt.hash,
                        message: result.message,
                    });
                }
            }
        }
    }

    /// Drops a rejected new attempt; an attempt that was already on the network before is kept as sent
    async fn discard_in_progress_attempt(
        &self,
        tx: &Transaction,
        attempt: &mut TxAttempt,
        now: chrono::DateTime<Utc>,
    ) -> TxmResult<()> {
        let has_others = tx.attempts.iter().any(|a| a.id != attempt.id);
        if has_others {
            self.store.delete_in_progress_attempt(attempt).await
        } else {
            let at = tx.broadcast_at.unwrap_or(now);
            self.store.save_sent_attempt(attempt, at).await
        }
    }

    async fn check_confirmed_missing_receipt(&self) -> TxmResult<()> {
        let txs = self
            .store
            .find_confirmed_missing_receipt_txs(self.chain_id)
            .await?;
        if txs.is_empty() {
            return Ok(());
        }

        let mut still_used = Vec::new();
        let mut unconfirm = Vec::new();
        for tx in &txs {
            let attempt = match tx.highest_priced_attempt() {
                Some(attempt) => attempt,
                None => continue,
            };
            let result =
                send_with_timeout(self.client.as_ref(), &attempt.signed_raw_tx, self.options.send_timeout).await;
            match result.code {
                SendResultCode::NonceTooLow | SendResultCode::TransactionAlreadyKnown => {
                    still_used.push(tx.id)
                }
                SendResultCode::Retryable => debug!(
                    "Resend of confirmed_missing_receipt tx {} inconclusive: {}",
                    tx.id, result.message
                ),
                code => {
                    info!(
                        "Confirmed_missing_receipt tx {} (nonce {:?}) was accepted again ({}); returning it to unconfirmed",
                        tx.id, tx.sequence, code
                    );
                    unconfirm.push(tx.id);
                }
            }
        }

        if !still_used.is_empty() {
            self.store.update_broadcast_ats(Utc::now(), &still_used).await?;
        }
        if !unconfirm.is_empty() {
            self.store.update_txs_unconfirmed(&unconfirm).await?;
        }
        Ok(())
    }

    /// Unconfirms txs whose receipt block fell off the canonical chain. Receipts older
    /// than the tracked chain are final; ones above the head wait for it to catch up.
    async fn ensure_confirmed_transactions_in_longest_chain(&self, head: &Head) -> TxmResult<()> {
        let low = head.earliest_in_chain().number;
        let txs = self
            .store
            .find_txs_confirmed_in_block_range(head.number, low, self.chain_id)
            .await?;

        let mut reorged = Vec::new();
        for tx in txs {
            let orphaned = tx.attempts.iter().flat_map(|a| a.receipts.iter()).any(|r| {
                r.block_number >= low
                    && r.block_number <= head.number
                    && !head.is_in_chain(r.block_hash, r.block_number)
            });
            if orphaned {
                reorged.push(tx);
            }
        }

        for tx in &reorged {
            let attempt = tx.highest_priced_attempt().ok_or_else(|| {
                TxmError::InvariantViolation(format!("confirmed tx {} has no attempts", tx.id))
            })?;
            warn!(
                "Tx {} (nonce {:?}, attempt {:?}) was confirmed in a block that is no longer canonical; rebroadcasting",
                tx.id, tx.sequence, attempt.hash
            );
            self.store.mark_for_rebroadcast(tx, attempt).await?;
            crate::metrics::record_reorg(self.chain_id);
        }

        if !reorged.is_empty() {
            for &address in &self.addresses {
                self.handle_any_in_progress_attempts(address).await?;
            }
        }
        Ok(())
    }

    async fn resume_pending_task_runs(&self, block_num: u64) -> TxmResult<()> {
        let callback = match &self.resume_callback {
            Some(callback) => callback,
            None => return Ok(()),
        };

        let pending = self
            .store
            .find_txs_pending_callback(block_num, self.chain_id)
            .await?;
        for run in pending {
            let error = run
                .receipt
                .is_reverted()
                .then(|| ERR_REVERTED_ON_CHAIN.to_string());
            match callback
                .resume(run.pipeline_task_run_id, Some(run.receipt.raw.clone()), error)
                .await
            {
                Ok(()) => {}
                Err(ResumeError::NotFound(_)) => {
                    debug!("Callback for tx {} missing or already resumed", run.tx_id);
                }
                Err(e) => {
                    warn!(
                        "Failed to resume run {} for tx {}, retrying next head: {}",
                        run.pipeline_task_run_id, run.tx_id, e
                    );
                    continue;
                }
            }
            self.store
                .update_tx_callback_completed(run.pipeline_task_run_id, self.chain_id)
                .await?;
            crate::metrics::record_callback_resumed(self.chain_id);
            debug!("Resumed run {} for tx {}", run.pipeline_task_run_id, run.tx_id);
        }
        Ok(())
    }
}
