//! In-memory transaction store
//!
//! Same guarded-transition semantics as the Postgres store. Each call holds one
//! mutex for its whole duration, which makes every operation atomic.

use super::{TxStore, ERR_COULD_NOT_GET_RECEIPT};
use crate::error::{TxmError, TxmResult};
use crate::tx::models::{
    sort_attempts_by_fee, AttemptState, NewTransaction, PendingCallback, Receipt, Transaction,
    TransactionStats, TxAttempt, TxState,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    next_tx_id: i64,
    next_attempt_id: i64,
    next_receipt_id: i64,
    txs: BTreeMap<i64, Transaction>,
}

impl Inner {
    fn next_tx_id(&mut self) -> i64 {
        self.next_tx_id += 1;
        self.next_tx_id
    }

    fn next_attempt_id(&mut self) -> i64 {
        self.next_attempt_id += 1;
        self.next_attempt_id
    }

    fn next_receipt_id(&mut self) -> i64 {
        self.next_receipt_id += 1;
        self.next_receipt_id
    }

    fn tx_mut(&mut self, id: i64) -> TxmResult<&mut Transaction> {
        self.txs
            .get_mut(&id)
            .ok_or(TxmError::TransactionNotFound { tx_id: id })
    }

    fn attempt_mut(&mut self, tx_id: i64, attempt_id: i64) -> TxmResult<(&mut Transaction, usize)> {
        let tx = self.tx_mut(tx_id)?;
        let idx = tx
            .attempts
            .iter()
            .position(|a| a.id == attempt_id)
            .ok_or_else(|| TxmError::Store(format!("attempt {} of tx {} not found", attempt_id, tx_id)))?;
        Ok((tx, idx))
    }

    fn account_txs(&self, from: Address, chain_id: u64) -> impl Iterator<Item = &Transaction> {
        self.txs
            .values()
            .filter(move |tx| tx.from_address == from && tx.chain_id == chain_id)
    }
}

fn sorted(tx: &Transaction) -> Transaction {
    let mut tx = tx.clone();
    tx.sort_attempts();
    tx
}

fn by_sequence(mut txs: Vec<Transaction>) -> Vec<Transaction> {
    txs.sort_by_key(|tx| (tx.sequence, tx.id));
    txs
}

fn expect_state(tx: &Transaction, allowed: &[TxState]) -> TxmResult<()> {
    if allowed.contains(&tx.state) {
        Ok(())
    } else {
        Err(TxmError::InvalidStateTransition {
            tx_id: tx.id,
            expected: allowed
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("|"),
            found: tx.state.to_string(),
        })
    }
}

fn bump_broadcast_at(tx: &mut Transaction, at: DateTime<Utc>) {
    if tx.broadcast_at.map_or(true, |current| current < at) {
        tx.broadcast_at = Some(at);
    }
    if tx.initial_broadcast_at.is_none() {
        tx.initial_broadcast_at = Some(at);
    }
}

#[derive(Default)]
pub struct MemoryTxStore {
    inner: Mutex<Inner>,
}

impl MemoryTxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fully formed tx as-is, assigning ids; used to seed state
    pub async fn insert_transaction(&self, mut tx: Transaction) -> Transaction {
        let mut inner = self.inner.lock().await;
        tx.id = inner.next_tx_id();
        for attempt in tx.attempts.iter_mut() {
            attempt.id = inner.next_attempt_id();
            attempt.tx_id = tx.id;
            for receipt in attempt.receipts.iter_mut() {
                receipt.id = inner.next_receipt_id();
            }
        }
        tx.sort_attempts();
        inner.txs.insert(tx.id, tx.clone());
        tx
    }
}

#[async_trait]
impl TxStore for MemoryTxStore {
    async fn health_check(&self) -> TxmResult<()> {
        Ok(())
    }

    async fn insert_unstarted(&self, chain_id: u64, request: &NewTransaction) -> TxmResult<Transaction> {
        let mut inner = self.inner.lock().await;

        if let Some((subject, keep)) = request.strategy.prune_to() {
            let mut queued: Vec<i64> = inner
                .txs
                .values()
                .filter(|tx| {
                    tx.chain_id == chain_id
                        && tx.state == TxState::Unstarted
                        && tx.subject == Some(subject)
                })
                .map(|tx| tx.id)
                .collect();
            queued.sort_unstable_by(|a, b| b.cmp(a));
            let pruned: Vec<i64> = queued.into_iter().skip(keep as usize).collect();
            for id in &pruned {
                inner.txs.remove(id);
            }
            if !pruned.is_empty() {
                debug!("Dropped {} oldest unstarted txs for subject {}", pruned.len(), subject);
            }
        }

        let mut tx = Transaction::unstarted(chain_id, request);
        tx.id = inner.next_tx_id();
        inner.txs.insert(tx.id, tx.clone());
        Ok(tx)
    }

    async fn count_unstarted_transactions(&self, from: Address, chain_id: u64) -> TxmResult<u32> {
        let inner = self.inner.lock().await;
        let count = inner
            .account_txs(from, chain_id)
            .filter(|tx| tx.state == TxState::Unstarted)
            .count();
        Ok(count as u32)
    }

    async fn count_unconfirmed_transactions(&self, from: Address, chain_id: u64) -> TxmResult<u32> {
        let inner = self.inner.lock().await;
        let count = inner
            .account_txs(from, chain_id)
            .filter(|tx| tx.state == TxState::Unconfirmed)
            .count();
        Ok(count as u32)
    }

    async fn find_transaction(&self, id: i64) -> TxmResult<Option<Transaction>> {
        let inner = self.inner.lock().await;
        let tx = inner.txs.get(&id).map(sorted);
        Ok(tx)
    }

    async fn stats(&self, chain_id: u64) -> TxmResult<TransactionStats> {
        let inner = self.inner.lock().await;
        let mut stats = TransactionStats::default();
        for tx in inner.txs.values().filter(|tx| tx.chain_id == chain_id) {
            stats.record(tx.state, 1);
        }
        Ok(stats)
    }

    async fn find_highest_sequence(&self, from: Address, chain_id: u64) -> TxmResult<Option<u64>> {
        let inner = self.inner.lock().await;
        let highest = inner
            .account_txs(from, chain_id)
            .filter_map(|tx| tx.sequence)
            .max();
        Ok(highest)
    }

    async fn has_in_progress_transaction(&self, from: Address, chain_id: u64) -> TxmResult<bool> {
        let inner = self.inner.lock().await;
        let found = inner
            .account_txs(from, chain_id)
            .any(|tx| tx.state == TxState::InProgress);
        Ok(found)
    }

    async fn find_in_progress(&self, from: Address, chain_id: u64) -> TxmResult<Option<Transaction>> {
        let inner = self.inner.lock().await;
        let mut in_progress = inner
            .account_txs(from, chain_id)
            .filter(|tx| tx.state == TxState::InProgress);
        let tx = match in_progress.next() {
            Some(tx) => sorted(tx),
            None => return Ok(None),
        };
        if in_progress.next().is_some() {
            return Err(TxmError::InvariantViolation(format!(
                "more than one in-progress transaction for {:?}",
                from
            )));
        }
        let unsent = tx
            .attempts
            .iter()
            .filter(|a| a.state == AttemptState::InProgress)
            .count();
        if tx.attempts.len() != 1 || unsent != 1 {
            return Err(TxmError::InvariantViolation(format!(
                "in-progress tx {} must have exactly one unsent attempt, found {} attempts ({} in progress)",
                tx.id,
                tx.attempts.len(),
                unsent
            )));
        }
        Ok(Some(tx))
    }

    async fn find_oldest_unstarted(&self, from: Address, chain_id: u64) -> TxmResult<Option<Transaction>> {
        let inner = self.inner.lock().await;
        let oldest = inner
            .account_txs(from, chain_id)
            .filter(|tx| tx.state == TxState::Unstarted)
            .min_by(|a, b| {
                a.value
                    .cmp(&b.value)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned();
        Ok(oldest)
    }

    async fn move_unstarted_to_in_progress(
        &self,
        tx: &mut Transaction,
        attempt: &mut TxAttempt,
    ) -> TxmResult<()> {
        let mut inner = self.inner.lock().await;

        let nonce = tx
            .sequence
            .ok_or_else(|| TxmError::Internal(format!("tx {} has no nonce assigned", tx.id)))?;
        if attempt.state != AttemptState::InProgress {
            return Err(TxmError::Internal(format!(
                "attempt for tx {} must be in_progress, got {}",
                tx.id, attempt.state
            )));
        }

        let stored = inner
            .txs
            .get(&tx.id)
            .ok_or(TxmError::TxRemoved { tx_id: tx.id })?;
        expect_state(stored, &[TxState::Unstarted])?;

        for other in inner.account_txs(tx.from_address, tx.chain_id) {
            if other.id == tx.id {
                continue;
            }
            if other.state == TxState::InProgress {
                return Err(TxmError::InProgressConflict {
                    address: tx.from_address,
                    chain_id: tx.chain_id,
                });
            }
            if other.sequence == Some(nonce) {
                return Err(TxmError::NonceConflict {
                    address: tx.from_address,
                    nonce,
                });
            }
        }

        attempt.id = inner.next_attempt_id();
        attempt.tx_id = tx.id;
        attempt.created_at = Utc::now();

        let stored = inner.tx_mut(tx.id)?;
        stored.state = TxState::InProgress;
        stored.sequence = Some(nonce);
        stored.attempts = vec![attempt.clone()];

        tx.state = TxState::InProgress;
        tx.attempts = vec![attempt.clone()];
        Ok(())
    }

    async fn save_replacement_in_progress_attempt(
        &self,
        old: &TxAttempt,
        new: &mut TxAttempt,
    ) -> TxmResult<()> {
        if old.state != AttemptState::InProgress || new.state != AttemptState::InProgress {
            return Err(TxmError::Internal(
                "replacement requires in_progress attempts".to_string(),
            ));
        }
        if old.id == 0 {
            return Err(TxmError::Internal(
                "attempt to replace has not been saved".to_string(),
            ));
        }

        let mut inner = self.inner.lock().await;
        let new_id = inner.next_attempt_id();
        let (tx, idx) = inner.attempt_mut(old.tx_id, old.id)?;
        if tx.attempts[idx].state != AttemptState::InProgress {
            return Err(TxmError::Store(format!(
                "attempt {} is no longer in progress",
                old.id
            )));
        }
        tx.attempts.remove(idx);

        new.id = new_id;
        new.tx_id = old.tx_id;
        new.created_at = Utc::now();
        tx.attempts.push(new.clone());
        sort_attempts_by_fee(&mut tx.attempts);
        Ok(())
    }

    async fn move_in_progress_to_broadcast(
        &self,
        tx: &mut Transaction,
        attempt: &mut TxAttempt,
        increment_nonce: &(dyn Fn() + Send + Sync),
    ) -> TxmResult<()> {
        let (broadcast_at, initial_broadcast_at) = match (tx.broadcast_at, tx.initial_broadcast_at) {
            (Some(b), Some(i)) => (b, i),
            _ => {
                return Err(TxmError::Internal(format!(
                    "tx {} must have broadcast times set before it is marked broadcast",
                    tx.id
                )))
            }
        };

        let mut inner = self.inner.lock().await;
        let (stored, idx) = inner.attempt_mut(tx.id, attempt.id)?;
        expect_state(stored, &[TxState::InProgress])?;
        if stored.attempts[idx].state != AttemptState::InProgress {
            return Err(TxmError::Store(format!(
                "attempt {} is not in progress",
                attempt.id
            )));
        }

        stored.state = TxState::Unconfirmed;
        stored.error = None;
        stored.broadcast_at = Some(broadcast_at);
        stored.initial_broadcast_at = Some(initial_broadcast_at);
        stored.attempts[idx].state = AttemptState::Broadcast;

        increment_nonce();

        attempt.state = AttemptState::Broadcast;
        tx.state = TxState::Unconfirmed;
        tx.error = None;
        for a in tx.attempts.iter_mut().filter(|a| a.id == attempt.id) {
            a.state = AttemptState::Broadcast;
        }
        Ok(())
    }

    async fn update_tx_fatal_error(&self, tx: &mut Transaction) -> TxmResult<()> {
        if tx.error.is_none() {
            return Err(TxmError::Internal(format!(
                "tx {} cannot be marked fatal without an error",
                tx.id
            )));
        }

        let mut inner = self.inner.lock().await;
        let stored = inner.tx_mut(tx.id)?;
        expect_state(stored, &[TxState::InProgress, TxState::Unstarted])?;

        stored.state = TxState::FatalError;
        stored.sequence = None;
        stored.broadcast_at = None;
        stored.initial_broadcast_at = None;
        stored.error = tx.error.clone();
        stored.attempts.clear();

        tx.state = TxState::FatalError;
        tx.sequence = None;
        tx.broadcast_at = None;
        tx.initial_broadcast_at = None;
        tx.attempts.clear();
        Ok(())
    }

    async fn set_broadcast_before_block_num(&self, block_num: u64, chain_id: u64) -> TxmResult<()> {
        let mut inner = self.inner.lock().await;
        for tx in inner.txs.values_mut().filter(|tx| tx.chain_id == chain_id) {
            for attempt in tx.attempts.iter_mut() {
                if attempt.state == AttemptState::Broadcast
                    && attempt.broadcast_before_block_num.is_none()
                {
                    attempt.broadcast_before_block_num = Some(block_num);
                }
            }
        }
        Ok(())
    }

    async fn find_txs_requiring_receipt_fetch(&self, chain_id: u64) -> TxmResult<Vec<Transaction>> {
        let inner = self.inner.lock().await;
        let txs = inner
            .txs
            .values()
            .filter(|tx| {
                tx.chain_id == chain_id
                    && matches!(
                        tx.state,
                        TxState::Unconfirmed | TxState::ConfirmedMissingReceipt
                    )
            })
            .filter_map(|tx| {
                let mut tx = sorted(tx);
                tx.attempts
                    .retain(|a| a.state != AttemptState::InsufficientFunds);
                (!tx.attempts.is_empty()).then_some(tx)
            })
            .collect();
        Ok(by_sequence(txs))
    }

    async fn save_fetched_receipts(&self, receipts: &[Receipt], chain_id: u64) -> TxmResult<()> {
        let mut inner = self.inner.lock().await;

        for receipt in receipts {
            let location = inner
                .txs
                .values()
                .filter(|tx| tx.chain_id == chain_id)
                .find_map(|tx| {
                    tx.attempts
                        .iter()
                        .position(|a| a.hash == receipt.tx_hash)
                        .map(|idx| (tx.id, idx))
                });
            let (tx_id, idx) = match location {
                Some(found) => found,
                None => {
                    warn!("No attempt found for receipt {:?}", receipt.tx_hash);
                    continue;
                }
            };

            let receipt_id = inner.next_receipt_id();
            let tx = inner.tx_mut(tx_id)?;
            let attempt = &mut tx.attempts[idx];
            match attempt
                .receipts
                .iter_mut()
                .find(|r| r.block_hash == receipt.block_hash)
            {
                Some(existing) => {
                    let id = existing.id;
                    *existing = receipt.clone();
                    existing.id = id;
                }
                None => {
                    let mut stored = receipt.clone();
                    stored.id = receipt_id;
                    attempt.receipts.push(stored);
                }
            }
            attempt.state = AttemptState::Broadcast;
            if attempt.broadcast_before_block_num.is_none() {
                attempt.broadcast_before_block_num = Some(receipt.block_number);
            }

            if matches!(
                tx.state,
                TxState::Unconfirmed | TxState::ConfirmedMissingReceipt | TxState::Confirmed
            ) {
                tx.state = TxState::Confirmed;
            }
        }
        Ok(())
    }

    async fn mark_all_confirmed_missing_receipt(&self, chain_id: u64) -> TxmResult<u64> {
        let mut inner = self.inner.lock().await;

        let mut max_confirmed: HashMap<Address, u64> = HashMap::new();
        for tx in inner
            .txs
            .values()
            .filter(|tx| tx.chain_id == chain_id && tx.state == TxState::Confirmed)
        {
            if let Some(nonce) = tx.sequence {
                let entry = max_confirmed.entry(tx.from_address).or_insert(nonce);
                *entry = (*entry).max(nonce);
            }
        }

        let mut updated = 0;
        for tx in inner
            .txs
            .values_mut()
            .filter(|tx| tx.chain_id == chain_id && tx.state == TxState::Unconfirmed)
        {
            let below_confirmed = match (tx.sequence, max_confirmed.get(&tx.from_address)) {
                (Some(nonce), Some(max)) => nonce < *max,
                _ => false,
            };
            if below_confirmed {
                tx.state = TxState::ConfirmedMissingReceipt;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn mark_old_txs_missing_receipt_as_errored(
        &self,
        block_num: u64,
        finality_depth: u64,
        chain_id: u64,
    ) -> TxmResult<Vec<Transaction>> {
        let cutoff = block_num as i64 - finality_depth as i64;
        if cutoff <= 0 {
            return Ok(Vec::new());
        }
        let cutoff = cutoff as u64;

        let mut inner = self.inner.lock().await;
        let mut errored = Vec::new();
        for tx in inner.txs.values_mut().filter(|tx| {
            tx.chain_id == chain_id && tx.state == TxState::ConfirmedMissingReceipt
        }) {
            let newest = tx
                .attempts
                .iter()
                .filter_map(|a| a.broadcast_before_block_num)
                .max();
            if matches!(newest, Some(n) if n < cutoff) {
                errored.push(sorted(tx));
                tx.state = TxState::FatalError;
                tx.sequence = None;
                tx.broadcast_at = None;
                tx.initial_broadcast_at = None;
                tx.error = Some(ERR_COULD_NOT_GET_RECEIPT.to_string());
            }
        }
        Ok(by_sequence(errored))
    }

    async fn find_txs_requiring_gas_bump(
        &self,
        from: Address,
        block_num: u64,
        threshold: u64,
        depth: u32,
        chain_id: u64,
    ) -> TxmResult<Vec<Transaction>> {
        if threshold == 0 {
            return Ok(Vec::new());
        }
        let cutoff = block_num as i64 - threshold as i64;

        let inner = self.inner.lock().await;
        let mut unconfirmed: Vec<Transaction> = inner
            .account_txs(from, chain_id)
            .filter(|tx| tx.state == TxState::Unconfirmed)
            .map(sorted)
            .collect();
        unconfirmed.sort_by_key(|tx| (tx.sequence, tx.id));
        if depth > 0 {
            unconfirmed.truncate(depth as usize);
        }

        Ok(unconfirmed
            .into_iter()
            .filter(|tx| {
                tx.attempts.iter().all(|a| {
                    a.state == AttemptState::Broadcast
                        && matches!(a.broadcast_before_block_num, Some(n) if (n as i64) <= cutoff)
                })
            })
            .collect())
    }

    async fn find_txs_requiring_resubmission_due_to_insufficient_funds(
        &self,
        from: Address,
        chain_id: u64,
    ) -> TxmResult<Vec<Transaction>> {
        let inner = self.inner.lock().await;
        let txs = inner
            .account_txs(from, chain_id)
            .filter(|tx| {
                tx.state == TxState::Unconfirmed
                    && tx
                        .attempts
                        .iter()
                        .any(|a| a.state == AttemptState::InsufficientFunds)
            })
            .map(sorted)
            .collect();
        Ok(by_sequence(txs))
    }

    async fn get_in_progress_attempts(
        &self,
        from: Address,
        chain_id: u64,
    ) -> TxmResult<Vec<(Transaction, TxAttempt)>> {
        let inner = self.inner.lock().await;
        let txs: Vec<Transaction> = inner
            .account_txs(from, chain_id)
            .filter(|tx| {
                matches!(
                    tx.state,
                    TxState::Unconfirmed | TxState::ConfirmedMissingReceipt
                )
            })
            .map(sorted)
            .collect();

        Ok(by_sequence(txs)
            .into_iter()
            .filter_map(|tx| {
                let attempt = tx
                    .attempts
                    .iter()
                    .find(|a| a.state == AttemptState::InProgress)
                    .cloned()?;
                Some((tx, attempt))
            })
            .collect())
    }

    async fn save_in_progress_attempt(&self, attempt: &mut TxAttempt) -> TxmResult<()> {
        if attempt.state != AttemptState::InProgress {
            return Err(TxmError::Internal(
                "save_in_progress_attempt requires an in_progress attempt".to_string(),
            ));
        }

        let mut inner = self.inner.lock().await;
        let new_id = inner.next_attempt_id();
        let tx = inner.tx_mut(attempt.tx_id)?;
        expect_state(tx, &[TxState::Unconfirmed, TxState::ConfirmedMissingReceipt])?;

        let other_in_progress = tx
            .attempts
            .iter()
            .any(|a| a.id != attempt.id && a.state == AttemptState::InProgress);
        if other_in_progress {
            return Err(TxmError::InvariantViolation(format!(
                "tx {} already has an in-progress attempt",
                tx.id
            )));
        }

        if attempt.id == 0 {
            attempt.id = new_id;
            attempt.created_at = Utc::now();
            tx.attempts.push(attempt.clone());
        } else {
            let existing = tx
                .attempts
                .iter_mut()
                .find(|a| a.id == attempt.id)
                .ok_or_else(|| TxmError::Store(format!("attempt {} not found", attempt.id)))?;
            existing.state = AttemptState::InProgress;
            existing.broadcast_before_block_num = attempt.broadcast_before_block_num;
        }
        sort_attempts_by_fee(&mut tx.attempts);
        Ok(())
    }

    async fn save_sent_attempt(&self, attempt: &mut TxAttempt, broadcast_at: DateTime<Utc>) -> TxmResult<()> {
        let mut inner = self.inner.lock().await;
        let (tx, idx) = inner.attempt_mut(attempt.tx_id, attempt.id)?;
        if tx.attempts[idx].state != AttemptState::InProgress {
            return Err(TxmError::Store(format!(
                "attempt {} must be in_progress to be marked broadcast",
                attempt.id
            )));
        }
        tx.attempts[idx].state = AttemptState::Broadcast;
        bump_broadcast_at(tx, broadcast_at);
        attempt.state = AttemptState::Broadcast;
        Ok(())
    }

    async fn save_insufficient_funds_attempt(
        &self,
        attempt: &mut TxAttempt,
        broadcast_at: DateTime<Utc>,
    ) -> TxmResult<()> {
        let mut inner = self.inner.lock().await;
        let (tx, idx) = inner.attempt_mut(attempt.tx_id, attempt.id)?;
        if !matches!(
            tx.attempts[idx].state,
            AttemptState::InProgress | AttemptState::InsufficientFunds
        ) {
            return Err(TxmError::Store(format!(
                "attempt {} must be in_progress or insufficient_funds",
                attempt.id
            )));
        }
        tx.attempts[idx].state = AttemptState::InsufficientFunds;
        bump_broadcast_at(tx, broadcast_at);
        attempt.state = AttemptState::InsufficientFunds;
        Ok(())
    }

    async fn save_confirmed_missing_receipt_attempt(
        &self,
        attempt: &mut TxAttempt,
        broadcast_at: DateTime<Utc>,
    ) -> TxmResult<()> {
        let mut inner = self.inner.lock().await;
        let (tx, idx) = inner.attempt_mut(attempt.tx_id, attempt.id)?;
        if tx.attempts[idx].state != AttemptState::InProgress {
            return Err(TxmError::Store(format!(
                "attempt {} must be in_progress",
                attempt.id
            )));
        }
        expect_state(tx, &[TxState::Unconfirmed, TxState::ConfirmedMissingReceipt])?;
        tx.attempts[idx].state = AttemptState::Broadcast;
        tx.state = TxState::ConfirmedMissingReceipt;
        bump_broadcast_at(tx, broadcast_at);
        attempt.state = AttemptState::Broadcast;
        Ok(())
    }

    async fn delete_in_progress_attempt(&self, attempt: &TxAttempt) -> TxmResult<()> {
        if attempt.state != AttemptState::InProgress || attempt.id == 0 {
            return Err(TxmError::Internal(
                "can only delete a saved in_progress attempt".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        let (tx, idx) = inner.attempt_mut(attempt.tx_id, attempt.id)?;
        if tx.attempts[idx].state != AttemptState::InProgress {
            return Err(TxmError::Store(format!(
                "attempt {} is no longer in progress",
                attempt.id
            )));
        }
        tx.attempts.remove(idx);
        Ok(())
    }

    async fn find_confirmed_missing_receipt_txs(&self, chain_id: u64) -> TxmResult<Vec<Transaction>> {
        let inner = self.inner.lock().await;
        let txs = inner
            .txs
            .values()
            .filter(|tx| tx.chain_id == chain_id && tx.state == TxState::ConfirmedMissingReceipt)
            .map(sorted)
            .collect();
        Ok(by_sequence(txs))
    }

    async fn update_txs_unconfirmed(&self, ids: &[i64]) -> TxmResult<()> {
        let mut inner = self.inner.lock().await;
        for id in ids {
            if let Some(tx) = inner.txs.get_mut(id) {
                if tx.state == TxState::ConfirmedMissingReceipt {
                    tx.state = TxState::Unconfirmed;
                }
            }
        }
        Ok(())
    }

    async fn update_broadcast_ats(&self, at: DateTime<Utc>, ids: &[i64]) -> TxmResult<()> {
        let mut inner = self.inner.lock().await;
        for id in ids {
            if let Some(tx) = inner.txs.get_mut(id) {
                bump_broadcast_at(tx, at);
            }
        }
        Ok(())
    }

    async fn find_txs_confirmed_in_block_range(
        &self,
        high: u64,
        low: u64,
        chain_id: u64,
    ) -> TxmResult<Vec<Transaction>> {
        let inner = self.inner.lock().await;
        let txs = inner
            .txs
            .values()
            .filter(|tx| {
                tx.chain_id == chain_id
                    && matches!(
                        tx.state,
                        TxState::Confirmed | TxState::ConfirmedMissingReceipt
                    )
                    && tx.attempts.iter().any(|a| {
                        a.receipts
                            .iter()
                            .any(|r| r.block_number >= low && r.block_number <= high)
                    })
            })
            .map(sorted)
            .collect();
        Ok(by_sequence(txs))
    }

    async fn mark_for_rebroadcast(&self, tx: &Transaction, attempt: &TxAttempt) -> TxmResult<()> {
        let mut inner = self.inner.lock().await;
        let (stored, idx) = inner.attempt_mut(tx.id, attempt.id)?;
        expect_state(stored, &[TxState::Confirmed, TxState::ConfirmedMissingReceipt])?;
        if stored.attempts[idx].state != AttemptState::Broadcast {
            return Err(TxmError::Store(format!(
                "attempt {} must be broadcast to be rebroadcast",
                attempt.id
            )));
        }

        for a in stored.attempts.iter_mut() {
            a.receipts.clear();
        }
        stored.state = TxState::Unconfirmed;
        stored.attempts[idx].state = AttemptState::InProgress;
        stored.attempts[idx].broadcast_before_block_num = None;
        Ok(())
    }

    async fn find_txs_pending_callback(&self, block_num: u64, chain_id: u64) -> TxmResult<Vec<PendingCallback>> {
        let inner = self.inner.lock().await;
        let mut pending = Vec::new();
        for tx in inner.txs.values().filter(|tx| {
            tx.chain_id == chain_id
                && tx.state == TxState::Confirmed
                && tx.signal_callback
                && !tx.callback_completed
        }) {
            let run_id = match tx.pipeline_task_run_id {
                Some(id) => id,
                None => continue,
            };
            let min_confirmations = tx.min_confirmations.unwrap_or(0) as i64;
            let receipt = tx
                .attempts
                .iter()
                .flat_map(|a| a.receipts.iter())
                .find(|r| r.block_number as i64 <= block_num as i64 - min_confirmations);
            if let Some(receipt) = receipt {
                pending.push(PendingCallback {
                    tx_id: tx.id,
                    pipeline_task_run_id: run_id,
                    receipt: receipt.clone(),
                });
            }
        }
        Ok(pending)
    }

    async fn update_tx_callback_completed(&self, pipeline_task_run_id: Uuid, chain_id: u64) -> TxmResult<()> {
        let mut inner = self.inner.lock().await;
        let tx = inner
            .txs
            .values_mut()
            .find(|tx| tx.chain_id == chain_id && tx.pipeline_task_run_id == Some(pipeline_task_run_id))
            .ok_or_else(|| {
                TxmError::Store(format!(
                    "no tx found with pipeline_task_run_id {}",
                    pipeline_task_run_id
                ))
            })?;
        tx.callback_completed = true;
        Ok(())
    }

    async fn find_attempts_requiring_resend(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
        chain_id: u64,
    ) -> TxmResult<Vec<TxAttempt>> {
        let inner = self.inner.lock().await;
        let txs: Vec<Transaction> = inner
            .txs
            .values()
            .filter(|tx| {
                tx.chain_id == chain_id
                    && tx.state == TxState::Unconfirmed
                    && matches!(tx.broadcast_at, Some(at) if at < older_than)
            })
            .map(sorted)
            .collect();

        let mut attempts: Vec<TxAttempt> = by_sequence(txs)
            .into_iter()
            .filter_map(|tx| {
                tx.attempts
                    .into_iter()
                    .find(|a| a.state == AttemptState::Broadcast)
            })
            .collect();
        if limit > 0 {
            attempts.truncate(limit as usize);
        }
        Ok(attempts)
    }

    async fn reap_txs(
        &self,
        min_block_to_keep: u64,
        older_than: DateTime<Utc>,
        chain_id: u64,
    ) -> TxmResult<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.txs.len();
        inner.txs.retain(|_, tx| {
            if tx.chain_id != chain_id || tx.created_at >= older_than {
                return true;
            }
            match tx.state {
                TxState::FatalError => false,
                TxState::Confirmed => {
                    let mut receipts = tx.attempts.iter().flat_map(|a| a.receipts.iter()).peekable();
                    let has_receipts = receipts.peek().is_some();
                    let all_final = receipts.all(|r| r.block_number < min_block_to_keep);
                    !(has_receipts && all_final)
                }
                _ => true,
            }
        });
        Ok((before - inner.txs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::models::{Fee, TxStrategy};
    use ethers::types::{Bytes, H256, U256};

    const CHAIN_ID: u64 = 1337;

    fn request(from: Address, value: u64) -> NewTransaction {
        NewTransaction {
            from_address: from,
            to_address: Address::repeat_byte(0x22),
            encoded_payload: Bytes::default(),
            value: U256::from(value),
            fee_limit: 21_000,
            strategy: TxStrategy::SendEvery,
            min_confirmations: None,
            pipeline_task_run_id: None,
            signal_callback: false,
        }
    }

    fn attempt(hash: u64) -> TxAttempt {
        TxAttempt {
            id: 0,
            tx_id: 0,
            fee: Fee::Legacy {
                gas_price: U256::from(10),
            },
            chain_specific_gas_limit: 21_000,
            signed_raw_tx: Bytes::from(vec![1, 2, 3]),
            hash: H256::from_low_u64_be(hash),
            state: AttemptState::InProgress,
            broadcast_before_block_num: None,
            created_at: Utc::now(),
            receipts: vec![],
        }
    }

    #[tokio::test]
    async fn test_second_in_progress_tx_is_rejected() {
        let store = MemoryTxStore::new();
        let from = Address::repeat_byte(0x01);

        let mut first = store.insert_unstarted(CHAIN_ID, &request(from, 1)).await.unwrap();
        let mut second = store.insert_unstarted(CHAIN_ID, &request(from, 2)).await.unwrap();

        first.sequence = Some(0);
        store
            .move_unstarted_to_in_progress(&mut first, &mut attempt(1))
            .await
            .unwrap();

        second.sequence = Some(1);
        let err = store
            .move_unstarted_to_in_progress(&mut second, &mut attempt(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TxmError::InProgressConflict { .. }));
        assert!(store.has_in_progress_transaction(from, CHAIN_ID).await.unwrap());
    }

    #[tokio::test]
    async fn test_claiming_a_removed_or_started_tx_fails() {
        let store = MemoryTxStore::new();
        let from = Address::repeat_byte(0x01);
        let mut tx = store.insert_unstarted(CHAIN_ID, &request(from, 1)).await.unwrap();
        tx.sequence = Some(0);

        let mut ghost = tx.clone();
        ghost.id = 999;
        let err = store
            .move_unstarted_to_in_progress(&mut ghost, &mut attempt(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TxmError::TxRemoved { tx_id: 999 }));

        store
            .move_unstarted_to_in_progress(&mut tx.clone(), &mut attempt(1))
            .await
            .unwrap();
        let err = store
            .move_unstarted_to_in_progress(&mut tx, &mut attempt(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TxmError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_drop_oldest_prunes_by_subject() {
        let store = MemoryTxStore::new();
        let from = Address::repeat_byte(0x01);
        let subject = Uuid::new_v4();
        let mut req = request(from, 1);
        req.strategy = TxStrategy::DropOldest {
            subject,
            queue_size: 2,
        };

        let a = store.insert_unstarted(CHAIN_ID, &req).await.unwrap();
        let b = store.insert_unstarted(CHAIN_ID, &req).await.unwrap();
        let c = store.insert_unstarted(CHAIN_ID, &req).await.unwrap();
        let unrelated = store.insert_unstarted(CHAIN_ID, &request(from, 1)).await.unwrap();

        assert!(store.find_transaction(a.id).await.unwrap().is_none());
        assert!(store.find_transaction(b.id).await.unwrap().is_some());
        assert!(store.find_transaction(c.id).await.unwrap().is_some());
        assert!(store.find_transaction(unrelated.id).await.unwrap().is_some());
        assert_eq!(store.count_unstarted_transactions(from, CHAIN_ID).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_drop_oldest_leaves_other_chains_alone() {
        let store = MemoryTxStore::new();
        let from = Address::repeat_byte(0x01);
        let subject = Uuid::new_v4();
        let mut req = request(from, 1);
        req.strategy = TxStrategy::DropOldest {
            subject,
            queue_size: 1,
        };

        let other_chain = store.insert_unstarted(CHAIN_ID + 1, &req).await.unwrap();
        let first = store.insert_unstarted(CHAIN_ID, &req).await.unwrap();
        let second = store.insert_unstarted(CHAIN_ID, &req).await.unwrap();

        assert!(store.find_transaction(other_chain.id).await.unwrap().is_some());
        assert!(store.find_transaction(first.id).await.unwrap().is_none());
        assert!(store.find_transaction(second.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reused_nonce_is_rejected() {
        let store = MemoryTxStore::new();
        let from = Address::repeat_byte(0x01);

        let mut first = store.insert_unstarted(CHAIN_ID, &request(from, 1)).await.unwrap();
        first.sequence = Some(4);
        let mut first_attempt = attempt(1);
        store
            .move_unstarted_to_in_progress(&mut first, &mut first_attempt)
            .await
            .unwrap();
        first.broadcast_at = Some(Utc::now());
        first.initial_broadcast_at = first.broadcast_at;
        store
            .move_in_progress_to_broadcast(&mut first, &mut first_attempt, &|| {})
            .await
            .unwrap();

        let mut second = store.insert_unstarted(CHAIN_ID, &request(from, 2)).await.unwrap();
        second.sequence = Some(4);
        let err = store
            .move_unstarted_to_in_progress(&mut second, &mut attempt(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TxmError::NonceConflict { nonce: 4, .. }));
        assert!(err.should_alert());

        let second = store.find_transaction(second.id).await.unwrap().unwrap();
        assert_eq!(second.state, TxState::Unstarted);
        assert_eq!(second.sequence, None);
        assert!(second.attempts.is_empty());

        // Another account may use the same nonce
        let mut other = store
            .insert_unstarted(CHAIN_ID, &request(Address::repeat_byte(0x02), 1))
            .await
            .unwrap();
        other.sequence = Some(4);
        store
            .move_unstarted_to_in_progress(&mut other, &mut attempt(3))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_receipts_promote_and_mark_missing() {
        let store = MemoryTxStore::new();
        let from = Address::repeat_byte(0x01);

        let mut ids = Vec::new();
        for nonce in 0..2u64 {
            let mut tx = Transaction::unstarted(CHAIN_ID, &request(from, 1));
            tx.state = TxState::Unconfirmed;
            tx.sequence = Some(nonce);
            let mut a = attempt(100 + nonce);
            a.state = AttemptState::Broadcast;
            tx.attempts = vec![a];
            ids.push(store.insert_transaction(tx).await.id);
        }

        let receipt = Receipt {
            id: 0,
            tx_hash: H256::from_low_u64_be(101),
            block_hash: H256::from_low_u64_be(7),
            block_number: 7,
            transaction_index: 0,
            status: Some(1),
            raw: serde_json::Value::Null,
        };
        store.save_fetched_receipts(&[receipt], CHAIN_ID).await.unwrap();

        let confirmed = store.find_transaction(ids[1]).await.unwrap().unwrap();
        assert_eq!(confirmed.state, TxState::Confirmed);
        assert_eq!(confirmed.attempts[0].broadcast_before_block_num, Some(7));
        assert_eq!(confirmed.attempts[0].receipts.len(), 1);

        assert_eq!(store.mark_all_confirmed_missing_receipt(CHAIN_ID).await.unwrap(), 1);
        let missing = store.find_transaction(ids[0]).await.unwrap().unwrap();
        assert_eq!(missing.state, TxState::ConfirmedMissingReceipt);
    }

    #[tokio::test]
    async fn test_gas_bump_candidates_respect_threshold_and_depth() {
        let store = MemoryTxStore::new();
        let from = Address::repeat_byte(0x01);

        for (nonce, sent_before) in [(0u64, Some(5u64)), (1, Some(9)), (2, None)] {
            let mut tx = Transaction::unstarted(CHAIN_ID, &request(from, 1));
            tx.state = TxState::Unconfirmed;
            tx.sequence = Some(nonce);
            let mut a = attempt(200 + nonce);
            a.state = AttemptState::Broadcast;
            a.broadcast_before_block_num = sent_before;
            tx.attempts = vec![a];
            store.insert_transaction(tx).await;
        }

        let due = store
            .find_txs_requiring_gas_bump(from, 10, 3, 0, CHAIN_ID)
            .await
            .unwrap();
        assert_eq!(due.iter().map(|t| t.sequence).collect::<Vec<_>>(), vec![Some(0)]);

        let due = store
            .find_txs_requiring_gas_bump(from, 20, 3, 0, CHAIN_ID)
            .await
            .unwrap();
        assert_eq!(due.len(), 2);

        let due = store
            .find_txs_requiring_gas_bump(from, 20, 3, 1, CHAIN_ID)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);

        assert!(store
            .find_txs_requiring_gas_bump(from, 20, 0, 0, CHAIN_ID)
            .await
            .unwrap()
            .is_empty());
    }
}
