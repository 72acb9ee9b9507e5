//! Transaction store - the system of record for transactions, attempts and receipts
//!
//! Every state transition is a guarded write: it only applies when the row is
//! still in the expected prior state, so the broadcaster and confirmer can share
//! a store without a global lock.

pub mod memory;
pub mod postgres;

pub use memory::MemoryTxStore;
pub use postgres::PgTxStore;

use crate::error::TxmResult;
use crate::tx::models::{
    NewTransaction, PendingCallback, Receipt, Transaction, TransactionStats, TxAttempt,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use uuid::Uuid;

/// Error persisted on txs that never produced a receipt before finality
pub const ERR_COULD_NOT_GET_RECEIPT: &str = "could not get receipt";

#[async_trait]
pub trait TxStore: Send + Sync {
    async fn health_check(&self) -> TxmResult<()>;

    /// Inserts an unstarted tx, pruning the oldest unstarted txs of the same subject first
    async fn insert_unstarted(&self, chain_id: u64, request: &NewTransaction) -> TxmResult<Transaction>;

    async fn count_unstarted_transactions(&self, from: Address, chain_id: u64) -> TxmResult<u32>;

    async fn count_unconfirmed_transactions(&self, from: Address, chain_id: u64) -> TxmResult<u32>;

    /// Tx with all attempts and receipts
    async fn find_transaction(&self, id: i64) -> TxmResult<Option<Transaction>>;

    async fn stats(&self, chain_id: u64) -> TxmResult<TransactionStats>;

    async fn find_highest_sequence(&self, from: Address, chain_id: u64) -> TxmResult<Option<u64>>;

    async fn has_in_progress_transaction(&self, from: Address, chain_id: u64) -> TxmResult<bool>;

    /// The account's in-progress tx; it must carry exactly one in-progress attempt
    async fn find_in_progress(&self, from: Address, chain_id: u64) -> TxmResult<Option<Transaction>>;

    /// Oldest unstarted tx ordered by (value, created_at, id)
    async fn find_oldest_unstarted(&self, from: Address, chain_id: u64) -> TxmResult<Option<Transaction>>;

    /// Atomically claims an unstarted tx with its nonce and inserts its first attempt
    async fn move_unstarted_to_in_progress(
        &self,
        tx: &mut Transaction,
        attempt: &mut TxAttempt,
    ) -> TxmResult<()>;

    /// Swaps the in-progress attempt `old` for `new` in one write
    async fn save_replacement_in_progress_attempt(
        &self,
        old: &TxAttempt,
        new: &mut TxAttempt,
    ) -> TxmResult<()>;

    /// Marks the attempt broadcast and the tx unconfirmed; `increment_nonce` runs inside the same write
    async fn move_in_progress_to_broadcast(
        &self,
        tx: &mut Transaction,
        attempt: &mut TxAttempt,
        increment_nonce: &(dyn Fn() + Send + Sync),
    ) -> TxmResult<()>;

    /// Deletes all attempts, nulls the nonce and persists `tx.error`
    async fn update_tx_fatal_error(&self, tx: &mut Transaction) -> TxmResult<()>;

    async fn set_broadcast_before_block_num(&self, block_num: u64, chain_id: u64) -> TxmResult<()>;

    /// Unconfirmed and confirmed-missing-receipt txs, oldest nonce first, carrying only
    /// the attempts worth polling (highest fee first)
    async fn find_txs_requiring_receipt_fetch(&self, chain_id: u64) -> TxmResult<Vec<Transaction>>;

    /// Upserts receipts and promotes their attempts and txs in one write
    async fn save_fetched_receipts(&self, receipts: &[Receipt], chain_id: u64) -> TxmResult<()>;

    /// Unconfirmed txs below an account's highest confirmed nonce become confirmed-missing-receipt
    async fn mark_all_confirmed_missing_receipt(&self, chain_id: u64) -> TxmResult<u64>;

    /// Errors confirmed-missing-receipt txs whose newest attempt is older than finality;
    /// returns the txs as they were before the update
    async fn mark_old_txs_missing_receipt_as_errored(
        &self,
        block_num: u64,
        finality_depth: u64,
        chain_id: u64,
    ) -> TxmResult<Vec<Transaction>>;

    async fn find_txs_requiring_gas_bump(
        &self,
        from: Address,
        block_num: u64,
        threshold: u64,
        depth: u32,
        chain_id: u64,
    ) -> TxmResult<Vec<Transaction>>;

    async fn find_txs_requiring_resubmission_due_to_insufficient_funds(
        &self,
        from: Address,
        chain_id: u64,
    ) -> TxmResult<Vec<Transaction>>;

    /// In-progress attempts of txs already past the broadcaster
    async fn get_in_progress_attempts(
        &self,
        from: Address,
        chain_id: u64,
    ) -> TxmResult<Vec<(Transaction, TxAttempt)>>;

    /// Inserts (id 0) or updates an in-progress attempt of an unconfirmed tx
    async fn save_in_progress_attempt(&self, attempt: &mut TxAttempt) -> TxmResult<()>;

    async fn save_sent_attempt(&self, attempt: &mut TxAttempt, broadcast_at: DateTime<Utc>) -> TxmResult<()>;

    async fn save_insufficient_funds_attempt(
        &self,
        attempt: &mut TxAttempt,
        broadcast_at: DateTime<Utc>,
    ) -> TxmResult<()>;

    async fn save_confirmed_missing_receipt_attempt(
        &self,
        attempt: &mut TxAttempt,
        broadcast_at: DateTime<Utc>,
    ) -> TxmResult<()>;

    async fn delete_in_progress_attempt(&self, attempt: &TxAttempt) -> TxmResult<()>;

    async fn find_confirmed_missing_receipt_txs(&self, chain_id: u64) -> TxmResult<Vec<Transaction>>;

    async fn update_txs_unconfirmed(&self, ids: &[i64]) -> TxmResult<()>;

    /// Moves `broadcast_at` forward, never backward
    async fn update_broadcast_ats(&self, at: DateTime<Utc>, ids: &[i64]) -> TxmResult<()>;

    /// Confirmed txs with a receipt in `[low, high]`
    async fn find_txs_confirmed_in_block_range(
        &self,
        high: u64,
        low: u64,
        chain_id: u64,
    ) -> TxmResult<Vec<Transaction>>;

    /// Deletes receipts, unconfirms the tx and returns `attempt` to in-progress
    async fn mark_for_rebroadcast(&self, tx: &Transaction, attempt: &TxAttempt) -> TxmResult<()>;

    async fn find_txs_pending_callback(&self, block_num: u64, chain_id: u64) -> TxmResult<Vec<PendingCallback>>;

    async fn update_tx_callback_completed(&self, pipeline_task_run_id: Uuid, chain_id: u64) -> TxmResult<()>;

    /// Highest-fee broadcast attempt of each unconfirmed tx last sent before `older_than`
    async fn find_attempts_requiring_resend(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
        chain_id: u64,
    ) -> TxmResult<Vec<TxAttempt>>;

    /// Deletes finished txs created before `older_than`; confirmed ones only when every
    /// receipt is below `min_block_to_keep`
    async fn reap_txs(
        &self,
        min_block_to_keep: u64,
        older_than: DateTime<Utc>,
        chain_id: u64,
    ) -> TxmResult<u64>;
}
