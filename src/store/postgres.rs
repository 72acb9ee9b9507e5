//! PostgreSQL transaction store

use super::{TxStore, ERR_COULD_NOT_GET_RECEIPT};
use crate::config::DatabaseConfig;
use crate::error::{TxmError, TxmResult};
use crate::tx::models::{
    AttemptState, Fee, NewTransaction, PendingCallback, Receipt, Transaction, TransactionStats,
    TxAttempt, TxState,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TX_COLUMNS: &str = r#"
    txes.id, txes.chain_id, txes.from_address, txes.to_address, txes.encoded_payload,
    txes.value::text AS value, txes.fee_limit, txes.nonce, txes.state, txes.error,
    txes.broadcast_at, txes.initial_broadcast_at, txes.created_at, txes.subject,
    txes.min_confirmations, txes.pipeline_task_run_id, txes.signal_callback,
    txes.callback_completed
"#;

const ATTEMPT_COLUMNS: &str = r#"
    tx_attempts.id, tx_attempts.tx_id, tx_attempts.gas_price::text AS gas_price,
    tx_attempts.tip_cap::text AS tip_cap, tx_attempts.fee_cap::text AS fee_cap,
    tx_attempts.chain_specific_gas_limit, tx_attempts.signed_raw_tx, tx_attempts.hash,
    tx_attempts.state, tx_attempts.broadcast_before_block_num, tx_attempts.created_at
"#;

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

const UNIQUE_IN_PROGRESS_TX: &str = "idx_txes_one_in_progress_per_address";
const UNIQUE_NONCE: &str = "idx_txes_unique_nonce_per_address";
const UNIQUE_IN_PROGRESS_ATTEMPT: &str = "idx_tx_attempts_one_in_progress";

/// Transaction store backed by PostgreSQL
pub struct PgTxStore {
    pool: PgPool,
}

impl PgTxStore {
    pub async fn new(config: &DatabaseConfig) -> TxmResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables and indexes
    pub async fn run_migrations(&self) -> TxmResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS txes (
                id BIGSERIAL PRIMARY KEY,
                chain_id BIGINT NOT NULL,
                from_address BYTEA NOT NULL,
                to_address BYTEA NOT NULL,
                encoded_payload BYTEA NOT NULL,
                value NUMERIC(78, 0) NOT NULL,
                fee_limit BIGINT NOT NULL,
                nonce BIGINT,
                state VARCHAR(32) NOT NULL,
                error TEXT,
                broadcast_at TIMESTAMPTZ,
                initial_broadcast_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                subject UUID,
                min_confirmations INTEGER,
                pipeline_task_run_id UUID,
                signal_callback BOOLEAN NOT NULL DEFAULT FALSE,
                callback_completed BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_txes_one_in_progress_per_address
            ON txes (from_address, chain_id) WHERE state = 'in_progress'
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_txes_unique_nonce_per_address
            ON txes (from_address, chain_id, nonce) WHERE nonce IS NOT NULL
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_txes_state_chain
            ON txes (chain_id, state, from_address)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_txes_unstarted_subject
            ON txes (subject, id) WHERE state = 'unstarted' AND subject IS NOT NULL
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tx_attempts (
                id BIGSERIAL PRIMARY KEY,
                tx_id BIGINT NOT NULL REFERENCES txes (id) ON DELETE CASCADE,
                gas_price NUMERIC(78, 0),
                tip_cap NUMERIC(78, 0),
                fee_cap NUMERIC(78, 0),
                chain_specific_gas_limit BIGINT NOT NULL,
                signed_raw_tx BYTEA NOT NULL,
                hash BYTEA NOT NULL UNIQUE,
                state VARCHAR(32) NOT NULL,
                broadcast_before_block_num BIGINT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CHECK ((gas_price IS NULL) <> (tip_cap IS NULL AND fee_cap IS NULL))
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tx_attempts_one_in_progress
            ON tx_attempts (tx_id) WHERE state = 'in_progress'
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS receipts (
                id BIGSERIAL PRIMARY KEY,
                tx_hash BYTEA NOT NULL REFERENCES tx_attempts (hash) ON DELETE CASCADE,
                block_hash BYTEA NOT NULL,
                block_number BIGINT NOT NULL,
                transaction_index BIGINT NOT NULL,
                status BIGINT,
                receipt JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (tx_hash, block_hash)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_receipts_block_number
            ON receipts (block_number)
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Database migrations complete");
        Ok(())
    }

    /// Loads attempts and receipts for the given tx rows
    async fn hydrate(&self, rows: Vec<PgRow>) -> TxmResult<Vec<Transaction>> {
        let mut txs = rows.iter().map(tx_from_row).collect::<TxmResult<Vec<_>>>()?;
        if txs.is_empty() {
            return Ok(txs);
        }
        let ids: Vec<i64> = txs.iter().map(|tx| tx.id).collect();

        let receipt_rows = sqlx::query(
            r#"
            SELECT receipts.id, receipts.tx_hash, receipts.block_hash, receipts.block_number,
                   receipts.transaction_index, receipts.status, receipts.receipt
            FROM receipts
            JOIN tx_attempts ON tx_attempts.hash = receipts.tx_hash
            WHERE tx_attempts.tx_id = ANY($1)
            ORDER BY receipts.block_number ASC
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut receipts: HashMap<H256, Vec<Receipt>> = HashMap::new();
        for row in &receipt_rows {
            let receipt = receipt_from_row(row)?;
            receipts.entry(receipt.tx_hash).or_default().push(receipt);
        }

        let attempt_rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM tx_attempts WHERE tx_attempts.tx_id = ANY($1)"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut attempts: HashMap<i64, Vec<TxAttempt>> = HashMap::new();
        for row in &attempt_rows {
            let mut attempt = attempt_from_row(row)?;
            attempt.receipts = receipts.remove(&attempt.hash).unwrap_or_default();
            attempts.entry(attempt.tx_id).or_default().push(attempt);
        }

        for tx in txs.iter_mut() {
            tx.attempts = attempts.remove(&tx.id).unwrap_or_default();
            tx.sort_attempts();
        }
        Ok(txs)
    }

    async fn fetch_txs(&self, query: PgQuery<'_>) -> TxmResult<Vec<Transaction>> {
        let rows = query.fetch_all(&self.pool).await?;
        self.hydrate(rows).await
    }
}

async fn insert_attempt(conn: &mut PgConnection, attempt: &mut TxAttempt) -> TxmResult<()> {
    let (gas_price, tip_cap, fee_cap) = match attempt.fee {
        Fee::Legacy { gas_price } => (Some(gas_price.to_string()), None, None),
        Fee::Dynamic { tip_cap, fee_cap } => (None, Some(tip_cap.to_string()), Some(fee_cap.to_string())),
    };

    let row = sqlx::query(
        r#"
        INSERT INTO tx_attempts
            (tx_id, gas_price, tip_cap, fee_cap, chain_specific_gas_limit, signed_raw_tx, hash,
             state, broadcast_before_block_num)
        VALUES ($1, $2::numeric, $3::numeric, $4::numeric, $5, $6, $7, $8, $9)
        RETURNING id, created_at
        "#,
    )
    .bind(attempt.tx_id)
    .bind(gas_price)
    .bind(tip_cap)
    .bind(fee_cap)
    .bind(attempt.chain_specific_gas_limit as i64)
    .bind(attempt.signed_raw_tx.to_vec())
    .bind(attempt.hash.as_bytes())
    .bind(attempt.state.as_str())
    .bind(attempt.broadcast_before_block_num.map(|n| n as i64))
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| match constraint_of(&e) {
        Some(UNIQUE_IN_PROGRESS_ATTEMPT) => TxmError::InvariantViolation(format!(
            "tx {} already has an in-progress attempt",
            attempt.tx_id
        )),
        _ => TxmError::Database(e),
    })?;

    attempt.id = row.try_get("id")?;
    attempt.created_at = row.try_get("created_at")?;
    Ok(())
}

/// Fails unless exactly one row was touched by a guarded write
fn expect_one(rows: u64, what: impl FnOnce() -> String) -> TxmResult<()> {
    if rows == 1 {
        Ok(())
    } else {
        Err(TxmError::Store(format!("{} (rows affected: {})", what(), rows)))
    }
}

fn constraint_of(err: &sqlx::Error) -> Option<&str> {
    match err {
        sqlx::Error::Database(db) => db.constraint(),
        _ => None,
    }
}

fn address(bytes: Vec<u8>) -> TxmResult<Address> {
    if bytes.len() != 20 {
        return Err(TxmError::Store(format!("invalid address length {}", bytes.len())));
    }
    Ok(Address::from_slice(&bytes))
}

fn hash(bytes: Vec<u8>) -> TxmResult<H256> {
    if bytes.len() != 32 {
        return Err(TxmError::Store(format!("invalid hash length {}", bytes.len())));
    }
    Ok(H256::from_slice(&bytes))
}

fn numeric(text: &str) -> TxmResult<U256> {
    U256::from_dec_str(text).map_err(|e| TxmError::Store(format!("invalid numeric {text}: {e}")))
}

fn tx_from_row(row: &PgRow) -> TxmResult<Transaction> {
    let state: String = row.try_get("state")?;
    let value: String = row.try_get("value")?;

    Ok(Transaction {
        id: row.try_get("id")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        from_address: address(row.try_get("from_address")?)?,
        to_address: address(row.try_get("to_address")?)?,
        encoded_payload: Bytes::from(row.try_get::<Vec<u8>, _>("encoded_payload")?),
        value: numeric(&value)?,
        fee_limit: row.try_get::<i64, _>("fee_limit")? as u64,
        sequence: row.try_get::<Option<i64>, _>("nonce")?.map(|n| n as u64),
        state: state.parse().map_err(TxmError::Store)?,
        error: row.try_get("error")?,
        broadcast_at: row.try_get("broadcast_at")?,
        initial_broadcast_at: row.try_get("initial_broadcast_at")?,
        created_at: row.try_get("created_at")?,
        subject: row.try_get("subject")?,
        min_confirmations: row
            .try_get::<Option<i32>, _>("min_confirmations")?
            .map(|n| n as u32),
        pipeline_task_run_id: row.try_get("pipeline_task_run_id")?,
        signal_callback: row.try_get("signal_callback")?,
        callback_completed: row.try_get("callback_completed")?,
        attempts: Vec::new(),
    })
}

fn attempt_from_row(row: &PgRow) -> TxmResult<TxAttempt> {
    let gas_price: Option<String> = row.try_get("gas_price")?;
    let tip_cap: Option<String> = row.try_get("tip_cap")?;
    let fee_cap: Option<String> = row.try_get("fee_cap")?;
    let fee = match (gas_price, tip_cap, fee_cap) {
        (Some(gas_price), None, None) => Fee::Legacy {
            gas_price: numeric(&gas_price)?,
        },
        (None, Some(tip_cap), Some(fee_cap)) => Fee::Dynamic {
            tip_cap: numeric(&tip_cap)?,
            fee_cap: numeric(&fee_cap)?,
        },
        _ => {
            return Err(TxmError::Store(
                "attempt must carry either a gas price or a tip and fee cap".to_string(),
            ))
        }
    };
    let state: String = row.try_get("state")?;

    Ok(TxAttempt {
        id: row.try_get("id")?,
        tx_id: row.try_get("tx_id")?,
        fee,
        chain_specific_gas_limit: row.try_get::<i64, _>("chain_specific_gas_limit")? as u64,
        signed_raw_tx: Bytes::from(row.try_get::<Vec<u8>, _>("signed_raw_tx")?),
        hash: hash(row.try_get("hash")?)?,
        state: state.parse().map_err(TxmError::Store)?,
        broadcast_before_block_num: row
            .try_get::<Option<i64>, _>("broadcast_before_block_num")?
            .map(|n| n as u64),
        created_at: row.try_get("created_at")?,
        receipts: Vec::new(),
    })
}

fn receipt_from_row(row: &PgRow) -> TxmResult<Receipt> {
    Ok(Receipt {
        id: row.try_get("id")?,
        tx_hash: hash(row.try_get("tx_hash")?)?,
        block_hash: hash(row.try_get("block_hash")?)?,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        transaction_index: row.try_get::<i64, _>("transaction_index")? as u64,
        status: row.try_get::<Option<i64>, _>("status")?.map(|s| s as u64),
        raw: row.try_get("receipt")?,
    })
}

#[async_trait]
impl TxStore for PgTxStore {
    async fn health_check(&self) -> TxmResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_unstarted(&self, chain_id: u64, request: &NewTransaction) -> TxmResult<Transaction> {
        let mut dbtx = self.pool.begin().await?;

        if let Some((subject, keep)) = request.strategy.prune_to() {
            let pruned = sqlx::query(
                r#"
                DELETE FROM txes
                WHERE chain_id = $3 AND state = 'unstarted' AND subject = $1 AND id NOT IN (
                    SELECT id FROM txes
                    WHERE chain_id = $3 AND state = 'unstarted' AND subject = $1
                    ORDER BY id DESC
                    LIMIT $2
                )
                "#,
            )
            .bind(subject)
            .bind(keep as i64)
            .bind(chain_id as i64)
            .execute(&mut *dbtx)
            .await?
            .rows_affected();
            if pruned > 0 {
                debug!("Dropped {} oldest unstarted txs for subject {}", pruned, subject);
            }
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO txes
                (chain_id, from_address, to_address, encoded_payload, value, fee_limit, state,
                 subject, min_confirmations, pipeline_task_run_id, signal_callback)
            VALUES ($1, $2, $3, $4, $5::numeric, $6, 'unstarted', $7, $8, $9, $10)
            RETURNING {TX_COLUMNS}
            "#
        ))
        .bind(chain_id as i64)
        .bind(request.from_address.as_bytes())
        .bind(request.to_address.as_bytes())
        .bind(request.encoded_payload.to_vec())
        .bind(request.value.to_string())
        .bind(request.fee_limit as i64)
        .bind(request.strategy.subject())
        .bind(request.min_confirmations.map(|n| n as i32))
        .bind(request.pipeline_task_run_id)
        .bind(request.signal_callback)
        .fetch_one(&mut *dbtx)
        .await?;

        let tx = tx_from_row(&row)?;
        dbtx.commit().await?;
        Ok(tx)
    }

    async fn count_unstarted_transactions(&self, from: Address, chain_id: u64) -> TxmResult<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM txes WHERE from_address = $1 AND chain_id = $2 AND state = 'unstarted'",
        )
        .bind(from.as_bytes())
        .bind(chain_id as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    async fn count_unconfirmed_transactions(&self, from: Address, chain_id: u64) -> TxmResult<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM txes WHERE from_address = $1 AND chain_id = $2 AND state = 'unconfirmed'",
        )
        .bind(from.as_bytes())
        .bind(chain_id as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    async fn find_transaction(&self, id: i64) -> TxmResult<Option<Transaction>> {
        let sql = format!("SELECT {TX_COLUMNS} FROM txes WHERE txes.id = $1");
        let txs = self.fetch_txs(sqlx::query(&sql).bind(id)).await?;
        Ok(txs.into_iter().next())
    }

    async fn stats(&self, chain_id: u64) -> TxmResult<TransactionStats> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS count FROM txes WHERE chain_id = $1 GROUP BY state",
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = TransactionStats::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            stats.record(state.parse().map_err(TxmError::Store)?, count as u64);
        }
        Ok(stats)
    }

    async fn find_highest_sequence(&self, from: Address, chain_id: u64) -> TxmResult<Option<u64>> {
        let highest: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(nonce) FROM txes WHERE from_address = $1 AND chain_id = $2",
        )
        .bind(from.as_bytes())
        .bind(chain_id as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(highest.map(|n| n as u64))
    }

    async fn has_in_progress_transaction(&self, from: Address, chain_id: u64) -> TxmResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM txes WHERE from_address = $1 AND chain_id = $2 AND state = 'in_progress')",
        )
        .bind(from.as_bytes())
        .bind(chain_id as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn find_in_progress(&self, from: Address, chain_id: u64) -> TxmResult<Option<Transaction>> {
        let sql = format!(
            "SELECT {TX_COLUMNS} FROM txes WHERE from_address = $1 AND chain_id = $2 AND state = 'in_progress'"
        );
        let mut txs = self
            .fetch_txs(sqlx::query(&sql).bind(from.as_bytes()).bind(chain_id as i64))
            .await?;

        if txs.len() > 1 {
            return Err(TxmError::InvariantViolation(format!(
                "more than one in-progress transaction for {:?}",
                from
            )));
        }
        let tx = match txs.pop() {
            Some(tx) => tx,
            None => return Ok(None),
        };
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
        let row = sqlx::query(&format!(
            r#"
            SELECT {TX_COLUMNS} FROM txes
            WHERE from_address = $1 AND chain_id = $2 AND state = 'unstarted'
            ORDER BY value ASC, created_at ASC, id ASC
            LIMIT 1
            "#
        ))
        .bind(from.as_bytes())
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(tx_from_row).transpose()
    }

    async fn move_unstarted_to_in_progress(
        &self,
        tx: &mut Transaction,
        attempt: &mut TxAttempt,
    ) -> TxmResult<()> {
        let nonce = tx
            .sequence
            .ok_or_else(|| TxmError::Internal(format!("tx {} has no nonce assigned", tx.id)))?;
        if attempt.state != AttemptState::InProgress {
            return Err(TxmError::Internal(format!(
                "attempt for tx {} must be in_progress, got {}",
                tx.id, attempt.state
            )));
        }

        let mut dbtx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE txes SET state = 'in_progress', nonce = $2 WHERE id = $1 AND state = 'unstarted'",
        )
        .bind(tx.id)
        .bind(nonce as i64)
        .execute(&mut *dbtx)
        .await
        .map_err(|e| match constraint_of(&e) {
            Some(UNIQUE_IN_PROGRESS_TX) => TxmError::InProgressConflict {
                address: tx.from_address,
                chain_id: tx.chain_id,
            },
            Some(UNIQUE_NONCE) => TxmError::NonceConflict {
                address: tx.from_address,
                nonce,
            },
            _ => TxmError::Database(e),
        })?
        .rows_affected();

        if updated == 0 {
            let state: Option<String> = sqlx::query_scalar("SELECT state FROM txes WHERE id = $1")
                .bind(tx.id)
                .fetch_optional(&mut *dbtx)
                .await?;
            return Err(match state {
                None => TxmError::TxRemoved { tx_id: tx.id },
                Some(found) => TxmError::InvalidStateTransition {
                    tx_id: tx.id,
                    expected: TxState::Unstarted.to_string(),
                    found,
                },
            });
        }

        attempt.tx_id = tx.id;
        insert_attempt(&mut *dbtx, attempt).await?;
        dbtx.commit().await?;

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

        let mut dbtx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM tx_attempts WHERE id = $1 AND state = 'in_progress'")
            .bind(old.id)
            .execute(&mut *dbtx)
            .await?
            .rows_affected();
        expect_one(deleted, || format!("attempt {} is no longer in progress", old.id))?;

        new.tx_id = old.tx_id;
        insert_attempt(&mut *dbtx, new).await?;
        dbtx.commit().await?;
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

        let mut dbtx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE tx_attempts SET state = 'broadcast' WHERE id = $1 AND tx_id = $2 AND state = 'in_progress'",
        )
        .bind(attempt.id)
        .bind(tx.id)
        .execute(&mut *dbtx)
        .await?
        .rows_affected();
        expect_one(updated, || format!("attempt {} is not in progress", attempt.id))?;

        let updated = sqlx::query(
            r#"
            UPDATE txes
            SET state = 'unconfirmed', error = NULL, broadcast_at = $2, initial_broadcast_at = $3
            WHERE id = $1 AND state = 'in_progress'
            "#,
        )
        .bind(tx.id)
        .bind(broadcast_at)
        .bind(initial_broadcast_at)
        .execute(&mut *dbtx)
        .await?
        .rows_affected();
        if updated != 1 {
            return Err(TxmError::InvalidStateTransition {
                tx_id: tx.id,
                expected: TxState::InProgress.to_string(),
                found: "unknown".to_string(),
            });
        }

        increment_nonce();
        dbtx.commit().await?;

        attempt.state = AttemptState::Broadcast;
        tx.state = TxState::Unconfirmed;
        tx.error = None;
        for a in tx.attempts.iter_mut().filter(|a| a.id == attempt.id) {
            a.state = AttemptState::Broadcast;
        }
        Ok(())
    }

    async fn update_tx_fatal_error(&self, tx: &mut Transaction) -> TxmResult<()> {
        let error = tx.error.clone().ok_or_else(|| {
            TxmError::Internal(format!("tx {} cannot be marked fatal without an error", tx.id))
        })?;

        let mut dbtx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tx_attempts WHERE tx_id = $1")
            .bind(tx.id)
            .execute(&mut *dbtx)
            .await?;
        let updated = sqlx::query(
            r#"
            UPDATE txes
            SET state = 'fatal_error', nonce = NULL, broadcast_at = NULL,
                initial_broadcast_at = NULL, error = $2
            WHERE id = $1 AND state IN ('in_progress', 'unstarted')
            "#,
        )
        .bind(tx.id)
        .bind(&error)
        .execute(&mut *dbtx)
        .await?
        .rows_affected();
        if updated != 1 {
            return Err(TxmError::InvalidStateTransition {
                tx_id: tx.id,
                expected: "in_progress|unstarted".to_string(),
                found: tx.state.to_string(),
            });
        }
        dbtx.commit().await?;

        tx.state = TxState::FatalError;
        tx.sequence = None;
        tx.broadcast_at = None;
        tx.initial_broadcast_at = None;
        tx.attempts.clear();
        Ok(())
    }

    async fn set_broadcast_before_block_num(&self, block_num: u64, chain_id: u64) -> TxmResult<()> {
        sqlx::query(
            r#"
            UPDATE tx_attempts SET broadcast_before_block_num = $1
            FROM txes
            WHERE tx_attempts.tx_id = txes.id
              AND tx_attempts.state = 'broadcast'
              AND tx_attempts.broadcast_before_block_num IS NULL
              AND txes.chain_id = $2
            "#,
        )
        .bind(block_num as i64)
        .bind(chain_id as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_txs_requiring_receipt_fetch(&self, chain_id: u64) -> TxmResult<Vec<Transaction>> {
        let sql = format!(
            r#"
            SELECT {TX_COLUMNS} FROM txes
            WHERE chain_id = $1 AND state IN ('unconfirmed', 'confirmed_missing_receipt')
            ORDER BY nonce ASC, id ASC
            "#
        );
        let txs = self.fetch_txs(sqlx::query(&sql).bind(chain_id as i64)).await?;
        Ok(txs
            .into_iter()
            .filter_map(|mut tx| {
                tx.attempts
                    .retain(|a| a.state != AttemptState::InsufficientFunds);
                (!tx.attempts.is_empty()).then_some(tx)
            })
            .collect())
    }

    async fn save_fetched_receipts(&self, receipts: &[Receipt], chain_id: u64) -> TxmResult<()> {
        let mut dbtx = self.pool.begin().await?;

        for receipt in receipts {
            let tx_id: Option<i64> = sqlx::query_scalar(
                r#"
                UPDATE tx_attempts
                SET state = 'broadcast',
                    broadcast_before_block_num = COALESCE(tx_attempts.broadcast_before_block_num, $2)
                FROM txes
                WHERE tx_attempts.tx_id = txes.id AND tx_attempts.hash = $1 AND txes.chain_id = $3
                RETURNING tx_attempts.tx_id
                "#,
            )
            .bind(receipt.tx_hash.as_bytes())
            .bind(receipt.block_number as i64)
            .bind(chain_id as i64)
            .fetch_optional(&mut *dbtx)
            .await?;

            let tx_id = match tx_id {
                Some(id) => id,
                None => {
                    warn!("No attempt found for receipt {:?}", receipt.tx_hash);
                    continue;
                }
            };

            sqlx::query(
                r#"
                INSERT INTO receipts
                    (tx_hash, block_hash, block_number, transaction_index, status, receipt)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (tx_hash, block_hash) DO UPDATE SET
                    block_number = EXCLUDED.block_number,
                    transaction_index = EXCLUDED.transaction_index,
                    status = EXCLUDED.status,
                    receipt = EXCLUDED.receipt
                "#,
            )
            .bind(receipt.tx_hash.as_bytes())
            .bind(receipt.block_hash.as_bytes())
            .bind(receipt.block_number as i64)
            .bind(receipt.transaction_index as i64)
            .bind(receipt.status.map(|s| s as i64))
            .bind(&receipt.raw)
            .execute(&mut *dbtx)
            .await?;

            sqlx::query(
                r#"
                UPDATE txes SET state = 'confirmed'
                WHERE id = $1 AND state IN ('unconfirmed', 'confirmed_missing_receipt')
                "#,
            )
            .bind(tx_id)
            .execute(&mut *dbtx)
            .await?;
        }

        dbtx.commit().await?;
        Ok(())
    }

    async fn mark_all_confirmed_missing_receipt(&self, chain_id: u64) -> TxmResult<u64> {
        let updated = sqlx::query(
            r#"
            UPDATE txes SET state = 'confirmed_missing_receipt'
            FROM (
                SELECT from_address, MAX(nonce) AS max_nonce
                FROM txes
                WHERE state = 'confirmed' AND chain_id = $1
                GROUP BY from_address
            ) confirmed
            WHERE txes.from_address = confirmed.from_address
              AND txes.chain_id = $1
              AND txes.state = 'unconfirmed'
              AND txes.nonce < confirmed.max_nonce
            "#,
        )
        .bind(chain_id as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
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

        let sql = format!(
            r#"
            SELECT {TX_COLUMNS} FROM txes
            WHERE chain_id = $1 AND state = 'confirmed_missing_receipt'
              AND (SELECT MAX(broadcast_before_block_num) FROM tx_attempts
                   WHERE tx_attempts.tx_id = txes.id) < $2
            ORDER BY nonce ASC
            "#
        );
        let txs = self
            .fetch_txs(sqlx::query(&sql).bind(chain_id as i64).bind(cutoff))
            .await?;
        if txs.is_empty() {
            return Ok(txs);
        }

        let ids: Vec<i64> = txs.iter().map(|tx| tx.id).collect();
        sqlx::query(
            r#"
            UPDATE txes
            SET state = 'fatal_error', nonce = NULL, broadcast_at = NULL,
                initial_broadcast_at = NULL, error = $2
            WHERE id = ANY($1) AND state = 'confirmed_missing_receipt'
            "#,
        )
        .bind(&ids)
        .bind(ERR_COULD_NOT_GET_RECEIPT)
        .execute(&self.pool)
        .await?;

        Ok(txs)
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
        let limit = (depth > 0).then_some(depth as i64);

        let sql = format!(
            r#"
            SELECT {TX_COLUMNS} FROM txes
            WHERE txes.id IN (
                SELECT id FROM txes
                WHERE from_address = $1 AND chain_id = $2 AND state = 'unconfirmed'
                ORDER BY nonce ASC
                LIMIT $3
            )
            AND NOT EXISTS (
                SELECT 1 FROM tx_attempts
                WHERE tx_attempts.tx_id = txes.id
                  AND (tx_attempts.state <> 'broadcast'
                       OR tx_attempts.broadcast_before_block_num IS NULL
                       OR tx_attempts.broadcast_before_block_num > $4)
            )
            ORDER BY nonce ASC
            "#
        );
        self.fetch_txs(
            sqlx::query(&sql)
                .bind(from.as_bytes())
                .bind(chain_id as i64)
                .bind(limit)
                .bind(cutoff),
        )
        .await
    }

    async fn find_txs_requiring_resubmission_due_to_insufficient_funds(
        &self,
        from: Address,
        chain_id: u64,
    ) -> TxmResult<Vec<Transaction>> {
        let sql = format!(
            r#"
            SELECT {TX_COLUMNS} FROM txes
            WHERE from_address = $1 AND chain_id = $2 AND state = 'unconfirmed'
              AND EXISTS (
                SELECT 1 FROM tx_attempts
                WHERE tx_attempts.tx_id = txes.id AND tx_attempts.state = 'insufficient_funds'
              )
            ORDER BY nonce ASC
            "#
        );
        self.fetch_txs(sqlx::query(&sql).bind(from.as_bytes()).bind(chain_id as i64))
            .await
    }

    async fn get_in_progress_attempts(
        &self,
        from: Address,
        chain_id: u64,
    ) -> TxmResult<Vec<(Transaction, TxAttempt)>> {
        let sql = format!(
            r#"
            SELECT {TX_COLUMNS} FROM txes
            WHERE from_address = $1 AND chain_id = $2
              AND state IN ('unconfirmed', 'confirmed_missing_receipt')
              AND EXISTS (
                SELECT 1 FROM tx_attempts
                WHERE tx_attempts.tx_id = txes.id AND tx_attempts.state = 'in_progress'
              )
            ORDER BY nonce ASC
            "#
        );
        let txs = self
            .fetch_txs(sqlx::query(&sql).bind(from.as_bytes()).bind(chain_id as i64))
            .await?;

        Ok(txs
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

        let mut dbtx = self.pool.begin().await?;
        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM txes WHERE id = $1 FOR UPDATE")
                .bind(attempt.tx_id)
                .fetch_optional(&mut *dbtx)
                .await?;
        match state.as_deref() {
            Some("unconfirmed") | Some("confirmed_missing_receipt") => {}
            Some(found) => {
                return Err(TxmError::InvalidStateTransition {
                    tx_id: attempt.tx_id,
                    expected: "unconfirmed|confirmed_missing_receipt".to_string(),
                    found: found.to_string(),
                })
            }
            None => return Err(TxmError::TransactionNotFound { tx_id: attempt.tx_id }),
        }

        if attempt.id == 0 {
            insert_attempt(&mut *dbtx, attempt).await?;
        } else {
            let updated = sqlx::query(
                "UPDATE tx_attempts SET state = 'in_progress', broadcast_before_block_num = $2 WHERE id = $1",
            )
            .bind(attempt.id)
            .bind(attempt.broadcast_before_block_num.map(|n| n as i64))
            .execute(&mut *dbtx)
            .await
            .map_err(|e| match constraint_of(&e) {
                Some(UNIQUE_IN_PROGRESS_ATTEMPT) => TxmError::InvariantViolation(format!(
                    "tx {} already has an in-progress attempt",
                    attempt.tx_id
                )),
                _ => TxmError::Database(e),
            })?
            .rows_affected();
            expect_one(updated, || format!("attempt {} not found", attempt.id))?;
        }

        dbtx.commit().await?;
        Ok(())
    }

    async fn save_sent_attempt(&self, attempt: &mut TxAttempt, broadcast_at: DateTime<Utc>) -> TxmResult<()> {
        let mut dbtx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE tx_attempts SET state = 'broadcast' WHERE id = $1 AND state = 'in_progress'",
        )
        .bind(attempt.id)
        .execute(&mut *dbtx)
        .await?
        .rows_affected();
        expect_one(updated, || {
            format!("attempt {} must be in_progress to be marked broadcast", attempt.id)
        })?;

        sqlx::query(
            r#"
            UPDATE txes
            SET broadcast_at = GREATEST(broadcast_at, $2),
                initial_broadcast_at = COALESCE(initial_broadcast_at, $2)
            WHERE id = $1
            "#,
        )
        .bind(attempt.tx_id)
        .bind(broadcast_at)
        .execute(&mut *dbtx)
        .await?;

        dbtx.commit().await?;
        attempt.state = AttemptState::Broadcast;
        Ok(())
    }

    async fn save_insufficient_funds_attempt(
        &self,
        attempt: &mut TxAttempt,
        broadcast_at: DateTime<Utc>,
    ) -> TxmResult<()> {
        let mut dbtx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE tx_attempts SET state = 'insufficient_funds'
            WHERE id = $1 AND state IN ('in_progress', 'insufficient_funds')
            "#,
        )
        .bind(attempt.id)
        .execute(&mut *dbtx)
        .await?
        .rows_affected();
        expect_one(updated, || {
            format!("attempt {} must be in_progress or insufficient_funds", attempt.id)
        })?;

        sqlx::query(
            r#"
            UPDATE txes
            SET broadcast_at = GREATEST(broadcast_at, $2),
                initial_broadcast_at = COALESCE(initial_broadcast_at, $2)
            WHERE id = $1
            "#,
        )
        .bind(attempt.tx_id)
        .bind(broadcast_at)
        .execute(&mut *dbtx)
        .await?;

        dbtx.commit().await?;
        attempt.state = AttemptState::InsufficientFunds;
        Ok(())
    }

    async fn save_confirmed_missing_receipt_attempt(
        &self,
        attempt: &mut TxAttempt,
        broadcast_at: DateTime<Utc>,
    ) -> TxmResult<()> {
        let mut dbtx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE tx_attempts SET state = 'broadcast' WHERE id = $1 AND state = 'in_progress'",
        )
        .bind(attempt.id)
        .execute(&mut *dbtx)
        .await?
        .rows_affected();
        expect_one(updated, || format!("attempt {} must be in_progress", attempt.id))?;

        let updated = sqlx::query(
            r#"
            UPDATE txes
            SET state = 'confirmed_missing_receipt',
                broadcast_at = GREATEST(broadcast_at, $2),
                initial_broadcast_at = COALESCE(initial_broadcast_at, $2)
            WHERE id = $1 AND state IN ('unconfirmed', 'confirmed_missing_receipt')
            "#,
        )
        .bind(attempt.tx_id)
        .bind(broadcast_at)
        .execute(&mut *dbtx)
        .await?
        .rows_affected();
        expect_one(updated, || {
            format!("tx {} must be unconfirmed to be confirmed_missing_receipt", attempt.tx_id)
        })?;

        dbtx.commit().await?;
        attempt.state = AttemptState::Broadcast;
        Ok(())
    }

    async fn delete_in_progress_attempt(&self, attempt: &TxAttempt) -> TxmResult<()> {
        if attempt.state != AttemptState::InProgress || attempt.id == 0 {
            return Err(TxmError::Internal(
                "can only delete a saved in_progress attempt".to_string(),
            ));
        }
        let deleted = sqlx::query("DELETE FROM tx_attempts WHERE id = $1 AND state = 'in_progress'")
            .bind(attempt.id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        expect_one(deleted, || format!("attempt {} is no longer in progress", attempt.id))
    }

    async fn find_confirmed_missing_receipt_txs(&self, chain_id: u64) -> TxmResult<Vec<Transaction>> {
        let sql = format!(
            r#"
            SELECT {TX_COLUMNS} FROM txes
            WHERE chain_id = $1 AND state = 'confirmed_missing_receipt'
            ORDER BY nonce ASC
            "#
        );
        self.fetch_txs(sqlx::query(&sql).bind(chain_id as i64)).await
    }

    async fn update_txs_unconfirmed(&self, ids: &[i64]) -> TxmResult<()> {
        sqlx::query(
            "UPDATE txes SET state = 'unconfirmed' WHERE id = ANY($1) AND state = 'confirmed_missing_receipt'",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_broadcast_ats(&self, at: DateTime<Utc>, ids: &[i64]) -> TxmResult<()> {
        sqlx::query(
            r#"
            UPDATE txes
            SET broadcast_at = GREATEST(broadcast_at, $1),
                initial_broadcast_at = COALESCE(initial_broadcast_at, $1)
            WHERE id = ANY($2)
            "#,
        )
        .bind(at)
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_txs_confirmed_in_block_range(
        &self,
        high: u64,
        low: u64,
        chain_id: u64,
    ) -> TxmResult<Vec<Transaction>> {
        let sql = format!(
            r#"
            SELECT {TX_COLUMNS} FROM txes
            WHERE chain_id = $1 AND state IN ('confirmed', 'confirmed_missing_receipt')
              AND EXISTS (
                SELECT 1 FROM tx_attempts
                JOIN receipts ON receipts.tx_hash = tx_attempts.hash
                WHERE tx_attempts.tx_id = txes.id
                  AND receipts.block_number BETWEEN $2 AND $3
              )
            ORDER BY nonce ASC
            "#
        );
        self.fetch_txs(
            sqlx::query(&sql)
                .bind(chain_id as i64)
                .bind(low as i64)
                .bind(high as i64),
        )
        .await
    }

    async fn mark_for_rebroadcast(&self, tx: &Transaction, attempt: &TxAttempt) -> TxmResult<()> {
        let mut dbtx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM receipts WHERE tx_hash IN (SELECT hash FROM tx_attempts WHERE tx_id = $1)",
        )
        .bind(tx.id)
        .execute(&mut *dbtx)
        .await?;

        let updated = sqlx::query(
            r#"
            UPDATE tx_attempts SET state = 'in_progress', broadcast_before_block_num = NULL
            WHERE id = $1 AND tx_id = $2 AND state = 'broadcast'
            "#,
        )
        .bind(attempt.id)
        .bind(tx.id)
        .execute(&mut *dbtx)
        .await?
        .rows_affected();
        expect_one(updated, || {
            format!("attempt {} must be broadcast to be rebroadcast", attempt.id)
        })?;

        let updated = sqlx::query(
            r#"
            UPDATE txes SET state = 'unconfirmed'
            WHERE id = $1 AND state IN ('confirmed', 'confirmed_missing_receipt')
            "#,
        )
        .bind(tx.id)
        .execute(&mut *dbtx)
        .await?
        .rows_affected();
        if updated != 1 {
            return Err(TxmError::InvalidStateTransition {
                tx_id: tx.id,
                expected: "confirmed|confirmed_missing_receipt".to_string(),
                found: tx.state.to_string(),
            });
        }

        dbtx.commit().await?;
        Ok(())
    }

    async fn find_txs_pending_callback(&self, block_num: u64, chain_id: u64) -> TxmResult<Vec<PendingCallback>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (txes.id)
                txes.id AS tx_id, txes.pipeline_task_run_id,
                receipts.id, receipts.tx_hash, receipts.block_hash, receipts.block_number,
                receipts.transaction_index, receipts.status, receipts.receipt
            FROM txes
            JOIN tx_attempts ON tx_attempts.tx_id = txes.id
            JOIN receipts ON receipts.tx_hash = tx_attempts.hash
            WHERE txes.chain_id = $2
              AND txes.state = 'confirmed'
              AND txes.pipeline_task_run_id IS NOT NULL
              AND txes.signal_callback
              AND NOT txes.callback_completed
              AND receipts.block_number <= ($1 - COALESCE(txes.min_confirmations, 0))
            ORDER BY txes.id, receipts.block_number ASC
            "#,
        )
        .bind(block_num as i64)
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PendingCallback {
                    tx_id: row.try_get("tx_id")?,
                    pipeline_task_run_id: row.try_get("pipeline_task_run_id")?,
                    receipt: receipt_from_row(row)?,
                })
            })
            .collect()
    }

    async fn update_tx_callback_completed(&self, pipeline_task_run_id: Uuid, chain_id: u64) -> TxmResult<()> {
        let updated = sqlx::query(
            "UPDATE txes SET callback_completed = TRUE WHERE pipeline_task_run_id = $1 AND chain_id = $2",
        )
        .bind(pipeline_task_run_id)
        .bind(chain_id as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(TxmError::Store(format!(
                "no tx found with pipeline_task_run_id {}",
                pipeline_task_run_id
            )));
        }
        Ok(())
    }

    async fn find_attempts_requiring_resend(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
        chain_id: u64,
    ) -> TxmResult<Vec<TxAttempt>> {
        let limit = (limit > 0).then_some(limit as i64);
        let rows = sqlx::query(&format!(
            r#"
            SELECT * FROM (
                SELECT DISTINCT ON (txes.id) {ATTEMPT_COLUMNS}, txes.nonce
                FROM tx_attempts
                JOIN txes ON txes.id = tx_attempts.tx_id
                WHERE txes.chain_id = $2
                  AND txes.state = 'unconfirmed'
                  AND tx_attempts.state = 'broadcast'
                  AND txes.broadcast_at < $1
                ORDER BY txes.id, COALESCE(tx_attempts.gas_price, tx_attempts.tip_cap) DESC
            ) latest
            ORDER BY nonce ASC
            LIMIT $3
            "#
        ))
        .bind(older_than)
        .bind(chain_id as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(attempt_from_row).collect()
    }

    async fn reap_txs(
        &self,
        min_block_to_keep: u64,
        older_than: DateTime<Utc>,
        chain_id: u64,
    ) -> TxmResult<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM txes
            WHERE chain_id = $3 AND created_at < $2
              AND (
                state = 'fatal_error'
                OR (
                  state = 'confirmed'
                  AND EXISTS (
                    SELECT 1 FROM tx_attempts JOIN receipts ON receipts.tx_hash = tx_attempts.hash
                    WHERE tx_attempts.tx_id = txes.id
                  )
                  AND NOT EXISTS (
                    SELECT 1 FROM tx_attempts JOIN receipts ON receipts.tx_hash = tx_attempts.hash
                    WHERE tx_attempts.tx_id = txes.id AND receipts.block_number >= $1
                  )
                )
              )
            "#,
        )
        .bind(min_block_to_keep as i64)
        .bind(older_than)
        .bind(chain_id as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_decoders_reject_bad_lengths() {
        assert!(address(vec![0u8; 19]).is_err());
        assert_eq!(address(vec![0x11; 20]).unwrap(), Address::repeat_byte(0x11));
        assert!(hash(vec![0u8; 20]).is_err());
        assert_eq!(
            numeric("115792089237316195423570985008687907853269984665640564039457584007913129639935").unwrap(),
            U256::MAX
        );
        assert!(numeric("1.5").is_err());
    }

    #[test]
    fn test_expect_one() {
        assert!(expect_one(1, || "x".to_string()).is_ok());
        assert!(matches!(expect_one(0, || "gone".to_string()), Err(TxmError::Store(_))));
    }
}
