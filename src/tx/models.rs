//! Transaction, attempt and receipt records shared by every service

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Unstarted,
    InProgress,
    Unconfirmed,
    Confirmed,
    ConfirmedMissingReceipt,
    FatalError,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Unstarted => "unstarted",
            TxState::InProgress => "in_progress",
            TxState::Unconfirmed => "unconfirmed",
            TxState::Confirmed => "confirmed",
            TxState::ConfirmedMissingReceipt => "confirmed_missing_receipt",
            TxState::FatalError => "fatal_error",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unstarted" => Ok(TxState::Unstarted),
            "in_progress" => Ok(TxState::InProgress),
            "unconfirmed" => Ok(TxState::Unconfirmed),
            "confirmed" => Ok(TxState::Confirmed),
            "confirmed_missing_receipt" => Ok(TxState::ConfirmedMissingReceipt),
            "fatal_error" => Ok(TxState::FatalError),
            other => Err(format!("unknown tx state {other}")),
        }
    }
}

/// State of a single signed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    InProgress,
    Broadcast,
    InsufficientFunds,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::InProgress => "in_progress",
            AttemptState::Broadcast => "broadcast",
            AttemptState::InsufficientFunds => "insufficient_funds",
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(AttemptState::InProgress),
            "broadcast" => Ok(AttemptState::Broadcast),
            "insufficient_funds" => Ok(AttemptState::InsufficientFunds),
            other => Err(format!("unknown attempt state {other}")),
        }
    }
}

/// Fee offered by an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fee {
    Legacy { gas_price: U256 },
    /// EIP-1559 tip cap and fee cap
    Dynamic { tip_cap: U256, fee_cap: U256 },
}

impl Fee {
    /// Value that decides mempool priority, used to order attempts
    pub fn priority(&self) -> U256 {
        match self {
            Fee::Legacy { gas_price } => *gas_price,
            Fee::Dynamic { tip_cap, .. } => *tip_cap,
        }
    }

    /// Highest per-gas price this fee could ever pay
    pub fn max_price(&self) -> U256 {
        match self {
            Fee::Legacy { gas_price } => *gas_price,
            Fee::Dynamic { fee_cap, .. } => *fee_cap,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Fee::Dynamic { .. })
    }
}

impl fmt::Display for Fee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fee::Legacy { gas_price } => write!(f, "gasPrice={gas_price}"),
            Fee::Dynamic { tip_cap, fee_cap } => write!(f, "tipCap={tip_cap} feeCap={fee_cap}"),
        }
    }
}

/// Receipt recorded against the attempt whose hash it matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: i64,
    pub tx_hash: H256,
    pub block_hash: H256,
    pub block_number: u64,
    pub transaction_index: u64,
    /// 1 = success, 0 = reverted, None on pre-byzantium chains
    pub status: Option<u64>,
    pub raw: serde_json::Value,
}

impl Receipt {
    /// Converts a chain receipt, returning None when it is not yet mined into a block
    pub fn from_chain(receipt: &TransactionReceipt) -> Option<Self> {
        let block_hash = receipt.block_hash?;
        let block_number = receipt.block_number?.as_u64();
        if block_hash.is_zero() {
            return None;
        }
        Some(Self {
            id: 0,
            tx_hash: receipt.transaction_hash,
            block_hash,
            block_number,
            transaction_index: receipt.transaction_index.as_u64(),
            status: receipt.status.map(|s| s.as_u64()),
            raw: serde_json::to_value(receipt).unwrap_or(serde_json::Value::Null),
        })
    }

    pub fn is_reverted(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxAttempt {
    pub id: i64,
    pub tx_id: i64,
    pub fee: Fee,
    pub chain_specific_gas_limit: u64,
    pub signed_raw_tx: Bytes,
    pub hash: H256,
    pub state: AttemptState,
    /// First head seen after the attempt was sent; never overwritten once set
    pub broadcast_before_block_num: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub receipts: Vec<Receipt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub chain_id: u64,
    pub from_address: Address,
    pub to_address: Address,
    pub encoded_payload: Bytes,
    pub value: U256,
    pub fee_limit: u64,
    pub sequence: Option<u64>,
    pub state: TxState,
    pub error: Option<String>,
    pub broadcast_at: Option<DateTime<Utc>>,
    pub initial_broadcast_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub subject: Option<Uuid>,
    pub min_confirmations: Option<u32>,
    pub pipeline_task_run_id: Option<Uuid>,
    pub signal_callback: bool,
    pub callback_completed: bool,
    /// Ordered by fee, highest first
    pub attempts: Vec<TxAttempt>,
}

impl Transaction {
    pub fn highest_priced_attempt(&self) -> Option<&TxAttempt> {
        self.attempts.first()
    }

    pub fn sort_attempts(&mut self) {
        sort_attempts_by_fee(&mut self.attempts);
    }

    /// Tx as seen before any attempt exists, used by fixtures and the memory store
    pub fn unstarted(chain_id: u64, request: &NewTransaction) -> Self {
        Self {
            id: 0,
            chain_id,
            from_address: request.from_address,
            to_address: request.to_address,
            encoded_payload: request.encoded_payload.clone(),
            value: request.value,
            fee_limit: request.fee_limit,
            sequence: None,
            state: TxState::Unstarted,
            error: None,
            broadcast_at: None,
            initial_broadcast_at: None,
            created_at: Utc::now(),
            subject: request.strategy.subject(),
            min_confirmations: request.min_confirmations,
            pipeline_task_run_id: request.pipeline_task_run_id,
            signal_callback: request.signal_callback,
            callback_completed: false,
            attempts: Vec::new(),
        }
    }
}

/// Highest fee first; ties broken by newest attempt
pub fn sort_attempts_by_fee(attempts: &mut [TxAttempt]) {
    attempts.sort_by(|a, b| {
        b.fee
            .priority()
            .cmp(&a.fee.priority())
            .then_with(|| b.fee.max_price().cmp(&a.fee.max_price()))
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Queueing strategy applied when a transaction is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum TxStrategy {
    #[default]
    SendEvery,
    /// Keep at most `queue_size` unstarted txs for `subject`, dropping the oldest
    DropOldest { subject: Uuid, queue_size: u32 },
}

impl TxStrategy {
    pub fn subject(&self) -> Option<Uuid> {
        match self {
            TxStrategy::SendEvery => None,
            TxStrategy::DropOldest { subject, .. } => Some(*subject),
        }
    }

    /// Number of existing unstarted txs to keep before inserting a new one
    pub fn prune_to(&self) -> Option<(Uuid, u32)> {
        match self {
            TxStrategy::SendEvery => None,
            TxStrategy::DropOldest {
                subject,
                queue_size,
            } => Some((*subject, queue_size.saturating_sub(1))),
        }
    }
}

/// Request to send a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    pub from_address: Address,
    pub to_address: Address,
    pub encoded_payload: Bytes,
    pub value: U256,
    pub fee_limit: u64,
    #[serde(default)]
    pub strategy: TxStrategy,
    pub min_confirmations: Option<u32>,
    pub pipeline_task_run_id: Option<Uuid>,
    #[serde(default)]
    pub signal_callback: bool,
}

/// Confirmed tx whose callback is due
#[derive(Debug, Clone)]
pub struct PendingCallback {
    pub tx_id: i64,
    pub pipeline_task_run_id: Uuid,
    pub receipt: Receipt,
}

/// Transaction counts per state
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransactionStats {
    pub unstarted: u64,
    pub in_progress: u64,
    pub unconfirmed: u64,
    pub confirmed: u64,
    pub confirmed_missing_receipt: u64,
    pub fatal_error: u64,
}

impl TransactionStats {
    pub fn record(&mut self, state: TxState, count: u64) {
        match state {
            TxState::Unstarted => self.unstarted += count,
            TxState::InProgress => self.in_progress += count,
            TxState::Unconfirmed => self.unconfirmed += count,
            TxState::Confirmed => self.confirmed += count,
            TxState::ConfirmedMissingReceipt => self.confirmed_missing_receipt += count,
            TxState::FatalError => self.fatal_error += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U64;

    fn attempt(id: i64, fee: Fee) -> TxAttempt {
        TxAttempt {
            id,
            tx_id: 1,
            fee,
            chain_specific_gas_limit: 21_000,
            signed_raw_tx: Bytes::default(),
            hash: H256::from_low_u64_be(id as u64),
            state: AttemptState::Broadcast,
            broadcast_before_block_num: None,
            created_at: Utc::now(),
            receipts: vec![],
        }
    }

    #[test]
    fn test_attempts_sorted_highest_fee_first() {
        let mut attempts = vec![
            attempt(1, Fee::Legacy { gas_price: U256::from(10) }),
            attempt(2, Fee::Legacy { gas_price: U256::from(30) }),
            attempt(3, Fee::Legacy { gas_price: U256::from(20) }),
        ];
        sort_attempts_by_fee(&mut attempts);
        let ids: Vec<i64> = attempts.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_receipt_without_block_hash_is_ignored() {
        let pending = TransactionReceipt {
            transaction_hash: H256::from_low_u64_be(1),
            block_hash: None,
            block_number: None,
            ..Default::default()
        };
        assert!(Receipt::from_chain(&pending).is_none());

        let mined = TransactionReceipt {
            transaction_hash: H256::from_low_u64_be(1),
            block_hash: Some(H256::from_low_u64_be(99)),
            block_number: Some(U64::from(12)),
            status: Some(U64::from(0)),
            ..Default::default()
        };
        let receipt = Receipt::from_chain(&mined).unwrap();
        assert_eq!(receipt.block_number, 12);
        assert!(receipt.is_reverted());
    }

    #[test]
    fn test_drop_oldest_keeps_room_for_new_tx() {
        let subject = Uuid::new_v4();
        let strategy = TxStrategy::DropOldest {
            subject,
            queue_size: 3,
        };
        assert_eq!(strategy.prune_to(), Some((subject, 2)));
        assert_eq!(TxStrategy::SendEvery.prune_to(), None);
    }
}
