//! Error types for the transaction manager

use ethers::types::{Address, H256};
use thiserror::Error;

/// Main error type for the transaction manager
#[derive(Error, Debug)]
pub enum TxmError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operator's bump settings can never produce a higher fee.
    #[error("Fee bump configuration error: {message} (fix `{knob}`)")]
    FeeBumpConfig { knob: String, message: String },

    #[error("Fee bump ceiling reached: bumped fee {bumped} would exceed max price {max} (fix `txm.fee.price_max_wei`)")]
    FeeBumpExceedsLimit { bumped: String, max: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Send failed for tx {tx_id} (from {address:?}, nonce {nonce}, attempt {hash:?}): {message}")]
    SendFailed {
        tx_id: i64,
        address: Address,
        nonce: u64,
        hash: H256,
        message: String,
    },

    #[error("Insufficient funds for tx {tx_id} (from {address:?}, nonce {nonce}): {message}")]
    InsufficientFunds {
        tx_id: i64,
        address: Address,
        nonce: u64,
        message: String,
    },

    #[error("Fee exceeds the node's configured maximum for tx {tx_id} (from {address:?}, nonce {nonce}): {message}")]
    ExceedsMaxFee {
        tx_id: i64,
        address: Address,
        nonce: u64,
        message: String,
    },

    #[error("Address {address:?} is disabled or not in the keystore")]
    AddressDisabled { address: Address },

    #[error("Nonce error for {address:?}: {message}")]
    Nonce { address: Address, message: String },

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Resume callback error: {0}")]
    ResumeCallback(String),

    #[error("Max in flight reached for {address:?}: {in_flight}/{max} unconfirmed transactions")]
    MaxInFlight {
        address: Address,
        in_flight: u32,
        max: u32,
    },

    #[error("Cannot create transaction; too many unstarted transactions in the queue for {address:?} ({queued}/{max})")]
    QueueFull {
        address: Address,
        queued: u32,
        max: u32,
    },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Transaction {tx_id} was removed before it could be started")]
    TxRemoved { tx_id: i64 },

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: i64 },

    #[error("Invalid state transition for tx {tx_id}: expected {expected}, found {found}")]
    InvalidStateTransition {
        tx_id: i64,
        expected: String,
        found: String,
    },

    #[error("Another transaction is already in progress for {address:?} on chain {chain_id}")]
    InProgressConflict { address: Address, chain_id: u64 },

    #[error("Nonce {nonce} is already used by another transaction for {address:?}")]
    NonceConflict { address: Address, nonce: u64 },

    #[error("Store invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Shutting down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TxmError {
    /// Whether the operation should be re-driven soon rather than treated as final
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxmError::Database(_)
                | TxmError::Store(_)
                | TxmError::ChainConnection { .. }
                | TxmError::SendFailed { .. }
                | TxmError::InsufficientFunds { .. }
                | TxmError::ExceedsMaxFee { .. }
                | TxmError::FeeBumpExceedsLimit { .. }
                | TxmError::Nonce { .. }
                | TxmError::Signer(_)
                | TxmError::ResumeCallback(_)
                | TxmError::MaxInFlight { .. }
                | TxmError::Timeout { .. }
                | TxmError::InvalidStateTransition { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            TxmError::Config(_)
                | TxmError::FeeBumpConfig { .. }
                | TxmError::InsufficientFunds { .. }
                | TxmError::InProgressConflict { .. }
                | TxmError::NonceConflict { .. }
                | TxmError::InvariantViolation(_)
        )
    }
}

/// Result type for transaction manager operations
pub type TxmResult<T> = Result<T, TxmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let addr = Address::zero();
        assert!(TxmError::Timeout {
            operation: "send".into()
        }
        .is_retryable());
        assert!(TxmError::InsufficientFunds {
            tx_id: 1,
            address: addr,
            nonce: 0,
            message: "insufficient funds".into(),
        }
        .is_retryable());
        assert!(TxmError::ResumeCallback("boom".into()).is_retryable());

        let config = TxmError::FeeBumpConfig {
            knob: "txm.fee.bump_percent".into(),
            message: "bump is zero".into(),
        };
        assert!(!config.is_retryable());
        assert!(config.should_alert());
        assert!(config.to_string().contains("txm.fee.bump_percent"));

        let invariant = TxmError::InvariantViolation("two in-progress attempts".into());
        assert!(!invariant.is_retryable());
        assert!(invariant.should_alert());
    }
}
