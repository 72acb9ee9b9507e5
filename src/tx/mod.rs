//! Transaction lifecycle: nonce assignment, signing, broadcast, confirmation and housekeeping

pub mod attempt;
pub mod backoff;
pub mod broadcaster;
pub mod callback;
pub mod checker;
pub mod confirmer;
pub mod gas;
pub mod models;
pub mod nonce;
pub mod reaper;
pub mod resender;

pub use attempt::AttemptBuilder;
pub use broadcaster::Broadcaster;
pub use callback::{ResumeCallback, ResumeError};
pub use checker::{CheckerError, NoopChecker, SimulateChecker, TransmitChecker};
pub use confirmer::{Confirmer, ConfirmerOptions};
pub use gas::FeeEstimator;
pub use models::{NewTransaction, Transaction, TxAttempt, TxState, TxStrategy};
pub use nonce::NonceTracker;
pub use reaper::Reaper;
pub use resender::Resender;
