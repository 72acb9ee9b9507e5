//! Transaction lifecycle manager for EVM chains
//!
//! Assigns nonces, signs and broadcasts transactions, bumps fees on stuck
//! attempts, tracks receipts through reorgs and reaps finished records.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod keystore;
pub mod manager;
pub mod metrics;
pub mod store;
pub mod tx;

pub use error::{TxmError, TxmResult};
pub use manager::TxManager;
