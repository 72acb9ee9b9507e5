//! Broadcaster: drains each account's unstarted queue, one tx at a time
//!
//! Every tx is persisted in_progress with its signed attempt before it goes out,
//! so a crash between persisting and sending is recovered by resending the same
//! attempt on the next pass.

use super::attempt::AttemptBuilder;
use super::backoff::Backoff;
use super::callback::{ResumeCallback, ResumeError};
use super::checker::{CheckerError, NoopChecker, TransmitChecker};
use super::models::{Transaction, TxAttempt};
use super::nonce::NonceTracker;
use crate::chain::{send_with_timeout, ChainClient, SendResultCode};
use crate::config::BroadcasterConfig;
use crate::error::{TxmError, TxmResult};
use crate::store::TxStore;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::types::Address;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

const RETRY_BACKOFF_MIN: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(15);

pub struct Broadcaster {
    chain_id: u64,
    store: Arc<dyn TxStore>,
    client: Arc<dyn ChainClient>,
    builder: Arc<AttemptBuilder>,
    nonces: Arc<NonceTracker>,
    checker: Arc<dyn TransmitChecker>,
    resume_callback: Option<Arc<dyn ResumeCallback>>,
    config: BroadcasterConfig,
    max_in_flight: u32,
    /// One coalescing trigger per account
    triggers: DashMap<Address, Arc<Notify>>,
}

impl Broadcaster {
    pub fn new(
        chain_id: u64,
        store: Arc<dyn TxStore>,
        client: Arc<dyn ChainClient>,
        builder: Arc<AttemptBuilder>,
        nonces: Arc<NonceTracker>,
        config: BroadcasterConfig,
        max_in_flight: u32,
    ) -> Self {
        Self {
            chain_id,
            store,
            client,
            builder,
            nonces,
            checker: Arc::new(NoopChecker),
            resume_callback: None,
            config,
            max_in_flight,
            triggers: DashMap::new(),
        }
    }

    pub fn with_checker(mut self, checker: Arc<dyn TransmitChecker>) -> Self {
        self.checker = checker;
        self
    }

    pub fn with_resume_callback(mut self, callback: Arc<dyn ResumeCallback>) -> Self {
        self.resume_callback = Some(callback);
        self
    }

    /// Wakes the account's worker; repeated triggers before it runs collapse into one
    pub fn trigger(&self, address: Address) {
        self.trigger_for(address).notify_one();
    }

    fn trigger_for(&self, address: Address) -> Arc<Notify> {
        self.triggers
            .entry(address)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Runs one worker per account until shutdown
    pub async fn run(self: Arc<Self>, addresses: Vec<Address>, shutdown: watch::Receiver<bool>) {
        info!(
            "Broadcaster started for chain {} with {} accounts",
            self.chain_id,
            addresses.len()
        );

        let workers = addresses.into_iter().map(|address| {
            let broadcaster = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { broadcaster.monitor_account(address, shutdown).await })
        });
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!("Broadcaster worker panicked: {}", e);
            }
        }
        info!("Broadcaster stopped");
    }

    async fn monitor_account(&self, address: Address, mut shutdown: watch::Receiver<bool>) {
        let notify = self.trigger_for(address);
        let mut backoff = Backoff::new(RETRY_BACKOFF_MIN, RETRY_BACKOFF_MAX);

        loop {
            match self.process_unstarted_txs(address).await {
                Ok(()) => backoff.reset(),
                Err(e) if e.is_retryable() => {
                    let delay = backoff.next_delay();
                    warn!("Broadcast for {:?} will retry in {:?}: {}", address, delay, e);
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                Err(e) => {
                    error!("Broadcast for {:?} failed and needs operator attention: {}", address, e);
                    backoff.reset();
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return,
                _ = notify.notified() => {}
                _ = tokio::time::sleep(self.config.fallback_poll_interval()) => {}
            }
        }
    }

    /// Broadcasts every unstarted tx for `address` in order. A retryable error means the
    /// account should be re-driven soon.
    pub async fn process_unstarted_txs(&self, address: Address) -> TxmResult<()> {
        if let Some(tx) = self.store.find_in_progress(address, self.chain_id).await? {
            let attempt = tx.attempts.first().cloned().ok_or_else(|| {
                TxmError::InvariantViolation(format!("in-progress tx {} has no attempt", tx.id))
            })?;
            info!(
                "Resuming in-progress tx {} from {:?} with nonce {:?} (attempt {:?})",
                tx.id, address, tx.sequence, attempt.hash
            );
            let created_at = tx.created_at;
            self.handle_in_progress_tx(tx, attempt, created_at).await?;
        }

        loop {
            if self.max_in_flight > 0 {
                let in_flight = self
                    .store
                    .count_unconfirmed_transactions(address, self.chain_id)
                    .await?;
                if in_flight >= self.max_in_flight {
                    return Err(TxmError::MaxInFlight {
                        address,
                        in_flight,
                        max: self.max_in_flight,
                    });
                }
            }

            let mut tx = match self.store.find_oldest_unstarted(address, self.chain_id).await? {
                Some(tx) => tx,
                None => return Ok(()),
            };

            let nonce = self.nonces.get_next_sequence(address).await?;
            tx.sequence = Some(nonce);
            let mut attempt = self.builder.new_attempt(&tx).await?;

            match self
                .store
                .move_unstarted_to_in_progress(&mut tx, &mut attempt)
                .await
            {
                Ok(()) => {}
                Err(TxmError::TxRemoved { tx_id }) => {
                    debug!("Tx {} was removed before it could be started", tx_id);
                    continue;
                }
                Err(e) => return Err(e),
            }
            debug!(
                "Tx {} from {:?} is in progress with nonce {} (attempt {:?}, {})",
                tx.id, address, nonce, attempt.hash, attempt.fee
            );

            self.handle_in_progress_tx(tx, attempt, Utc::now()).await?;
        }
    }

    async fn handle_in_progress_tx(
        &self,
        mut tx: Transaction,
        mut attempt: TxAttempt,
        initial_broadcast_at: DateTime<Utc>,
    ) -> TxmResult<()> {
        let address = tx.from_address;
        let nonce = tx.sequence.ok_or_else(|| {
            TxmError::InvariantViolation(format!("in-progress tx {} has no nonce", tx.id))
        })?;

        match tokio::time::timeout(
            self.config.transmit_check_timeout(),
            self.checker.check(&tx, &attempt),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(CheckerError::Veto(reason))) => {
                warn!(
                    "Transmit check vetoed tx {} from {:?} (nonce {}): {}",
                    tx.id, address, nonce, reason
                );
                tx.error = Some(reason);
                return self.save_fatally_errored(&mut tx, "transmit_check").await;
            }
            Ok(Err(CheckerError::Unknown(reason))) => {
                warn!("Transmit check for tx {} inconclusive, sending anyway: {}", tx.id, reason);
            }
            Err(_) => {
                warn!("Transmit check for tx {} timed out, sending anyway", tx.id);
            }
        }

        loop {
            let result =
                send_with_timeout(self.client.as_ref(), &attempt.signed_raw_tx, self.config.send_timeout()).await;

            match result.code {
                SendResultCode::Successful
                | SendResultCode::TransactionAlreadyKnown
                | SendResultCode::NonceTooLow => {
                    if result.code != SendResultCode::Successful {
                        debug!(
                            "Send of tx {} (nonce {}) returned {}: {}; treating as broadcast",
                            tx.id, nonce, result.code, result.message
                        );
                    }
                    return self
                        .save_broadcast(&mut tx, &mut attempt, initial_broadcast_at)
                        .await;
                }
                SendResultCode::Fatal => {
                    error!(
                        "Fatal error sending tx {} from {:?} (nonce {}, attempt {:?}): {}",
                        tx.id, address, nonce, attempt.hash, result.message
                    );
                    tx.error = Some(result.message);
                    return self.save_fatally_errored(&mut tx, "send").await;
                }
                SendResultCode::Underpriced => {
                    let mut bumped = match self.builder.new_bumped_attempt(&tx, &attempt).await {
                        Ok(bumped) => bumped,
                        Err(e @ TxmError::FeeBumpConfig { .. }) => {
                            error!(
                                "Tx {} from {:?} (nonce {}) is underpriced and cannot be bumped: {}",
                                tx.id, address, nonce, e
                            );
                            return Err(e);
                        }
                        Err(e) => {
                            if matches!(e, TxmError::FeeBumpExceedsLimit { .. }) {
                                crate::metrics::record_gas_bump_exceeds_limit(self.chain_id);
                            }
                            return Err(e);
                        }
                    };
                    warn!(
                        "Tx {} (nonce {}) underpriced at {}, retrying at {}: {}",
                        tx.id, nonce, attempt.fee, bumped.fee, result.message
                    );
                    self.store
                        .save_replacement_in_progress_attempt(&attempt, &mut bumped)
                        .await?;
                    crate::metrics::record_gas_bump(self.chain_id);
                    tx.attempts = vec![bumped.clone()];
                    attempt = bumped;
                }
                SendResultCode::InsufficientFunds => {
                    error!(
                        "Account {:?} is out of funds for tx {} (nonce {}, attempt {:?}, {}): {}",
                        address, tx.id, nonce, attempt.hash, attempt.fee, result.message
                    );
                    return Err(TxmError::InsufficientFunds {
                        tx_id: tx.id,
                        address,
                        nonce,
                        message: result.message,
                    });
                }
                SendResultCode::ExceedsMaxFee | SendResultCode::Retryable => {
                    if self.chain_nonce_passed(address, nonce).await {
                        info!(
                            "Send of tx {} (nonce {}) failed with {} but the chain has moved past it; treating as broadcast",
                            tx.id, nonce, result.code
                        );
                        return self
                            .save_broadcast(&mut tx, &mut attempt, initial_broadcast_at)
                            .await;
                    }
                    return Err(if result.code == SendResultCode::ExceedsMaxFee {
                        TxmError::ExceedsMaxFee {
                            tx_id: tx.id,
                            address,
                            nonce,
                            message: result.message,
                        }
                    } else {
                        TxmError::SendFailed {
                            tx_id: tx.id,
                            address,
                            nonce,
                            hash: attempt.hash,
                            message: result.message,
                        }
                    });
                }
            }
        }
    }

    async fn chain_nonce_passed(&self, address: Address, nonce: u64) -> bool {
        match self.client.pending_nonce_at(address).await {
            Ok(pending) => pending > nonce,
            Err(e) => {
                warn!("Pending nonce lookup for {:?} failed: {}", address, e);
                false
            }
        }
    }

    async fn save_broadcast(
        &self,
        tx: &mut Transaction,
        attempt: &mut TxAttempt,
        initial_broadcast_at: DateTime<Utc>,
    ) -> TxmResult<()> {
        let address = tx.from_address;
        let nonce = tx.sequence.unwrap_or_default();
        tx.broadcast_at = Some(initial_broadcast_at);
        tx.initial_broadcast_at = Some(initial_broadcast_at);

        let increment = || self.nonces.generate_next_sequence(address, nonce);
        self.store
            .move_in_progress_to_broadcast(tx, attempt, &increment)
            .await?;

        let since_created = (initial_broadcast_at - tx.created_at).num_milliseconds() as f64 / 1000.0;
        crate::metrics::record_broadcast(self.chain_id, since_created);
        info!(
            "Broadcast tx {} from {:?} with nonce {} (attempt {:?}, {})",
            tx.id, address, nonce, attempt.hash, attempt.fee
        );
        Ok(())
    }

    /// Resumes the waiting run with the error, then persists the tx as fatal.
    /// The nonce is released since nothing with it reached the chain.
    async fn save_fatally_errored(&self, tx: &mut Transaction, reason: &str) -> TxmResult<()> {
        let error = tx.error.clone().unwrap_or_default();
        let nonce = tx.sequence;

        if let (Some(run_id), Some(callback)) = (tx.pipeline_task_run_id, &self.resume_callback) {
            match callback
                .resume(
                    run_id,
                    None,
                    Some(format!("fatal error while sending transaction: {}", error)),
                )
                .await
            {
                Ok(()) => {}
                Err(ResumeError::NotFound(_)) => {
                    debug!("Callback for tx {} missing or already resumed", tx.id);
                }
                Err(e) => {
                    return Err(TxmError::ResumeCallback(format!(
                        "failed to resume run {} for tx {}: {}",
                        run_id, tx.id, e
                    )))
                }
            }
        }

        self.store.update_tx_fatal_error(tx).await?;
        // A tx recovered at startup was already counted when the tracker was seeded
        if let Some(nonce) = nonce {
            self.nonces.release(tx.from_address, nonce);
        }
        crate::metrics::record_fatal(self.chain_id, reason);
        error!("Tx {} from {:?} is fatally errored: {}", tx.id, tx.from_address, error);
        Ok(())
    }
}
