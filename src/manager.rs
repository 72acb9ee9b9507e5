//! Transaction manager: the public entry point that wires every service for one chain

use crate::chain::{ChainClient, HeadTracker};
use crate::config::TxmConfig;
use crate::error::{TxmError, TxmResult};
use crate::keystore::Keystore;
use crate::store::TxStore;
use crate::tx::{
    AttemptBuilder, Broadcaster, Confirmer, ConfirmerOptions, FeeEstimator, NewTransaction,
    NonceTracker, Reaper, Resender, ResumeCallback, SimulateChecker, Transaction,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct TxManager {
    config: TxmConfig,
    store: Arc<dyn TxStore>,
    client: Arc<dyn ChainClient>,
    keystore: Arc<dyn Keystore>,
    nonces: Arc<NonceTracker>,
    broadcaster: Arc<Broadcaster>,
    confirmer: Arc<Confirmer>,
    head_tracker: Arc<HeadTracker>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TxManager {
    pub fn new(
        config: TxmConfig,
        store: Arc<dyn TxStore>,
        client: Arc<dyn ChainClient>,
        keystore: Arc<dyn Keystore>,
        resume_callback: Option<Arc<dyn ResumeCallback>>,
    ) -> Self {
        let chain_id = config.chain_id;
        let addresses = keystore.enabled_addresses();

        let estimator = Arc::new(FeeEstimator::new(client.clone(), config.fee.clone(), config.eip1559));
        let builder = Arc::new(AttemptBuilder::new(keystore.clone(), estimator, chain_id));
        let nonces = Arc::new(NonceTracker::new(
            store.clone(),
            client.clone(),
            chain_id,
            addresses.clone(),
        ));

        let mut broadcaster = Broadcaster::new(
            chain_id,
            store.clone(),
            client.clone(),
            builder.clone(),
            nonces.clone(),
            config.broadcaster.clone(),
            config.max_in_flight,
        );
        if config.broadcaster.simulate_before_send {
            broadcaster = broadcaster.with_checker(Arc::new(SimulateChecker::new(client.clone())));
        }

        let mut confirmer = Confirmer::new(
            chain_id,
            store.clone(),
            client.clone(),
            builder,
            addresses,
            ConfirmerOptions::from_config(&config),
        );
        if let Some(callback) = resume_callback {
            broadcaster = broadcaster.with_resume_callback(callback.clone());
            confirmer = confirmer.with_resume_callback(callback);
        }

        let head_tracker = Arc::new(HeadTracker::new(
            client.clone(),
            config.effective_history_depth(),
            config.head_poll_interval(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            store,
            client,
            keystore,
            nonces,
            broadcaster: Arc::new(broadcaster),
            confirmer: Arc::new(confirmer),
            head_tracker,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn TxStore> {
        self.store.clone()
    }

    pub fn client(&self) -> Arc<dyn ChainClient> {
        self.client.clone()
    }

    /// Queues a transaction and wakes its account's broadcaster
    pub async fn create_transaction(&self, request: NewTransaction) -> TxmResult<Transaction> {
        let from = request.from_address;
        if !self.keystore.enabled_addresses().contains(&from) {
            return Err(TxmError::AddressDisabled { address: from });
        }

        if self.config.max_queued > 0 {
            let queued = self
                .store
                .count_unstarted_transactions(from, self.config.chain_id)
                .await?;
            if queued >= self.config.max_queued {
                warn!(
                    "Rejecting tx from {:?}: {} unstarted txs queued (max {})",
                    from, queued, self.config.max_queued
                );
                return Err(TxmError::QueueFull {
                    address: from,
                    queued,
                    max: self.config.max_queued,
                });
            }
        }

        let tx = self
            .store
            .insert_unstarted(self.config.chain_id, &request)
            .await?;
        debug!("Queued tx {} from {:?} to {:?}", tx.id, from, tx.to_address);
        self.broadcaster.trigger(from);
        Ok(tx)
    }

    /// Seeds nonces and spawns every background service
    pub async fn start(&self) -> TxmResult<()> {
        let chain_id = self.config.chain_id;
        let configured = self.client.configured_chain_id();
        if configured != chain_id {
            return Err(TxmError::Config(format!(
                "txm.chain_id is {} but the chain client is configured for {}",
                chain_id, configured
            )));
        }

        let addresses = self.keystore.enabled_addresses();
        self.nonces.load_next_sequences(&addresses).await;

        let mut handles = self.handles.lock().await;
        let shutdown = self.shutdown_tx.subscribe();

        if self.config.auto_sync_nonce {
            for &address in &addresses {
                let nonces = self.nonces.clone();
                let shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    let floor = match nonces.get_next_sequence(address).await {
                        Ok(next) => next,
                        Err(e) => {
                            warn!("Skipping nonce sync for {:?}: {}", address, e);
                            return;
                        }
                    };
                    match nonces.sync_on_chain(address, floor, shutdown).await {
                        Ok(next) => debug!("Nonce for {:?} synced, next is {}", address, next),
                        Err(TxmError::Shutdown) => {}
                        Err(e) => warn!("Nonce sync for {:?} failed: {}", address, e),
                    }
                }));
            }
        }

        handles.push(tokio::spawn({
            let tracker = self.head_tracker.clone();
            let shutdown = shutdown.clone();
            async move { tracker.run(shutdown).await }
        }));

        handles.push(tokio::spawn({
            let broadcaster = self.broadcaster.clone();
            broadcaster.run(addresses.clone(), shutdown.clone())
        }));

        handles.push(tokio::spawn({
            let confirmer = self.confirmer.clone();
            let heads = self.head_tracker.subscribe();
            let shutdown = shutdown.clone();
            async move { confirmer.run(heads, shutdown).await }
        }));

        if self.config.resender.enabled {
            let resender = Resender::new(
                chain_id,
                self.store.clone(),
                self.client.clone(),
                Duration::from_secs(self.config.resender.interval_secs),
                Duration::from_secs(self.config.resender.resend_after_secs),
                self.config.rpc_batch_size,
                self.config.max_in_flight,
                self.config.broadcaster.send_timeout(),
            );
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { resender.run(shutdown).await }));
        }

        if self.config.reaper.enabled {
            let reaper = Reaper::new(
                chain_id,
                self.store.clone(),
                self.head_tracker.subscribe(),
                self.config.effective_finality_depth(),
                Duration::from_secs(self.config.reaper.interval_secs),
                Duration::from_secs(self.config.reaper.threshold_secs),
            );
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { reaper.run(shutdown).await }));
        }

        info!(
            "Transaction manager started for chain {} with {} accounts (finality depth {})",
            chain_id,
            addresses.len(),
            self.config.effective_finality_depth()
        );
        Ok(())
    }

    /// Signals every service to stop and waits for them
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Service task failed during shutdown: {}", e);
            }
        }
        info!("Transaction manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::config::{
        BroadcasterConfig, ConfirmerConfig, FeeConfig, FeeEstimatorMode, ReaperConfig,
        ResenderConfig,
    };
    use crate::keystore::{LocalKeystore, TEST_PRIVATE_KEY};
    use crate::store::MemoryTxStore;
    use crate::tx::TxStrategy;
    use ethers::types::{Address, Bytes, U256};
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    const CHAIN_ID: u64 = 1337;

    fn config(max_queued: u32) -> TxmConfig {
        TxmConfig {
            chain_id: CHAIN_ID,
            eip1559: false,
            finality_depth: 10,
            history_depth: 10,
            rpc_batch_size: 10,
            max_in_flight: 0,
            max_queued,
            auto_sync_nonce: false,
            head_poll_interval_ms: 1_000,
            fee: FeeConfig {
                mode: FeeEstimatorMode::Fixed,
                price_default_wei: 1_000_000_000,
                price_min_wei: 0,
                price_max_wei: 10_000_000_000,
                tip_cap_default_wei: 0,
                tip_cap_min_wei: 0,
                bump_percent: 20,
                bump_min_wei: 0,
                bump_threshold: 3,
                bump_tx_depth: 0,
                limit_multiplier: 1.0,
            },
            broadcaster: BroadcasterConfig::default(),
            confirmer: ConfirmerConfig::default(),
            resender: ResenderConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }

    fn manager(max_queued: u32) -> (TxManager, Arc<MemoryTxStore>, Address) {
        let keystore = LocalKeystore::from_private_keys(TEST_PRIVATE_KEY, vec![]).unwrap();
        let from = keystore.enabled_addresses()[0];
        let store = Arc::new(MemoryTxStore::new());
        let mut client = MockChainClient::new();
        client.expect_configured_chain_id().return_const(CHAIN_ID);
        let manager = TxManager::new(
            config(max_queued),
            store.clone(),
            Arc::new(client),
            Arc::new(keystore),
            None,
        );
        (manager, store, from)
    }

    fn request(from: Address, strategy: TxStrategy) -> NewTransaction {
        NewTransaction {
            from_address: from,
            to_address: Address::repeat_byte(0x42),
            encoded_payload: Bytes::from(vec![0xca, 0xfe]),
            value: U256::from(1),
            fee_limit: 21_000,
            strategy,
            min_confirmations: None,
            pipeline_task_run_id: None,
            signal_callback: false,
        }
    }

    #[tokio::test]
    async fn test_create_transaction_respects_queue_limit() {
        let (manager, store, from) = manager(2);

        assert_ok!(manager.create_transaction(request(from, TxStrategy::SendEvery)).await);
        assert_ok!(manager.create_transaction(request(from, TxStrategy::SendEvery)).await);
        let err = assert_err!(manager.create_transaction(request(from, TxStrategy::SendEvery)).await);
        assert!(matches!(err, TxmError::QueueFull { queued: 2, max: 2, .. }));

        assert_eq!(store.count_unstarted_transactions(from, CHAIN_ID).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_create_transaction_rejects_unknown_address() {
        let (manager, _, _) = manager(0);
        let err = assert_err!(
            manager
                .create_transaction(request(Address::repeat_byte(9), TxStrategy::SendEvery))
                .await
        );
        assert!(matches!(err, TxmError::AddressDisabled { .. }));
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest_per_subject() {
        let (manager, store, from) = manager(0);
        let subject = Uuid::new_v4();
        let strategy = TxStrategy::DropOldest {
            subject,
            queue_size: 2,
        };

        let first = assert_ok!(manager.create_transaction(request(from, strategy)).await);
        let second = assert_ok!(manager.create_transaction(request(from, strategy)).await);
        let third = assert_ok!(manager.create_transaction(request(from, strategy)).await);

        assert!(store.find_transaction(first.id).await.unwrap().is_none());
        assert!(store.find_transaction(second.id).await.unwrap().is_some());
        assert!(store.find_transaction(third.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_rejects_mismatched_chain() {
        let keystore = LocalKeystore::from_private_keys(TEST_PRIVATE_KEY, vec![]).unwrap();
        let mut client = MockChainClient::new();
        client.expect_configured_chain_id().return_const(1u64);
        let manager = TxManager::new(
            config(0),
            Arc::new(MemoryTxStore::new()),
            Arc::new(client),
            Arc::new(keystore),
            None,
        );

        assert!(matches!(manager.start().await, Err(TxmError::Config(_))));
    }
}
