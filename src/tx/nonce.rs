//! Nonce tracking for reliable transaction submission
//!
//! Handles:
//! - Seeding the next usable nonce per account from the store, falling back to the chain
//! - Lazy resolution for accounts that failed to load at startup
//! - Advancing after a broadcast without double-incrementing recovered txs
//! - Advisory reconciliation with the chain's pending nonce

use super::backoff::Backoff;
use crate::chain::ChainClient;
use crate::error::{TxmError, TxmResult};
use crate::store::TxStore;

use ethers::types::Address;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const SYNC_BACKOFF_MIN: Duration = Duration::from_millis(100);
const SYNC_BACKOFF_MAX: Duration = Duration::from_secs(5);
/// Sync failures past this many attempts are logged at error level
const SYNC_LOUD_AFTER: u32 = 5;

/// Next usable nonce per enabled account
pub struct NonceTracker {
    store: Arc<dyn TxStore>,
    client: Arc<dyn ChainClient>,
    chain_id: u64,
    enabled: HashSet<Address>,
    next_sequences: RwLock<HashMap<Address, u64>>,
}

impl NonceTracker {
    pub fn new(
        store: Arc<dyn TxStore>,
        client: Arc<dyn ChainClient>,
        chain_id: u64,
        enabled_addresses: Vec<Address>,
    ) -> Self {
        Self {
            store,
            client,
            chain_id,
            enabled: enabled_addresses.into_iter().collect(),
            next_sequences: RwLock::new(HashMap::new()),
        }
    }

    /// Seed every account; one account failing leaves it to be resolved lazily
    pub async fn load_next_sequences(&self, addresses: &[Address]) {
        for &address in addresses {
            match self.fetch_next_sequence(address).await {
                Ok(next) => {
                    self.write().insert(address, next);
                    info!("Loaded next nonce {} for {:?}", next, address);
                }
                Err(e) => {
                    warn!(
                        "Failed to load next nonce for {:?}, will resolve on first use: {}",
                        address, e
                    );
                }
            }
        }
    }

    /// Next nonce to assign to `address`
    pub async fn get_next_sequence(&self, address: Address) -> TxmResult<u64> {
        if let Some(next) = self.read().get(&address).copied() {
            return Ok(next);
        }

        if !self.enabled.contains(&address) {
            return Err(TxmError::AddressDisabled { address });
        }

        let fetched = self.fetch_next_sequence(address).await?;
        // A concurrent load may have won the race; keep whichever arrived first
        let next = *self.write().entry(address).or_insert(fetched);
        debug!("Resolved next nonce {} for {:?} lazily", next, address);
        Ok(next)
    }

    /// Advances past `used` after it was broadcast
    pub fn generate_next_sequence(&self, address: Address, used: u64) {
        let mut map = self.write();
        let expected = used + 1;
        match map.get(&address).copied() {
            Some(current) if current == used => {
                map.insert(address, expected);
            }
            Some(current) if current == expected => {}
            Some(current) if current > expected => {
                warn!(
                    "Nonce tracker for {:?} is at {} after broadcasting nonce {}; keeping the higher value",
                    address, current, used
                );
            }
            Some(current) => {
                warn!(
                    "Nonce tracker for {:?} was behind at {} after broadcasting nonce {}; moving to {}",
                    address, current, used, expected
                );
                map.insert(address, expected);
            }
            None => {
                map.insert(address, expected);
            }
        }
    }

    /// Hands `nonce` back after its tx errored before reaching the chain.
    /// Only lowers the tracker when nothing was assigned past `nonce`.
    pub fn release(&self, address: Address, nonce: u64) {
        let mut map = self.write();
        if map.get(&address).copied() == Some(nonce + 1) {
            map.insert(address, nonce);
            debug!("Released nonce {} for {:?}", nonce, address);
        }
    }

    /// Raises the tracked nonce to the chain's pending nonce when it is ahead of `local_floor`.
    /// Retries with backoff until it succeeds or `shutdown` fires.
    pub async fn sync_on_chain(
        &self,
        address: Address,
        local_floor: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> TxmResult<u64> {
        let mut backoff = Backoff::new(SYNC_BACKOFF_MIN, SYNC_BACKOFF_MAX);

        let chain_nonce = loop {
            if *shutdown.borrow() {
                return Err(TxmError::Shutdown);
            }
            match self.client.pending_nonce_at(address).await {
                Ok(nonce) => break nonce,
                Err(e) => {
                    let delay = backoff.next_delay();
                    if backoff.attempt() > SYNC_LOUD_AFTER {
                        error!(
                            "Nonce sync for {:?} still failing after {} attempts: {}",
                            address,
                            backoff.attempt(),
                            e
                        );
                    } else {
                        warn!("Nonce sync for {:?} failed, retrying in {:?}: {}", address, delay, e);
                    }
                    tokio::select! {
                        _ = shutdown.changed() => return Err(TxmError::Shutdown),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        let target = local_floor.max(chain_nonce);
        let mut map = self.write();
        let entry = map.entry(address).or_insert(target);
        if *entry < target {
            info!(
                "Nonce for {:?} advanced from {} to {} after chain sync",
                address, *entry, target
            );
            *entry = target;
        }
        Ok(*entry)
    }

    /// Highest stored nonce + 1, else the chain's pending nonce
    async fn fetch_next_sequence(&self, address: Address) -> TxmResult<u64> {
        match self.store.find_highest_sequence(address, self.chain_id).await? {
            Some(highest) => Ok(highest + 1),
            None => self
                .client
                .pending_nonce_at(address)
                .await
                .map_err(|e| TxmError::Nonce {
                    address,
                    message: format!("pending nonce lookup failed: {}", e),
                }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Address, u64>> {
        self.next_sequences
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Address, u64>> {
        self.next_sequences
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::store::MemoryTxStore;
    use crate::tx::models::{NewTransaction, Transaction, TxState, TxStrategy};
    use ethers::types::{Bytes, U256};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CHAIN_ID: u64 = 1337;

    fn account(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    async fn store_with_nonce(from: Address, nonce: u64) -> Arc<MemoryTxStore> {
        let store = Arc::new(MemoryTxStore::new());
        let mut tx = Transaction::unstarted(
            CHAIN_ID,
            &NewTransaction {
                from_address: from,
                to_address: account(0xee),
                encoded_payload: Bytes::default(),
                value: U256::zero(),
                fee_limit: 21_000,
                strategy: TxStrategy::SendEvery,
                min_confirmations: None,
                pipeline_task_run_id: None,
                signal_callback: false,
            },
        );
        tx.state = TxState::Confirmed;
        tx.sequence = Some(nonce);
        store.insert_transaction(tx).await;
        store
    }

    #[tokio::test]
    async fn test_load_prefers_store_then_chain() {
        let store = store_with_nonce(account(1), 6).await;
        let mut client = MockChainClient::new();
        client
            .expect_pending_nonce_at()
            .returning(|address| {
                if address == Address::repeat_byte(2) {
                    Ok(3)
                } else {
                    Err(TxmError::ChainConnection {
                        chain_id: CHAIN_ID,
                        message: "down".to_string(),
                    })
                }
            });

        let tracker = NonceTracker::new(
            store,
            Arc::new(client),
            CHAIN_ID,
            vec![account(1), account(2), account(3)],
        );
        tracker
            .load_next_sequences(&[account(1), account(2), account(3)])
            .await;

        assert_eq!(tracker.get_next_sequence(account(1)).await.unwrap(), 7);
        assert_eq!(tracker.get_next_sequence(account(2)).await.unwrap(), 3);
        // Account 3 failed to load and still fails lazily without poisoning the others
        assert!(tracker.get_next_sequence(account(3)).await.is_err());
    }

    #[tokio::test]
    async fn test_lazy_resolution_only_for_enabled_addresses() {
        let mut client = MockChainClient::new();
        client.expect_pending_nonce_at().returning(|_| Ok(11));
        let tracker = NonceTracker::new(
            Arc::new(MemoryTxStore::new()),
            Arc::new(client),
            CHAIN_ID,
            vec![account(1)],
        );

        assert_eq!(tracker.get_next_sequence(account(1)).await.unwrap(), 11);
        let err = tracker.get_next_sequence(account(9)).await.unwrap_err();
        assert!(matches!(err, TxmError::AddressDisabled { .. }));
    }

    #[tokio::test]
    async fn test_generate_next_sequence_never_double_increments() {
        let mut client = MockChainClient::new();
        client.expect_pending_nonce_at().returning(|_| Ok(5));
        let tracker = NonceTracker::new(
            Arc::new(MemoryTxStore::new()),
            Arc::new(client),
            CHAIN_ID,
            vec![account(1)],
        );
        assert_eq!(tracker.get_next_sequence(account(1)).await.unwrap(), 5);

        tracker.generate_next_sequence(account(1), 5);
        assert_eq!(tracker.get_next_sequence(account(1)).await.unwrap(), 6);

        // Recovered tx already counted
        tracker.generate_next_sequence(account(1), 5);
        assert_eq!(tracker.get_next_sequence(account(1)).await.unwrap(), 6);

        // Ahead stays ahead
        tracker.generate_next_sequence(account(1), 2);
        assert_eq!(tracker.get_next_sequence(account(1)).await.unwrap(), 6);

        // Behind moves up
        tracker.generate_next_sequence(account(1), 9);
        assert_eq!(tracker.get_next_sequence(account(1)).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_release_only_undoes_the_latest_nonce() {
        let store = store_with_nonce(account(1), 5).await;
        let tracker = NonceTracker::new(store, Arc::new(MockChainClient::new()), CHAIN_ID, vec![account(1)]);
        tracker.load_next_sequences(&[account(1)]).await;
        assert_eq!(tracker.get_next_sequence(account(1)).await.unwrap(), 6);

        // Something newer was assigned already
        tracker.release(account(1), 3);
        assert_eq!(tracker.get_next_sequence(account(1)).await.unwrap(), 6);

        tracker.release(account(1), 5);
        assert_eq!(tracker.get_next_sequence(account(1)).await.unwrap(), 5);

        // Never assigned, nothing to undo
        tracker.release(account(1), 5);
        assert_eq!(tracker.get_next_sequence(account(1)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_sync_on_chain_retries_and_only_raises() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut client = MockChainClient::new();
        client.expect_pending_nonce_at().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TxmError::ChainConnection {
                    chain_id: CHAIN_ID,
                    message: "timeout".to_string(),
                })
            } else {
                Ok(8)
            }
        });
        let tracker = NonceTracker::new(
            Arc::new(MemoryTxStore::new()),
            Arc::new(client),
            CHAIN_ID,
            vec![account(1)],
        );
        let (_stop, shutdown) = watch::channel(false);

        assert_eq!(
            tracker.sync_on_chain(account(1), 4, shutdown.clone()).await.unwrap(),
            8
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Local floor above the chain wins
        tracker.generate_next_sequence(account(1), 11);
        assert_eq!(
            tracker.sync_on_chain(account(1), 12, shutdown).await.unwrap(),
            12
        );
    }

    #[tokio::test]
    async fn test_sync_on_chain_stops_on_shutdown() {
        let mut client = MockChainClient::new();
        client.expect_pending_nonce_at().returning(|_| {
            Err(TxmError::ChainConnection {
                chain_id: CHAIN_ID,
                message: "down".to_string(),
            })
        });
        let tracker = NonceTracker::new(
            Arc::new(MemoryTxStore::new()),
            Arc::new(client),
            CHAIN_ID,
            vec![account(1)],
        );
        let (stop, shutdown) = watch::channel(false);

        let handle = tokio::spawn(async move { tracker.sync_on_chain(account(1), 0, shutdown).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send_replace(true);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(TxmError::Shutdown)));
    }
}
