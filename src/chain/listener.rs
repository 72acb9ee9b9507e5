//! Head tracker: polls for new blocks and keeps a canonical chain of recent headers

use super::{BlockHeader, ChainClient, Head};
use crate::error::TxmResult;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Publishes the latest canonical head, linked to its parents, via a watch channel
pub struct HeadTracker {
    client: Arc<dyn ChainClient>,
    history_depth: usize,
    poll_interval: Duration,
    /// Newest first, contiguous by parent hash
    headers: RwLock<Vec<BlockHeader>>,
    head_tx: watch::Sender<Option<Arc<Head>>>,
}

impl HeadTracker {
    pub fn new(client: Arc<dyn ChainClient>, history_depth: u64, poll_interval: Duration) -> Self {
        let (head_tx, _) = watch::channel(None);
        Self {
            client,
            history_depth: history_depth.max(1) as usize,
            poll_interval,
            headers: RwLock::new(Vec::new()),
            head_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Head>>> {
        self.head_tx.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<Head>> {
        self.head_tx.borrow().clone()
    }

    /// Main polling loop
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Head tracker started for chain {} (history depth {})",
            self.client.configured_chain_id(),
            self.history_depth
        );

        loop {
            if let Err(e) = self.poll_once().await {
                warn!("Failed to poll latest head: {}", e);
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Head tracker stopping");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Fetches the latest block; publishes and returns it when it is a new head
    pub async fn poll_once(&self) -> TxmResult<Option<Arc<Head>>> {
        let latest = self.client.latest_header().await?;

        let previous = self.headers.read().await.clone();
        if previous.first().map(|h| h.hash) == Some(latest.hash) {
            return Ok(None);
        }

        let chain = self.extend_chain(latest, &previous).await?;

        if let Some(old_tip) = previous.first() {
            let still_canonical = chain
                .iter()
                .any(|h| h.hash == old_tip.hash && h.number == old_tip.number);
            if !still_canonical {
                warn!(
                    "Reorg detected: previous head {} ({:?}) is no longer canonical, new head {} ({:?})",
                    old_tip.number, old_tip.hash, latest.number, latest.hash
                );
            }
        }

        *self.headers.write().await = chain.clone();

        let head = match Head::from_headers(&chain) {
            Some(head) => Arc::new(head),
            None => return Ok(None),
        };
        debug!(
            "New head {} ({:?}), chain length {}",
            head.number,
            head.hash,
            head.chain_length()
        );
        crate::metrics::record_head(self.client.configured_chain_id(), head.number);
        self.head_tx.send_replace(Some(head.clone()));

        Ok(Some(head))
    }

    /// Walks parent hashes from `latest` until it rejoins the known chain or hits the depth
    async fn extend_chain(
        &self,
        latest: BlockHeader,
        previous: &[BlockHeader],
    ) -> TxmResult<Vec<BlockHeader>> {
        let known: HashMap<_, usize> = previous
            .iter()
            .enumerate()
            .map(|(i, h)| (h.hash, i))
            .collect();

        let mut chain = vec![latest];
        let mut cursor = latest;
        while chain.len() < self.history_depth && cursor.number > 0 {
            if let Some(&idx) = known.get(&cursor.parent_hash) {
                chain.extend_from_slice(&previous[idx..]);
                break;
            }
            match self.client.header_by_hash(cursor.parent_hash).await? {
                Some(parent) => {
                    chain.push(parent);
                    cursor = parent;
                }
                None => break,
            }
        }

        chain.truncate(self.history_depth);
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use ethers::types::H256;
    use std::sync::Mutex;

    fn header(number: u64, hash: u64, parent: u64) -> BlockHeader {
        BlockHeader {
            number,
            hash: H256::from_low_u64_be(hash),
            parent_hash: H256::from_low_u64_be(parent),
            base_fee_per_gas: None,
        }
    }

    fn tracker_with(blocks: Vec<BlockHeader>, tips: Vec<BlockHeader>) -> HeadTracker {
        let mut client = MockChainClient::new();
        client.expect_configured_chain_id().return_const(1337u64);
        let tips = Arc::new(Mutex::new(tips));
        client.expect_latest_header().returning(move || {
            let mut tips = tips.lock().unwrap();
            Ok(tips.remove(0))
        });
        client
            .expect_header_by_hash()
            .returning(move |hash| Ok(blocks.iter().find(|b| b.hash == hash).copied()));
        HeadTracker::new(Arc::new(client), 4, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_builds_chain_on_first_poll() {
        let blocks = vec![header(9, 109, 108), header(8, 108, 107), header(7, 107, 106)];
        let tracker = tracker_with(blocks, vec![header(10, 110, 109)]);
        let mut rx = tracker.subscribe();

        let head = tracker.poll_once().await.unwrap().unwrap();
        assert_eq!(head.number, 10);
        assert_eq!(head.chain_length(), 4);
        assert_eq!(head.earliest_in_chain().number, 7);

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().number, 10);
    }

    #[tokio::test]
    async fn test_reorg_replaces_evicted_block() {
        // 11a replaces 11, then 12 builds on 11a
        let blocks = vec![
            header(10, 110, 109),
            header(9, 109, 108),
            header(8, 108, 107),
            header(11, 1110, 110),
        ];
        let tracker = tracker_with(
            blocks,
            vec![header(11, 111, 110), header(12, 112, 1110), header(12, 112, 1110)],
        );

        tracker.poll_once().await.unwrap().unwrap();
        let head = tracker.poll_once().await.unwrap().unwrap();
        assert_eq!(head.number, 12);
        assert!(head.is_in_chain(H256::from_low_u64_be(1110), 11));
        assert!(!head.is_in_chain(H256::from_low_u64_be(111), 11));
        assert!(head.is_in_chain(H256::from_low_u64_be(110), 10));

        // Same tip again is not a new head
        assert!(tracker.poll_once().await.unwrap().is_none());
    }
}
