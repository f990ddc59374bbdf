//! Finality tracking of escrow deployment transactions
//!
//! A deployment is final once the chain head is at least
//! `confirmation_blocks` past the block that included it and the
//! transaction is still reported successful (reorg protection).

use super::{ChainAdapter, ChainFamily};
use crate::error::{CoordinatorError, CoordinatorResult};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Tracks finality for transactions on one chain
pub struct FinalityTracker {
    family: ChainFamily,
    /// Required confirmation blocks
    confirmation_blocks: u64,
    adapter: Arc<dyn ChainAdapter>,
    /// Pending transactions: tx_hash -> block_number
    pending: RwLock<HashMap<String, u64>>,
    /// Finalized transactions (cached to avoid re-checking)
    finalized: RwLock<HashMap<String, u64>>,
}

impl FinalityTracker {
    pub fn new(
        family: ChainFamily,
        confirmation_blocks: u64,
        adapter: Arc<dyn ChainAdapter>,
    ) -> Self {
        Self {
            family,
            confirmation_blocks,
            adapter,
            pending: RwLock::new(HashMap::new()),
            finalized: RwLock::new(HashMap::new()),
        }
    }

    /// Track a new transaction for finality
    pub async fn track(&self, tx_hash: &str, block_number: u64) {
        self.pending
            .write()
            .await
            .insert(tx_hash.to_string(), block_number);
        debug!(
            "Tracking tx {} for finality on {} (block {})",
            tx_hash, self.family, block_number
        );
    }

    /// Check if a transaction has reached finality.
    ///
    /// A transaction the chain does not know yet is not final; one that
    /// disappears or fails after reaching the confirmation depth is a reorg.
    pub async fn is_finalized(&self, tx_hash: &str, sender: &str) -> CoordinatorResult<bool> {
        if self.finalized.read().await.contains_key(tx_hash) {
            return Ok(true);
        }

        let current_block = self.adapter.get_block_number().await?;

        let tracked = self.pending.read().await.get(tx_hash).copied();
        let tx_block = match tracked {
            Some(block) => block,
            None => match self.adapter.get_transaction(tx_hash, sender).await? {
                Some(status) if status.success => {
                    self.track(tx_hash, status.block_number).await;
                    status.block_number
                }
                Some(_) => {
                    warn!("Transaction {} failed on {}", tx_hash, self.family);
                    return Ok(false);
                }
                None => {
                    debug!("Transaction {} not yet visible on {}", tx_hash, self.family);
                    return Ok(false);
                }
            },
        };

        let confirmations = current_block.saturating_sub(tx_block);
        if confirmations < self.confirmation_blocks {
            debug!(
                "Transaction {} has {} / {} confirmations on {}",
                tx_hash, confirmations, self.confirmation_blocks, self.family
            );
            return Ok(false);
        }

        // Verify the transaction is still included
        match self.adapter.get_transaction(tx_hash, sender).await? {
            Some(status) if status.success => {
                self.pending.write().await.remove(tx_hash);
                self.finalized
                    .write()
                    .await
                    .insert(tx_hash.to_string(), status.block_number);
                info!(
                    "Transaction {} finalized on {} ({} confirmations)",
                    tx_hash, self.family, confirmations
                );
                Ok(true)
            }
            _ => {
                warn!(
                    "Reorg detected: tx {} no longer included on {}",
                    tx_hash, self.family
                );
                self.pending.write().await.remove(tx_hash);
                Err(CoordinatorError::ReorgDetected {
                    chain: self.family.to_string(),
                    tx_hash: tx_hash.to_string(),
                })
            }
        }
    }

    /// Get pending transaction count
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Forget a transaction once its order is finished
    pub async fn forget(&self, tx_hash: &str) {
        self.pending.write().await.remove(tx_hash);
        self.finalized.write().await.remove(tx_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainAdapter, TxStatus};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn tracker(adapter: MockChainAdapter) -> FinalityTracker {
        FinalityTracker::new(ChainFamily::Evm, 12, Arc::new(adapter))
    }

    #[tokio::test]
    async fn test_finalizes_after_confirmation_depth() {
        let head = Arc::new(AtomicU64::new(105));
        let head_reader = head.clone();

        let mut adapter = MockChainAdapter::new();
        adapter
            .expect_get_block_number()
            .returning(move || Ok(head_reader.load(Ordering::SeqCst)));
        adapter.expect_get_transaction().returning(|_, _| {
            Ok(Some(TxStatus {
                block_number: 100,
                success: true,
            }))
        });
        let tracker = tracker(adapter);

        assert!(!tracker.is_finalized("0xabc", "").await.unwrap());
        assert_eq!(tracker.pending_count().await, 1);

        head.store(112, Ordering::SeqCst);
        assert!(tracker.is_finalized("0xabc", "").await.unwrap());
        assert_eq!(tracker.pending_count().await, 0);
        // Cached
        assert!(tracker.is_finalized("0xabc", "").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_not_final() {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_get_block_number().returning(|| Ok(500));
        adapter.expect_get_transaction().returning(|_, _| Ok(None));

        assert!(!tracker(adapter).is_finalized("0xdef", "").await.unwrap());
    }

    #[tokio::test]
    async fn test_reorg_detected() {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_get_block_number().returning(|| Ok(500));
        adapter.expect_get_transaction().returning(|_, _| Ok(None));
        let tracker = tracker(adapter);
        tracker.track("0x123", 100).await;

        assert!(matches!(
            tracker.is_finalized("0x123", "").await,
            Err(CoordinatorError::ReorgDetected { .. })
        ));
    }
}
