//! Confirmation tracking for submitted ledger writes
//!
//! A write is durable only once its transaction has enough confirmations and
//! is still included in the canonical chain. Until then the submission may be
//! dropped and retried by a later coordinator tick.

use crate::error::{EngineError, EngineResult};
use crate::ledger::types::{PendingWrite, WriteReceipt};

use super::LedgerProvider;

use ethers::types::H256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Polls submitted writes until they reach the configured confirmation depth
pub struct ConfirmationTracker {
    confirmation_blocks: u64,
    provider: Arc<LedgerProvider>,
    /// Settled outcomes, cached to avoid re-checking
    settled: RwLock<HashMap<H256, WriteReceipt>>,
}

impl ConfirmationTracker {
    pub fn new(confirmation_blocks: u64, provider: Arc<LedgerProvider>) -> Self {
        Self {
            confirmation_blocks,
            provider,
            settled: RwLock::new(HashMap::new()),
        }
    }

    /// Block until the write confirms or reverts, with a bounded wait
    pub async fn wait_confirmed(&self, write: &PendingWrite) -> EngineResult<WriteReceipt> {
        let poll = Duration::from_secs(2);
        // Roughly confirmation depth plus slack, at ~12s block time
        let max_attempts = (self.confirmation_blocks + 10) * 10;

        for _ in 0..max_attempts {
            match self.check(write.tx_hash).await? {
                Some(receipt) => return Ok(receipt),
                None => tokio::time::sleep(poll).await,
            }
        }

        Err(EngineError::Timeout {
            operation: format!("confirmation of write {:?}", write.tx_hash),
        })
    }

    /// Single confirmation probe; `None` means still pending
    pub async fn check(&self, tx_hash: H256) -> EngineResult<Option<WriteReceipt>> {
        if let Some(receipt) = self.settled.read().await.get(&tx_hash) {
            return Ok(Some(receipt.clone()));
        }

        let Some(receipt) = self.provider.get_transaction_receipt(tx_hash).await? else {
            return Ok(None);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };

        let current_block = self.provider.get_block_number().await?;
        let confirmations = current_block.saturating_sub(block_number.as_u64());

        if confirmations < self.confirmation_blocks {
            debug!(
                "Write {:?} has {} / {} confirmations",
                tx_hash, confirmations, self.confirmation_blocks
            );
            return Ok(None);
        }

        // Re-fetch to guard against a reorg between depth check and answer
        let still_included = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await?
            .and_then(|r| r.block_number)
            .is_some();
        if !still_included {
            warn!("Reorg dropped write {:?}; treating as unsubmitted", tx_hash);
            return Ok(None);
        }

        let success = receipt.status == Some(1.into());
        let settled = WriteReceipt {
            tx_hash,
            block_number: block_number.as_u64(),
            success,
        };

        if success {
            info!(
                "Write {:?} confirmed at block {} ({} confirmations)",
                tx_hash, settled.block_number, confirmations
            );
        } else {
            warn!("Write {:?} reverted at block {}", tx_hash, settled.block_number);
        }

        self.settled.write().await.insert(tx_hash, settled.clone());
        Ok(Some(settled))
    }

    /// Clear old cache entries (call periodically)
    pub async fn cleanup_cache(&self, max_entries: usize) {
        let mut settled = self.settled.write().await;
        if settled.len() > max_entries {
            let to_remove: Vec<_> = settled.keys().take(settled.len() / 2).cloned().collect();
            for k in to_remove {
                settled.remove(&k);
            }
        }
    }
}
