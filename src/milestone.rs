//! Milestone completion tracking
//!
//! Guards the sequential completion invariant defensively before submitting
//! the write; the ledger remains the final authority either way. When the
//! last milestone confirms, an `AllComplete` notification is handed to the
//! settlement pipeline.

use crate::error::{EngineError, EngineResult};
use crate::ledger::types::{ContractProgress, MILESTONE_COUNT};
use crate::ledger::TenderLedger;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Raised when every milestone on a contract is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllComplete {
    pub contract_id: u64,
}

/// Tracks per-contract milestone completion
pub struct MilestoneTracker {
    ledger: Arc<dyn TenderLedger>,
    /// Settlement queue fed on all-complete
    settlement_tx: mpsc::Sender<AllComplete>,
}

impl MilestoneTracker {
    pub fn new(ledger: Arc<dyn TenderLedger>, settlement_tx: mpsc::Sender<AllComplete>) -> Self {
        Self {
            ledger,
            settlement_tx,
        }
    }

    /// Mark milestone `index` of the contract as completed.
    ///
    /// Rejects unless `index` is the first incomplete milestone in order.
    /// Returns the contract's progress as read back after confirmation.
    pub async fn complete(&self, contract_id: u64, index: u8) -> EngineResult<ContractProgress> {
        if index >= MILESTONE_COUNT {
            return Err(EngineError::MilestoneIndex { contract_id, index });
        }

        let before = self.ledger.contract_progress(contract_id).await?;
        let expected = before.completed as u8;
        if index != expected {
            return Err(EngineError::MilestoneOrder {
                contract_id,
                expected,
                got: index,
            });
        }

        let pending = self.ledger.complete_milestone(contract_id, index).await?;
        let receipt = self.ledger.wait_confirmed(&pending).await?;
        if !receipt.success {
            return Err(EngineError::WriteReverted {
                tx_hash: format!("{:?}", receipt.tx_hash),
            });
        }

        let progress = self.ledger.contract_progress(contract_id).await?;
        info!(
            "Contract {} milestone {} completed ({}/{})",
            contract_id, index, progress.completed, progress.total
        );
        crate::metrics::record_milestone_completed();

        if progress.all_complete() {
            info!("Contract {} fully complete, queueing settlement", contract_id);
            if let Err(e) = self
                .settlement_tx
                .send(AllComplete { contract_id })
                .await
            {
                // Settlement also listens for the ledger's own
                // AllMilestonesCompleted event, so this is not fatal
                warn!(
                    "Settlement queue unavailable for contract {}: {}",
                    contract_id, e
                );
            }
        }

        Ok(progress)
    }
}
