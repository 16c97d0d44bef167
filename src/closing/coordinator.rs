//! Closing coordinator: drives the close-and-award transition

use crate::error::{EngineError, EngineResult};
use crate::ledger::types::{TenderStatus, TenderView};
use crate::ledger::TenderLedger;
use crate::mirror::Replica;
use crate::selector::select_winner;

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Informational per-tender phase; re-derived from the ledger on every tick,
/// never used to decide whether a close may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosingPhase {
    Waiting,
    Eligible,
    Closing,
    Closed,
}

/// One coordinator replica.
///
/// Replicas are stateless with respect to correctness: every tick re-reads
/// eligibility from the ledger, and losing the close race to another replica
/// (or an entirely separate process) is an expected, deterministic outcome.
pub struct ClosingCoordinator {
    replica_id: String,
    ledger: Arc<dyn TenderLedger>,
    replica: Arc<dyn Replica>,
    /// Contract period written into close-and-award, starting at closing time
    contract_term_secs: u64,
    phases: DashMap<u64, ClosingPhase>,
}

impl ClosingCoordinator {
    pub fn new(
        replica_id: String,
        ledger: Arc<dyn TenderLedger>,
        replica: Arc<dyn Replica>,
        contract_term_secs: u64,
    ) -> Self {
        Self {
            replica_id,
            ledger,
            replica,
            contract_term_secs,
            phases: DashMap::new(),
        }
    }

    /// Current informational phase for a tender
    pub fn phase(&self, tender_id: u64) -> Option<ClosingPhase> {
        self.phases.get(&tender_id).map(|p| *p)
    }

    /// One scheduler tick: evaluate every open tender and attempt eligible
    /// closes. Individual tender failures are logged and retried next tick.
    pub async fn tick(&self) -> EngineResult<()> {
        let now = Utc::now().timestamp() as u64;
        let open = self.ledger.open_tenders().await?;

        for tender_id in open {
            if let Err(e) = self.evaluate(tender_id, now).await {
                if e.is_retryable() {
                    warn!(
                        "[{}] Tender {} evaluation failed, retrying next tick: {}",
                        self.replica_id, tender_id, e
                    );
                } else {
                    warn!(
                        "[{}] Tender {} evaluation failed: {}",
                        self.replica_id, tender_id, e
                    );
                }
                crate::metrics::record_close_failure();
            }
        }

        Ok(())
    }

    async fn evaluate(&self, tender_id: u64, now: u64) -> EngineResult<()> {
        let tender = self.ledger.tender(tender_id).await?;

        if tender.status != TenderStatus::Open {
            // Someone else already moved it; nothing to do
            self.phases.insert(tender_id, ClosingPhase::Closed);
            return Ok(());
        }

        if now < tender.window_end {
            self.phases.insert(tender_id, ClosingPhase::Waiting);
            return Ok(());
        }

        self.phases.insert(tender_id, ClosingPhase::Eligible);

        let eligibility = self.ledger.can_close(tender_id).await?;
        if !eligibility.eligible {
            // Ineligible transitions are reported, never force-retried; the
            // next tick re-evaluates from scratch
            debug!(
                "[{}] Tender {} not closeable: {}",
                self.replica_id, tender_id, eligibility.reason
            );
            return Ok(());
        }

        self.close(&tender, now).await
    }

    async fn close(&self, tender: &TenderView, now: u64) -> EngineResult<()> {
        // Informational pre-check: compute the expected winner off-ledger so
        // the ledger's own selection can be verified after the fact
        let bids = self.ledger.tender_bids(tender.id).await?;
        let preview = select_winner(&bids).map(|bid| bid.id);
        info!(
            "[{}] Closing tender {} ({} bids, expected winner {:?})",
            self.replica_id,
            tender.id,
            bids.len(),
            preview
        );

        self.phases.insert(tender.id, ClosingPhase::Closing);
        crate::metrics::record_close_attempt();

        let contract_start = now;
        let contract_end = now + self.contract_term_secs;

        let pending = match self
            .ledger
            .close_and_award(tender.id, contract_start, contract_end)
            .await
        {
            Ok(pending) => pending,
            Err(EngineError::LedgerRejected { reason }) => {
                // Deterministic rejection: another writer won the race or the
                // tender became ineligible between read and write
                info!(
                    "[{}] Close of tender {} rejected by ledger: {}",
                    self.replica_id, tender.id, reason
                );
                crate::metrics::record_close_conflict();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // Never assume success without an observed confirmation
        let receipt = self.ledger.wait_confirmed(&pending).await?;
        if !receipt.success {
            let reason = match self.ledger.can_close(tender.id).await {
                Ok(e) => e.reason,
                Err(_) => String::new(),
            };
            warn!(
                "[{}] Close of tender {} reverted ({:?}): {}",
                self.replica_id, tender.id, receipt.tx_hash, reason
            );
            crate::metrics::record_close_conflict();
            return Ok(());
        }

        self.phases.insert(tender.id, ClosingPhase::Closed);
        crate::metrics::record_tender_closed();
        info!(
            "[{}] Tender {} closed and awarded in {:?}",
            self.replica_id, tender.id, receipt.tx_hash
        );

        self.verify_award(tender.id, preview).await;

        // Write-through; a mirror failure here leaves the replica stale until
        // the next reconciliation, which is acceptable
        if let Err(e) = self
            .replica
            .reconcile_tender(self.ledger.as_ref(), tender.id)
            .await
        {
            warn!(
                "[{}] Mirror update for tender {} failed: {}",
                self.replica_id, tender.id, e
            );
        }

        Ok(())
    }

    /// Compare the ledger's award against the off-ledger selection
    async fn verify_award(&self, tender_id: u64, preview: Option<u64>) {
        let awarded = async {
            let tender = self.ledger.tender(tender_id).await?;
            let contract_id = tender
                .contract_id
                .ok_or(EngineError::ContractNotFound { contract_id: 0 })?;
            let contract = self.ledger.contract(contract_id).await?;
            Ok::<u64, EngineError>(contract.winning_bid_id)
        }
        .await;

        match (awarded, preview) {
            (Ok(winner), Some(expected)) if winner != expected => {
                // Either a late bid landed between preview and close, or the
                // ledger's selection disagrees with ours; both deserve eyes
                warn!(
                    "Tender {} awarded to bid {} but selector expected {}",
                    tender_id, winner, expected
                );
            }
            (Ok(winner), _) => {
                debug!("Tender {} award verified: bid {}", tender_id, winner);
            }
            (Err(e), _) => {
                warn!("Could not verify award for tender {}: {}", tender_id, e);
            }
        }
    }
}
