//! Settlement bridge: one payout per fully-completed contract

use crate::error::{EngineError, EngineResult};
use crate::ledger::TenderLedger;
use crate::milestone::AllComplete;
use crate::mirror::{PaymentRecord, Replica};

use super::target::{SettlementTarget, ValueConversion};

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Result of a settlement attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    /// A transfer was executed and recorded
    Paid { tx_ref: String },
    /// A payment already existed; nothing was transferred
    AlreadyPaid,
}

/// Executes exactly one transfer attempt per settlement request
pub struct SettlementBridge {
    ledger: Arc<dyn TenderLedger>,
    replica: Arc<dyn Replica>,
    target: Arc<dyn SettlementTarget>,
    conversion: Arc<dyn ValueConversion>,
}

impl SettlementBridge {
    pub fn new(
        ledger: Arc<dyn TenderLedger>,
        replica: Arc<dyn Replica>,
        target: Arc<dyn SettlementTarget>,
        conversion: Arc<dyn ValueConversion>,
    ) -> Self {
        Self {
            ledger,
            replica,
            target,
            conversion,
        }
    }

    /// Worker loop consuming all-complete notifications until cancelled
    pub async fn run(&self, mut rx: mpsc::Receiver<AllComplete>, mut cancel: watch::Receiver<bool>) {
        info!("Settlement bridge started");

        loop {
            tokio::select! {
                Some(notice) = rx.recv() => {
                    match self.settle(notice.contract_id).await {
                        Ok(SettleOutcome::Paid { tx_ref }) => {
                            info!("Contract {} settled: {}", notice.contract_id, tx_ref);
                        }
                        Ok(SettleOutcome::AlreadyPaid) => {
                            info!("Contract {} already settled, skipping", notice.contract_id);
                        }
                        Err(e) => {
                            // Queued for manual retry inside settle(); no
                            // automatic retry loop by design
                            error!("Settlement of contract {} failed: {}", notice.contract_id, e);
                        }
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Settlement bridge stopped");
    }

    /// Settle a contract: at most one transfer attempt, idempotent across
    /// invocations. Also the entry point for manual operator retries.
    pub async fn settle(&self, contract_id: u64) -> EngineResult<SettleOutcome> {
        // Application-level idempotency guard; the secondary ledger has no
        // notion of "already paid for this contract"
        if self.replica.payment_exists(contract_id).await? {
            return Ok(SettleOutcome::AlreadyPaid);
        }

        let outcome = self.transfer(contract_id).await;

        match outcome {
            Ok(paid) => {
                if let Err(e) = self.replica.clear_settlement_failure(contract_id).await {
                    warn!("Could not clear failure row for contract {}: {}", contract_id, e);
                }
                Ok(paid)
            }
            Err(e) => {
                crate::metrics::record_settlement_failed();
                let reason = e.to_string();
                if let Err(queue_err) = self
                    .replica
                    .record_settlement_failure(contract_id, &reason)
                    .await
                {
                    error!(
                        "Could not queue settlement failure for contract {}: {}",
                        contract_id, queue_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn transfer(&self, contract_id: u64) -> EngineResult<SettleOutcome> {
        let contract = self.ledger.contract(contract_id).await?;

        // Defensive re-check against the ledger; notifications can be stale
        let progress = self.ledger.contract_progress(contract_id).await?;
        if !progress.all_complete() {
            return Err(EngineError::SettlementTransfer {
                contract_id,
                reason: format!(
                    "contract has {}/{} milestones complete",
                    progress.completed, progress.total
                ),
            });
        }

        let payout_address = contract
            .payout_address
            .clone()
            .ok_or(EngineError::MissingPayoutAddress { contract_id })?;

        let amount = self.conversion.to_settlement_units(contract.value)?;

        let tx_ref = self
            .target
            .pay(&payout_address, amount)
            .await
            .map_err(|e| EngineError::SettlementTransfer {
                contract_id,
                reason: e.to_string(),
            })?;

        // Only a confirmed transfer reference may produce a payment row
        let payment = PaymentRecord {
            contract_id,
            recipient: payout_address,
            amount_minor_units: amount,
            tx_ref: tx_ref.clone(),
            paid_at: Utc::now(),
        };

        let inserted = self.replica.insert_payment(&payment).await?;
        if !inserted {
            // A concurrent settle won the insert; the ledger got paid twice
            // only if two transfers raced past the earlier exists-check, so
            // surface it loudly
            warn!(
                "Payment row for contract {} already present after transfer {}; \
                 possible duplicate payout, flagging for operator review",
                contract_id, tx_ref
            );
        }

        crate::metrics::record_settlement_paid(amount);
        Ok(SettleOutcome::Paid { tx_ref })
    }
}
