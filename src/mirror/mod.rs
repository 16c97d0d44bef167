//! State mirror: an eventually-consistent replica of ledger state
//!
//! The mirror is a cache, never the source of truth. It is updated by
//! write-through after a coordinator's own confirmed writes and by
//! reconciliation reads that overwrite mirrored fields with the ledger's
//! current values. A stale mirror after a successful ledger write is an
//! accepted inconsistency window, not an error.

mod store;

pub use store::{MirrorStats, StateMirror, TenderRow};

use crate::error::EngineResult;
use crate::ledger::types::{BidView, TenderView};
use crate::ledger::TenderLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::H256;
use serde::{Deserialize, Serialize};

/// Record of a completed secondary-ledger transfer. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub contract_id: u64,
    pub recipient: String,
    pub amount_minor_units: u64,
    pub tx_ref: String,
    pub paid_at: DateTime<Utc>,
}

/// A settlement attempt awaiting manual operator intervention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementFailure {
    pub contract_id: u64,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// The subset of the mirror the pipeline components depend on.
///
/// Kept as a trait so coordinator, tracker and bridge can be exercised
/// against an in-memory replica in tests.
#[async_trait]
pub trait Replica: Send + Sync {
    /// Overwrite the mirrored tender row with ledger truth
    async fn upsert_tender(
        &self,
        tender: &TenderView,
        ledger_tx_hash: Option<H256>,
    ) -> EngineResult<()>;

    /// Overwrite the mirrored bid row with ledger truth
    async fn upsert_bid(&self, bid: &BidView) -> EngineResult<()>;

    /// Insert a payment row; returns false when one already exists for the
    /// contract (the application-level idempotency guard)
    async fn insert_payment(&self, payment: &PaymentRecord) -> EngineResult<bool>;

    async fn payment_exists(&self, contract_id: u64) -> EngineResult<bool>;

    async fn record_settlement_failure(&self, contract_id: u64, reason: &str) -> EngineResult<()>;

    async fn clear_settlement_failure(&self, contract_id: u64) -> EngineResult<()>;

    /// Reconciliation read: fetch the tender and its bids from the ledger and
    /// overwrite every mirrored field. Deltas are never applied, so missed or
    /// out-of-order events cannot corrupt the replica.
    async fn reconcile_tender(
        &self,
        ledger: &dyn TenderLedger,
        tender_id: u64,
    ) -> EngineResult<()> {
        let tender = ledger.tender(tender_id).await?;
        self.upsert_tender(&tender, None).await?;

        for bid in ledger.tender_bids(tender_id).await? {
            self.upsert_bid(&bid).await?;
        }
        Ok(())
    }
}
