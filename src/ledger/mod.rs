//! Primary ledger access
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - A typed read/write surface over the tender contract
//! - Confirmation tracking for submitted writes
//! - Checkpointed event listening

pub mod client;
pub mod confirm;
pub mod listener;
pub mod nonce;
pub mod provider;
pub mod types;

pub use client::EthersLedger;
pub use confirm::ConfirmationTracker;
pub use listener::LedgerListener;
pub use provider::{GasPrice, LedgerProvider};
pub use types::*;

use crate::error::EngineResult;

use async_trait::async_trait;
use ethers::types::U256;

/// Typed access to the primary ledger's tender surface.
///
/// The trait is the seam between the engine and the chain: coordinators,
/// the milestone tracker and the settlement bridge only ever see this
/// interface. Writes are two-phase — `PendingWrite` is a submission, and
/// callers must `wait_confirmed` before treating the effect as durable.
#[async_trait]
pub trait TenderLedger: Send + Sync {
    // Reads

    async fn tender(&self, tender_id: u64) -> EngineResult<TenderView>;

    async fn bid(&self, bid_id: u64) -> EngineResult<BidView>;

    async fn tender_bids(&self, tender_id: u64) -> EngineResult<Vec<BidView>>;

    /// The ledger's own view of the current lowest active bid
    async fn lowest_bid(&self, tender_id: u64) -> EngineResult<Option<LowestBid>>;

    /// Ledger-side eligibility predicate for the close-and-award transition
    async fn can_close(&self, tender_id: u64) -> EngineResult<CloseEligibility>;

    async fn contract(&self, contract_id: u64) -> EngineResult<ContractView>;

    async fn contract_milestones(&self, contract_id: u64) -> EngineResult<Vec<MilestoneView>>;

    async fn milestone(&self, contract_id: u64, index: u8) -> EngineResult<MilestoneView>;

    async fn contract_progress(&self, contract_id: u64) -> EngineResult<ContractProgress>;

    /// Identifiers of all tenders currently in Open status
    async fn open_tenders(&self) -> EngineResult<Vec<u64>>;

    // Writes

    async fn create_tender(&self, params: CreateTender) -> EngineResult<PendingWrite>;

    async fn open_for_bidding(&self, tender_id: u64) -> EngineResult<PendingWrite>;

    async fn submit_bid(
        &self,
        tender_id: u64,
        amount: U256,
        proposal_cid: String,
    ) -> EngineResult<PendingWrite>;

    async fn withdraw_bid(&self, bid_id: u64) -> EngineResult<PendingWrite>;

    /// Close bidding without awarding; used by owners who want to review
    /// bids before accepting one manually
    async fn close_bidding(&self, tender_id: u64) -> EngineResult<PendingWrite>;

    /// Manual award of a specific bid, typically after `close_bidding`.
    /// The owner picks the winner instead of the lowest-bid rule.
    async fn accept_bid_and_award(
        &self,
        tender_id: u64,
        bid_id: u64,
        contract_start: u64,
        contract_end: u64,
    ) -> EngineResult<PendingWrite>;

    /// Atomic close-and-award: selects the lowest active bid, closes bidding
    /// and creates the contract in one ledger transaction. The ledger is the
    /// single writer here — a second attempt after one succeeds is rejected
    /// with a deterministic reason.
    async fn close_and_award(
        &self,
        tender_id: u64,
        contract_start: u64,
        contract_end: u64,
    ) -> EngineResult<PendingWrite>;

    async fn complete_milestone(&self, contract_id: u64, index: u8) -> EngineResult<PendingWrite>;

    async fn set_payout_address(
        &self,
        contract_id: u64,
        address: String,
    ) -> EngineResult<PendingWrite>;

    /// Block until the write is confirmed or known to have reverted
    async fn wait_confirmed(&self, write: &PendingWrite) -> EngineResult<WriteReceipt>;
}
