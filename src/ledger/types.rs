//! Typed views over the primary ledger's read surface
//!
//! The ledger contract returns positional tuples; everything is mapped into
//! explicit result structs here and nothing tuple-shaped escapes this module.

use crate::error::{EngineError, EngineResult};

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

/// Number of milestones on every awarded contract
pub const MILESTONE_COUNT: u8 = 5;

/// Lifecycle status of a tender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenderStatus {
    Draft,
    Open,
    Closed,
    Awarded,
    Cancelled,
}

impl TenderStatus {
    pub fn from_u8(raw: u8) -> EngineResult<Self> {
        match raw {
            0 => Ok(TenderStatus::Draft),
            1 => Ok(TenderStatus::Open),
            2 => Ok(TenderStatus::Closed),
            3 => Ok(TenderStatus::Awarded),
            4 => Ok(TenderStatus::Cancelled),
            other => Err(EngineError::Codec(format!(
                "unknown tender status {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TenderStatus::Draft => "draft",
            TenderStatus::Open => "open",
            TenderStatus::Closed => "closed",
            TenderStatus::Awarded => "awarded",
            TenderStatus::Cancelled => "cancelled",
        }
    }
}

/// Lifecycle status of a bid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidStatus {
    Submitted,
    Accepted,
    Rejected,
    Withdrawn,
}

impl BidStatus {
    pub fn from_u8(raw: u8) -> EngineResult<Self> {
        match raw {
            0 => Ok(BidStatus::Submitted),
            1 => Ok(BidStatus::Accepted),
            2 => Ok(BidStatus::Rejected),
            3 => Ok(BidStatus::Withdrawn),
            other => Err(EngineError::Codec(format!("unknown bid status {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BidStatus::Submitted => "submitted",
            BidStatus::Accepted => "accepted",
            BidStatus::Rejected => "rejected",
            BidStatus::Withdrawn => "withdrawn",
        }
    }
}

/// Tender as read from the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenderView {
    pub id: u64,
    pub owner: Address,
    pub title: String,
    pub category: String,
    pub estimated_budget: U256,
    /// Bidding window [start, end) in unix seconds
    pub window_start: u64,
    pub window_end: u64,
    pub status: TenderStatus,
    pub contract_id: Option<u64>,
}

/// Bid as read from the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidView {
    pub id: u64,
    pub tender_id: u64,
    pub bidder: Address,
    pub amount: U256,
    pub proposal_cid: String,
    pub status: BidStatus,
}

impl BidView {
    /// A bid still in the running for the award
    pub fn is_active(&self) -> bool {
        self.status != BidStatus::Withdrawn
    }
}

/// Awarded contract as read from the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractView {
    pub id: u64,
    pub tender_id: u64,
    pub winning_bid_id: u64,
    pub contractor: Address,
    pub value: U256,
    pub total_paid: U256,
    pub start: u64,
    pub end: u64,
    /// Secondary ledger payout address; unset until the contractor registers one
    pub payout_address: Option<String>,
}

/// Single milestone as read from the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneView {
    pub index: u8,
    /// Percentage of contract value; all five sum to 100
    pub percentage: u8,
    pub completed: bool,
    pub completed_at: Option<u64>,
    pub paid: bool,
    pub paid_at: Option<u64>,
}

/// Aggregate contract progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractProgress {
    pub contract_id: u64,
    pub completed: u64,
    pub total: u64,
    pub total_paid: U256,
    pub contract_value: U256,
}

impl ContractProgress {
    pub fn all_complete(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }
}

/// Result of the ledger-side eligibility predicate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseEligibility {
    pub eligible: bool,
    /// Human-readable reason when not eligible, empty otherwise
    pub reason: String,
}

/// Result of the ledger's own lowest-bid view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LowestBid {
    pub bid_id: u64,
    pub amount: U256,
    pub bidder: Address,
}

/// Parameters for creating a tender
#[derive(Debug, Clone)]
pub struct CreateTender {
    pub title: String,
    pub category: String,
    pub estimated_budget: U256,
    pub window_start: u64,
    pub window_end: u64,
}

/// A submitted but not yet confirmed ledger write
///
/// Submission is reversible (the transaction can be dropped and resubmitted);
/// only a confirmation makes the write durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub tx_hash: H256,
}

/// Final outcome of a confirmed ledger write
#[derive(Debug, Clone)]
pub struct WriteReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub success: bool,
}
