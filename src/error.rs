//! Error types for the tender engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Mirror database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger connection error: {0}")]
    LedgerConnection(String),

    /// The ledger answered the call with a deterministic rejection. The
    /// reason string is the contract's own, surfaced verbatim for operators.
    #[error("Ledger rejected call: {reason}")]
    LedgerRejected { reason: String },

    #[error("Ledger write {tx_hash} reverted on-chain")]
    WriteReverted { tx_hash: String },

    #[error("Nonce error: {0}")]
    Nonce(String),

    #[error("Gas estimation error: {0}")]
    Gas(String),

    #[error("Return data decode error: {0}")]
    Codec(String),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Tender {tender_id} not found on ledger")]
    TenderNotFound { tender_id: u64 },

    #[error("Bid {bid_id} not found on ledger")]
    BidNotFound { bid_id: u64 },

    #[error("Contract {contract_id} not found on ledger")]
    ContractNotFound { contract_id: u64 },

    #[error("Milestone index {index} out of range for contract {contract_id}")]
    MilestoneIndex { contract_id: u64, index: u8 },

    #[error(
        "Milestone {got} of contract {contract_id} cannot be completed before milestone {expected}"
    )]
    MilestoneOrder {
        contract_id: u64,
        expected: u8,
        got: u8,
    },

    #[error("Contract {contract_id} has no settlement payout address")]
    MissingPayoutAddress { contract_id: u64 },

    #[error("Settlement transfer for contract {contract_id} failed: {reason}")]
    SettlementTransfer { contract_id: u64, reason: String },

    #[error("Value conversion error: {0}")]
    Conversion(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Check if the error is recoverable by retrying on a later tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::LedgerConnection(_)
                | EngineError::Timeout { .. }
                | EngineError::Nonce(_)
                | EngineError::Gas(_)
        )
    }

    /// Check if the error should page an operator
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            EngineError::SettlementTransfer { .. }
                | EngineError::MissingPayoutAddress { .. }
                | EngineError::Wallet(_)
        )
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
