//! Ledger event types and log parsing
//!
//! Defines the events emitted by the tender contract and decodes raw logs
//! into them. Events drive mirror reconciliation and the settlement pipeline;
//! they are never the source of truth themselves.

use crate::error::{EngineError, EngineResult};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Log, H256, U256};
use ethers::utils::keccak256;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// Events emitted by the tender contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LedgerEvent {
    TenderCreated {
        tender_id: u64,
        owner: Address,
        block_number: u64,
        tx_hash: H256,
    },

    BidSubmitted {
        tender_id: u64,
        bid_id: u64,
        bidder: Address,
        amount: U256,
        block_number: u64,
        tx_hash: H256,
    },

    /// Manual award path (owner accepted a specific bid)
    TenderAwarded {
        tender_id: u64,
        bid_id: u64,
        block_number: u64,
        tx_hash: H256,
    },

    /// Atomic close-and-award transition succeeded
    TenderClosedAndAwarded {
        tender_id: u64,
        bid_id: u64,
        contract_id: u64,
        block_number: u64,
        tx_hash: H256,
    },

    MilestoneCompleted {
        contract_id: u64,
        index: u8,
        timestamp: u64,
        block_number: u64,
        tx_hash: H256,
    },

    MilestonePaid {
        contract_id: u64,
        index: u8,
        amount: U256,
        block_number: u64,
        tx_hash: H256,
    },

    /// Every milestone on the contract is complete; settlement may fire
    AllMilestonesCompleted {
        contract_id: u64,
        block_number: u64,
        tx_hash: H256,
    },

    Unknown {
        topic: H256,
        block_number: u64,
        tx_hash: H256,
    },
}

impl LedgerEvent {
    /// Event name for metrics and the mirror journal
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::TenderCreated { .. } => "tender_created",
            LedgerEvent::BidSubmitted { .. } => "bid_submitted",
            LedgerEvent::TenderAwarded { .. } => "tender_awarded",
            LedgerEvent::TenderClosedAndAwarded { .. } => "tender_closed_and_awarded",
            LedgerEvent::MilestoneCompleted { .. } => "milestone_completed",
            LedgerEvent::MilestonePaid { .. } => "milestone_paid",
            LedgerEvent::AllMilestonesCompleted { .. } => "all_milestones_completed",
            LedgerEvent::Unknown { .. } => "unknown",
        }
    }

    /// Tender whose mirror rows this event invalidates, if any
    pub fn tender_id(&self) -> Option<u64> {
        match self {
            LedgerEvent::TenderCreated { tender_id, .. }
            | LedgerEvent::BidSubmitted { tender_id, .. }
            | LedgerEvent::TenderAwarded { tender_id, .. }
            | LedgerEvent::TenderClosedAndAwarded { tender_id, .. } => Some(*tender_id),
            _ => None,
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            LedgerEvent::TenderCreated { block_number, .. }
            | LedgerEvent::BidSubmitted { block_number, .. }
            | LedgerEvent::TenderAwarded { block_number, .. }
            | LedgerEvent::TenderClosedAndAwarded { block_number, .. }
            | LedgerEvent::MilestoneCompleted { block_number, .. }
            | LedgerEvent::MilestonePaid { block_number, .. }
            | LedgerEvent::AllMilestonesCompleted { block_number, .. }
            | LedgerEvent::Unknown { block_number, .. } => *block_number,
        }
    }

    pub fn tx_hash(&self) -> H256 {
        match self {
            LedgerEvent::TenderCreated { tx_hash, .. }
            | LedgerEvent::BidSubmitted { tx_hash, .. }
            | LedgerEvent::TenderAwarded { tx_hash, .. }
            | LedgerEvent::TenderClosedAndAwarded { tx_hash, .. }
            | LedgerEvent::MilestoneCompleted { tx_hash, .. }
            | LedgerEvent::MilestonePaid { tx_hash, .. }
            | LedgerEvent::AllMilestonesCompleted { tx_hash, .. }
            | LedgerEvent::Unknown { tx_hash, .. } => *tx_hash,
        }
    }
}

/// Event topic signatures (keccak256 of the solidity event signature)
pub mod topics {
    use super::*;

    lazy_static! {
        pub static ref TENDER_CREATED: H256 =
            H256::from(keccak256("TenderCreated(uint64,address)"));
        pub static ref BID_SUBMITTED: H256 =
            H256::from(keccak256("BidSubmitted(uint64,uint64,address,uint256)"));
        pub static ref TENDER_AWARDED: H256 =
            H256::from(keccak256("TenderAwarded(uint64,uint64)"));
        pub static ref TENDER_CLOSED_AND_AWARDED: H256 =
            H256::from(keccak256("TenderClosedAndAwarded(uint64,uint64,uint64)"));
        pub static ref MILESTONE_COMPLETED: H256 =
            H256::from(keccak256("MilestoneCompleted(uint64,uint8,uint64)"));
        pub static ref MILESTONE_PAID: H256 =
            H256::from(keccak256("MilestonePaid(uint64,uint8,uint256)"));
        pub static ref ALL_MILESTONES_COMPLETED: H256 =
            H256::from(keccak256("AllMilestonesCompleted(uint64)"));
    }
}

/// Decodes tender contract logs into `LedgerEvent`s
pub struct EventParser;

impl EventParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a log entry into a LedgerEvent
    pub fn parse_log(&self, log: &Log) -> EngineResult<LedgerEvent> {
        let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
        let tx_hash = log.transaction_hash.unwrap_or_default();
        let topic = log.topics.first().copied().unwrap_or_default();

        if topic == *topics::TENDER_CREATED {
            Ok(LedgerEvent::TenderCreated {
                tender_id: indexed_u64(log, 1)?,
                owner: indexed_address(log, 2)?,
                block_number,
                tx_hash,
            })
        } else if topic == *topics::BID_SUBMITTED {
            let data = decode_data(log, &[ParamType::Uint(256)])?;
            Ok(LedgerEvent::BidSubmitted {
                tender_id: indexed_u64(log, 1)?,
                bid_id: indexed_u64(log, 2)?,
                bidder: indexed_address(log, 3)?,
                amount: uint_token(&data[0])?,
                block_number,
                tx_hash,
            })
        } else if topic == *topics::TENDER_AWARDED {
            Ok(LedgerEvent::TenderAwarded {
                tender_id: indexed_u64(log, 1)?,
                bid_id: indexed_u64(log, 2)?,
                block_number,
                tx_hash,
            })
        } else if topic == *topics::TENDER_CLOSED_AND_AWARDED {
            let data = decode_data(log, &[ParamType::Uint(64)])?;
            Ok(LedgerEvent::TenderClosedAndAwarded {
                tender_id: indexed_u64(log, 1)?,
                bid_id: indexed_u64(log, 2)?,
                contract_id: event_u64(uint_token(&data[0])?)?,
                block_number,
                tx_hash,
            })
        } else if topic == *topics::MILESTONE_COMPLETED {
            let data = decode_data(log, &[ParamType::Uint(8), ParamType::Uint(64)])?;
            Ok(LedgerEvent::MilestoneCompleted {
                contract_id: indexed_u64(log, 1)?,
                index: event_u8(uint_token(&data[0])?)?,
                timestamp: event_u64(uint_token(&data[1])?)?,
                block_number,
                tx_hash,
            })
        } else if topic == *topics::MILESTONE_PAID {
            let data = decode_data(log, &[ParamType::Uint(8), ParamType::Uint(256)])?;
            Ok(LedgerEvent::MilestonePaid {
                contract_id: indexed_u64(log, 1)?,
                index: event_u8(uint_token(&data[0])?)?,
                amount: uint_token(&data[1])?,
                block_number,
                tx_hash,
            })
        } else if topic == *topics::ALL_MILESTONES_COMPLETED {
            Ok(LedgerEvent::AllMilestonesCompleted {
                contract_id: indexed_u64(log, 1)?,
                block_number,
                tx_hash,
            })
        } else {
            Ok(LedgerEvent::Unknown {
                topic,
                block_number,
                tx_hash,
            })
        }
    }
}

impl Default for EventParser {
    fn default() -> Self {
        Self::new()
    }
}

fn indexed_topic(log: &Log, position: usize) -> EngineResult<H256> {
    log.topics.get(position).copied().ok_or_else(|| {
        EngineError::EventParsing(format!("missing indexed topic {}", position))
    })
}

fn indexed_u64(log: &Log, position: usize) -> EngineResult<u64> {
    let topic = indexed_topic(log, position)?;
    event_u64(U256::from_big_endian(topic.as_bytes()))
}

// Event words widen small integers to 256 bits; an out-of-range word is a
// malformed log and must not panic the listener
fn event_u64(value: U256) -> EngineResult<u64> {
    if value > U256::from(u64::MAX) {
        return Err(EngineError::EventParsing(format!(
            "uint {} out of range for u64",
            value
        )));
    }
    Ok(value.as_u64())
}

fn event_u8(value: U256) -> EngineResult<u8> {
    if value > U256::from(u8::MAX) {
        return Err(EngineError::EventParsing(format!(
            "uint {} out of range for u8",
            value
        )));
    }
    Ok(value.as_u64() as u8)
}

fn indexed_address(log: &Log, position: usize) -> EngineResult<Address> {
    let topic = indexed_topic(log, position)?;
    Ok(Address::from_slice(&topic.as_bytes()[12..32]))
}

fn decode_data(log: &Log, params: &[ParamType]) -> EngineResult<Vec<Token>> {
    abi::decode(params, &log.data)
        .map_err(|e| EngineError::EventParsing(format!("bad event data: {}", e)))
}

fn uint_token(token: &Token) -> EngineResult<U256> {
    match token {
        Token::Uint(v) => Ok(*v),
        other => Err(EngineError::EventParsing(format!(
            "expected uint, got {:?}",
            other
        ))),
    }
}
