//! Milestone escrow settlement pipeline
//!
//! Bridges "all milestones complete" on the primary ledger into a single
//! contractor payout on the secondary settlement ledger. Idempotent at the
//! application level, since the secondary ledger has no notion of "this
//! contract was already paid". Failures go to an operator queue; there is no
//! automatic retry loop.

pub mod bridge;
pub mod target;

pub use bridge::{SettleOutcome, SettlementBridge};
pub use target::{OneToOne, RestSettlementLedger, SettlementTarget, ValueConversion};
