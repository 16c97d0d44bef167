//! Tender closing and award coordination
//!
//! The coordinator:
//! 1. Polls the ledger for Open tenders whose bidding window has elapsed
//! 2. Checks the ledger-side eligibility predicate
//! 3. Runs the bid selector as an informational pre-check
//! 4. Submits the atomic close-and-award transition
//!
//! Multiple replicas may race on the same tender set; the ledger's
//! single-writer transition is the only mutual exclusion.

pub mod coordinator;
pub mod scheduler;

pub use coordinator::{ClosingCoordinator, ClosingPhase};
pub use scheduler::Scheduler;
