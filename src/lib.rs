//! Tender closing, award coordination and milestone settlement engine.
//!
//! Watches a procurement ledger for tenders whose bidding windows have
//! elapsed, closes them and awards the lowest bid, tracks milestone
//! completion on awarded contracts, and settles completed contracts on a
//! secondary payment ledger. A Postgres mirror serves operator reads.

pub mod api;
pub mod closing;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod metrics;
pub mod milestone;
pub mod mirror;
pub mod selector;
pub mod settlement;
