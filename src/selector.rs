//! Winning bid selection
//!
//! Pure and deterministic so the same selection can be computed off-ledger
//! for preview and re-derived to verify the ledger's own award.

use crate::ledger::types::BidView;

/// Select the winning bid from a tender's bid set.
///
/// The winner is the non-withdrawn bid with the lowest amount; ties go to the
/// lowest bid id, which is the earliest submission. Returns `None` when no
/// active bid exists.
pub fn select_winner(bids: &[BidView]) -> Option<&BidView> {
    bids.iter()
        .filter(|bid| bid.is_active())
        .min_by(|a, b| a.amount.cmp(&b.amount).then(a.id.cmp(&b.id)))
}
