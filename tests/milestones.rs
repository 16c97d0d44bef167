//! Milestone completion ordering and the all-complete hand-off

mod common;

use common::InMemoryLedger;
use ethers::types::Address;
use std::sync::Arc;
use tender_engine::error::EngineError;
use tender_engine::ledger::types::MILESTONE_COUNT;
use tender_engine::ledger::TenderLedger;
use tender_engine::milestone::{AllComplete, MilestoneTracker};
use tokio::sync::mpsc;

/// Seed and close a one-bid tender, returning the contract id
async fn awarded_contract(ledger: &Arc<InMemoryLedger>) -> u64 {
    ledger.seed_tender(1, 100, 200);
    ledger.seed_bid(1, Address::from_low_u64_be(1), 500);
    ledger.set_now(250);
    ledger.close_and_award(1, 250, 250 + 1000).await.unwrap();
    ledger.tender(1).await.unwrap().contract_id.unwrap()
}

fn tracker(ledger: &Arc<InMemoryLedger>) -> (MilestoneTracker, mpsc::Receiver<AllComplete>) {
    let (tx, rx) = mpsc::channel(8);
    (
        MilestoneTracker::new(ledger.clone() as Arc<dyn TenderLedger>, tx),
        rx,
    )
}

#[tokio::test]
async fn milestones_sum_to_one_hundred_percent() {
    let ledger = Arc::new(InMemoryLedger::new());
    let contract_id = awarded_contract(&ledger).await;

    let milestones = ledger.contract_milestones(contract_id).await.unwrap();
    assert_eq!(milestones.len(), MILESTONE_COUNT as usize);
    let total: u32 = milestones.iter().map(|m| m.percentage as u32).sum();
    assert_eq!(total, 100);
}

#[tokio::test]
async fn out_of_order_completion_is_rejected() {
    let ledger = Arc::new(InMemoryLedger::new());
    let contract_id = awarded_contract(&ledger).await;
    let (tracker, _rx) = tracker(&ledger);

    let err = tracker.complete(contract_id, 2).await.unwrap_err();
    match err {
        EngineError::MilestoneOrder { expected, got, .. } => {
            assert_eq!(expected, 0);
            assert_eq!(got, 2);
        }
        other => panic!("expected ordering error, got {:?}", other),
    }

    // Nothing was written
    let progress = ledger.contract_progress(contract_id).await.unwrap();
    assert_eq!(progress.completed, 0);
}

#[tokio::test]
async fn out_of_range_index_is_rejected() {
    let ledger = Arc::new(InMemoryLedger::new());
    let contract_id = awarded_contract(&ledger).await;
    let (tracker, _rx) = tracker(&ledger);

    let err = tracker.complete(contract_id, MILESTONE_COUNT).await.unwrap_err();
    assert!(matches!(err, EngineError::MilestoneIndex { .. }));
}

#[tokio::test]
async fn repeated_completion_of_same_milestone_is_rejected() {
    let ledger = Arc::new(InMemoryLedger::new());
    let contract_id = awarded_contract(&ledger).await;
    let (tracker, _rx) = tracker(&ledger);

    tracker.complete(contract_id, 0).await.unwrap();

    let err = tracker.complete(contract_id, 0).await.unwrap_err();
    match err {
        EngineError::MilestoneOrder { expected, got, .. } => {
            assert_eq!(expected, 1);
            assert_eq!(got, 0);
        }
        other => panic!("expected ordering error, got {:?}", other),
    }
}

#[tokio::test]
async fn completing_every_milestone_queues_settlement() {
    let ledger = Arc::new(InMemoryLedger::new());
    let contract_id = awarded_contract(&ledger).await;
    let (tracker, mut rx) = tracker(&ledger);

    for index in 0..MILESTONE_COUNT {
        let progress = tracker.complete(contract_id, index).await.unwrap();
        assert_eq!(progress.completed, index as u64 + 1);

        if index < MILESTONE_COUNT - 1 {
            assert!(!progress.all_complete());
            assert!(rx.try_recv().is_err());
        }
    }

    let notice = rx.recv().await.expect("all-complete notification");
    assert_eq!(notice, AllComplete { contract_id });
}
