//! Settlement bridge idempotency and the manual retry path

mod common;

use common::{InMemoryLedger, MemoryReplica, MockSettlementTarget};
use ethers::types::Address;
use std::sync::Arc;
use tender_engine::error::EngineError;
use tender_engine::ledger::types::MILESTONE_COUNT;
use tender_engine::ledger::TenderLedger;
use tender_engine::mirror::Replica;
use tender_engine::settlement::{OneToOne, SettleOutcome, SettlementBridge, SettlementTarget};

struct Fixture {
    ledger: Arc<InMemoryLedger>,
    replica: Arc<MemoryReplica>,
    target: Arc<MockSettlementTarget>,
    bridge: SettlementBridge,
    contract_id: u64,
}

/// Award a 500-unit contract and complete every milestone
async fn fixture(with_payout: bool) -> Fixture {
    let ledger = Arc::new(InMemoryLedger::new());
    let replica = Arc::new(MemoryReplica::new());
    let target = Arc::new(MockSettlementTarget::new());

    ledger.seed_tender(1, 100, 200);
    ledger.seed_bid(1, Address::from_low_u64_be(1), 500);
    ledger.set_now(250);
    ledger.close_and_award(1, 250, 1250).await.unwrap();
    let contract_id = ledger.tender(1).await.unwrap().contract_id.unwrap();

    if with_payout {
        ledger.set_payout(contract_id, "0xsettle");
    }
    for index in 0..MILESTONE_COUNT {
        ledger.complete_milestone(contract_id, index).await.unwrap();
    }

    let bridge = SettlementBridge::new(
        ledger.clone() as Arc<dyn TenderLedger>,
        replica.clone() as Arc<dyn Replica>,
        target.clone() as Arc<dyn SettlementTarget>,
        Arc::new(OneToOne),
    );

    Fixture {
        ledger,
        replica,
        target,
        bridge,
        contract_id,
    }
}

#[tokio::test]
async fn completed_contract_is_paid_once() {
    let fx = fixture(true).await;

    let outcome = fx.bridge.settle(fx.contract_id).await.unwrap();
    assert!(matches!(outcome, SettleOutcome::Paid { .. }));

    // Second request is a no-op, not a second transfer
    let again = fx.bridge.settle(fx.contract_id).await.unwrap();
    assert_eq!(again, SettleOutcome::AlreadyPaid);

    let transfers = fx.target.transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0], ("0xsettle".to_string(), 500));
    assert_eq!(fx.replica.payment_count(), 1);

    let payment = fx.replica.payment(fx.contract_id).unwrap();
    assert_eq!(payment.amount_minor_units, 500);
    assert_eq!(payment.recipient, "0xsettle");
}

#[tokio::test]
async fn missing_payout_address_queues_for_operator() {
    let fx = fixture(false).await;

    let err = fx.bridge.settle(fx.contract_id).await.unwrap_err();
    assert!(matches!(err, EngineError::MissingPayoutAddress { .. }));

    // Queued for manual retry, no transfer attempted
    assert!(fx.replica.failure(fx.contract_id).is_some());
    assert!(fx.target.transfers().is_empty());

    // Operator registers the address and retries through the same entry point
    fx.ledger.set_payout(fx.contract_id, "0xlate");
    let outcome = fx.bridge.settle(fx.contract_id).await.unwrap();
    assert!(matches!(outcome, SettleOutcome::Paid { .. }));
    assert!(fx.replica.failure(fx.contract_id).is_none());
}

#[tokio::test]
async fn transfer_failure_is_not_retried_automatically() {
    let fx = fixture(true).await;
    fx.target.set_failing(true);

    let err = fx.bridge.settle(fx.contract_id).await.unwrap_err();
    assert!(matches!(err, EngineError::SettlementTransfer { .. }));

    let failure = fx.replica.failure(fx.contract_id).expect("failure queued");
    assert!(!failure.reason.is_empty());
    assert_eq!(fx.replica.payment_count(), 0);

    // Manual retry after the outage clears the queue entry
    fx.target.set_failing(false);
    let outcome = fx.bridge.settle(fx.contract_id).await.unwrap();
    assert!(matches!(outcome, SettleOutcome::Paid { .. }));
    assert!(fx.replica.failure(fx.contract_id).is_none());
    assert_eq!(fx.replica.payment_count(), 1);
}

#[tokio::test]
async fn incomplete_contract_is_not_settled() {
    let ledger = Arc::new(InMemoryLedger::new());
    let replica = Arc::new(MemoryReplica::new());
    let target = Arc::new(MockSettlementTarget::new());

    ledger.seed_tender(1, 100, 200);
    ledger.seed_bid(1, Address::from_low_u64_be(1), 500);
    ledger.set_now(250);
    ledger.close_and_award(1, 250, 1250).await.unwrap();
    let contract_id = ledger.tender(1).await.unwrap().contract_id.unwrap();
    ledger.set_payout(contract_id, "0xsettle");
    ledger.complete_milestone(contract_id, 0).await.unwrap();

    let bridge = SettlementBridge::new(
        ledger.clone() as Arc<dyn TenderLedger>,
        replica.clone() as Arc<dyn Replica>,
        target.clone() as Arc<dyn SettlementTarget>,
        Arc::new(OneToOne),
    );

    let err = bridge.settle(contract_id).await.unwrap_err();
    match err {
        EngineError::SettlementTransfer { reason, .. } => {
            assert!(reason.contains("1/5"));
        }
        other => panic!("expected transfer rejection, got {:?}", other),
    }
    assert!(target.transfers().is_empty());
}
