//! In-memory stand-ins for the primary ledger, the mirror and the
//! settlement target, with the same observable semantics as the real ones.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, H256, U256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tender_engine::error::{EngineError, EngineResult};
use tender_engine::ledger::types::{
    BidStatus, BidView, CloseEligibility, ContractProgress, ContractView, CreateTender, LowestBid,
    MilestoneView, PendingWrite, TenderStatus, TenderView, WriteReceipt, MILESTONE_COUNT,
};
use tender_engine::ledger::TenderLedger;
use tender_engine::mirror::{PaymentRecord, Replica, SettlementFailure};
use tender_engine::settlement::{SettlementTarget, ValueConversion};

#[derive(Default)]
struct LedgerState {
    tenders: HashMap<u64, TenderView>,
    bids: HashMap<u64, BidView>,
    contracts: HashMap<u64, ContractView>,
    milestones: HashMap<u64, Vec<MilestoneView>>,
    next_bid_id: u64,
    next_contract_id: u64,
}

/// Single-writer ledger fake with a settable clock.
///
/// Writes apply atomically under one lock, so concurrent close attempts
/// serialize exactly like they do on the real ledger: one succeeds, the
/// rest observe a deterministic rejection.
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    now: AtomicU64,
    tx_counter: AtomicU64,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                next_bid_id: 1,
                next_contract_id: 1,
                ..Default::default()
            }),
            now: AtomicU64::new(0),
            tx_counter: AtomicU64::new(1),
        }
    }

    pub fn set_now(&self, unix_secs: u64) {
        self.now.store(unix_secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn next_tx(&self) -> PendingWrite {
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        PendingWrite {
            tx_hash: H256::from_low_u64_be(n),
        }
    }

    /// Seed an open tender with the given bidding window
    pub fn seed_tender(&self, id: u64, window_start: u64, window_end: u64) {
        let mut state = self.state.lock().unwrap();
        state.tenders.insert(
            id,
            TenderView {
                id,
                owner: Address::from_low_u64_be(0xaa),
                title: format!("Tender {}", id),
                category: "roadworks".to_string(),
                estimated_budget: U256::from(1_000_000u64),
                window_start,
                window_end,
                status: TenderStatus::Open,
                contract_id: None,
            },
        );
    }

    /// Seed a bid from a specific bidder, returning the bid id
    pub fn seed_bid(&self, tender_id: u64, bidder: Address, amount: u64) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_bid_id;
        state.next_bid_id += 1;
        state.bids.insert(
            id,
            BidView {
                id,
                tender_id,
                bidder,
                amount: U256::from(amount),
                proposal_cid: format!("bafy-{}", id),
                status: BidStatus::Submitted,
            },
        );
        id
    }

    pub fn set_payout(&self, contract_id: u64, address: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(contract) = state.contracts.get_mut(&contract_id) {
            contract.payout_address = Some(address.to_string());
        }
    }

    fn eligibility(state: &LedgerState, tender_id: u64, now: u64) -> CloseEligibility {
        let tender = match state.tenders.get(&tender_id) {
            Some(t) => t,
            None => {
                return CloseEligibility {
                    eligible: false,
                    reason: "tender does not exist".to_string(),
                }
            }
        };
        if tender.status != TenderStatus::Open {
            return CloseEligibility {
                eligible: false,
                reason: "tender is not open".to_string(),
            };
        }
        if now < tender.window_end {
            return CloseEligibility {
                eligible: false,
                reason: "bidding window still open".to_string(),
            };
        }
        let has_bids = state
            .bids
            .values()
            .any(|b| b.tender_id == tender_id && b.status != BidStatus::Withdrawn);
        if !has_bids {
            return CloseEligibility {
                eligible: false,
                reason: "no active bids".to_string(),
            };
        }
        CloseEligibility {
            eligible: true,
            reason: String::new(),
        }
    }

    fn award(
        state: &mut LedgerState,
        tender_id: u64,
        winner: BidView,
        contract_start: u64,
        contract_end: u64,
    ) -> EngineResult<u64> {
        let contract_id = state.next_contract_id;
        state.next_contract_id += 1;

        for bid in state.bids.values_mut() {
            if bid.tender_id != tender_id || bid.status == BidStatus::Withdrawn {
                continue;
            }
            bid.status = if bid.id == winner.id {
                BidStatus::Accepted
            } else {
                BidStatus::Rejected
            };
        }

        state.contracts.insert(
            contract_id,
            ContractView {
                id: contract_id,
                tender_id,
                winning_bid_id: winner.id,
                contractor: winner.bidder,
                value: winner.amount,
                total_paid: U256::zero(),
                start: contract_start,
                end: contract_end,
                payout_address: None,
            },
        );
        state.milestones.insert(
            contract_id,
            (0..MILESTONE_COUNT)
                .map(|index| MilestoneView {
                    index,
                    percentage: 100 / MILESTONE_COUNT,
                    completed: false,
                    completed_at: None,
                    paid: false,
                    paid_at: None,
                })
                .collect(),
        );

        let tender = state
            .tenders
            .get_mut(&tender_id)
            .ok_or(EngineError::TenderNotFound { tender_id })?;
        tender.status = TenderStatus::Awarded;
        tender.contract_id = Some(contract_id);
        Ok(contract_id)
    }

    fn progress_of(state: &LedgerState, contract_id: u64) -> EngineResult<ContractProgress> {
        let contract = state
            .contracts
            .get(&contract_id)
            .ok_or(EngineError::ContractNotFound { contract_id })?;
        let milestones = state.milestones.get(&contract_id).cloned().unwrap_or_default();
        Ok(ContractProgress {
            contract_id,
            completed: milestones.iter().filter(|m| m.completed).count() as u64,
            total: milestones.len() as u64,
            total_paid: contract.total_paid,
            contract_value: contract.value,
        })
    }
}

#[async_trait]
impl TenderLedger for InMemoryLedger {
    async fn tender(&self, tender_id: u64) -> EngineResult<TenderView> {
        let state = self.state.lock().unwrap();
        state
            .tenders
            .get(&tender_id)
            .cloned()
            .ok_or(EngineError::TenderNotFound { tender_id })
    }

    async fn bid(&self, bid_id: u64) -> EngineResult<BidView> {
        let state = self.state.lock().unwrap();
        state
            .bids
            .get(&bid_id)
            .cloned()
            .ok_or(EngineError::BidNotFound { bid_id })
    }

    async fn tender_bids(&self, tender_id: u64) -> EngineResult<Vec<BidView>> {
        let state = self.state.lock().unwrap();
        let mut bids: Vec<BidView> = state
            .bids
            .values()
            .filter(|b| b.tender_id == tender_id)
            .cloned()
            .collect();
        bids.sort_by_key(|b| b.id);
        Ok(bids)
    }

    async fn lowest_bid(&self, tender_id: u64) -> EngineResult<Option<LowestBid>> {
        let bids = self.tender_bids(tender_id).await?;
        Ok(bids
            .iter()
            .filter(|b| b.is_active())
            .min_by(|a, b| a.amount.cmp(&b.amount).then(a.id.cmp(&b.id)))
            .map(|b| LowestBid {
                bid_id: b.id,
                amount: b.amount,
                bidder: b.bidder,
            }))
    }

    async fn can_close(&self, tender_id: u64) -> EngineResult<CloseEligibility> {
        let state = self.state.lock().unwrap();
        Ok(Self::eligibility(&state, tender_id, self.now()))
    }

    async fn contract(&self, contract_id: u64) -> EngineResult<ContractView> {
        let state = self.state.lock().unwrap();
        state
            .contracts
            .get(&contract_id)
            .cloned()
            .ok_or(EngineError::ContractNotFound { contract_id })
    }

    async fn contract_milestones(&self, contract_id: u64) -> EngineResult<Vec<MilestoneView>> {
        let state = self.state.lock().unwrap();
        state
            .milestones
            .get(&contract_id)
            .cloned()
            .ok_or(EngineError::ContractNotFound { contract_id })
    }

    async fn milestone(&self, contract_id: u64, index: u8) -> EngineResult<MilestoneView> {
        let milestones = self.contract_milestones(contract_id).await?;
        milestones
            .into_iter()
            .find(|m| m.index == index)
            .ok_or(EngineError::MilestoneIndex { contract_id, index })
    }

    async fn contract_progress(&self, contract_id: u64) -> EngineResult<ContractProgress> {
        let state = self.state.lock().unwrap();
        Self::progress_of(&state, contract_id)
    }

    async fn open_tenders(&self) -> EngineResult<Vec<u64>> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<u64> = state
            .tenders
            .values()
            .filter(|t| t.status == TenderStatus::Open)
            .map(|t| t.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn create_tender(&self, params: CreateTender) -> EngineResult<PendingWrite> {
        let mut state = self.state.lock().unwrap();
        let id = state.tenders.keys().max().copied().unwrap_or(0) + 1;
        state.tenders.insert(
            id,
            TenderView {
                id,
                owner: Address::from_low_u64_be(0xaa),
                title: params.title,
                category: params.category,
                estimated_budget: params.estimated_budget,
                window_start: params.window_start,
                window_end: params.window_end,
                status: TenderStatus::Draft,
                contract_id: None,
            },
        );
        Ok(self.next_tx())
    }

    async fn open_for_bidding(&self, tender_id: u64) -> EngineResult<PendingWrite> {
        let mut state = self.state.lock().unwrap();
        let tender = state
            .tenders
            .get_mut(&tender_id)
            .ok_or(EngineError::TenderNotFound { tender_id })?;
        if tender.status != TenderStatus::Draft {
            return Err(EngineError::LedgerRejected {
                reason: "tender is not a draft".to_string(),
            });
        }
        tender.status = TenderStatus::Open;
        Ok(self.next_tx())
    }

    async fn submit_bid(
        &self,
        tender_id: u64,
        amount: U256,
        proposal_cid: String,
    ) -> EngineResult<PendingWrite> {
        if amount.is_zero() {
            return Err(EngineError::LedgerRejected {
                reason: "bid amount must be positive".to_string(),
            });
        }
        let mut state = self.state.lock().unwrap();
        if !state.tenders.contains_key(&tender_id) {
            return Err(EngineError::TenderNotFound { tender_id });
        }
        let id = state.next_bid_id;
        state.next_bid_id += 1;
        state.bids.insert(
            id,
            BidView {
                id,
                tender_id,
                bidder: Address::from_low_u64_be(0xb1d),
                amount,
                proposal_cid,
                status: BidStatus::Submitted,
            },
        );
        Ok(self.next_tx())
    }

    async fn withdraw_bid(&self, bid_id: u64) -> EngineResult<PendingWrite> {
        let mut state = self.state.lock().unwrap();
        let bid = state
            .bids
            .get_mut(&bid_id)
            .ok_or(EngineError::BidNotFound { bid_id })?;
        bid.status = BidStatus::Withdrawn;
        Ok(self.next_tx())
    }

    async fn close_and_award(
        &self,
        tender_id: u64,
        contract_start: u64,
        contract_end: u64,
    ) -> EngineResult<PendingWrite> {
        let mut state = self.state.lock().unwrap();
        let eligibility = Self::eligibility(&state, tender_id, self.now());
        if !eligibility.eligible {
            return Err(EngineError::LedgerRejected {
                reason: eligibility.reason,
            });
        }

        let winner = state
            .bids
            .values()
            .filter(|b| b.tender_id == tender_id && b.status != BidStatus::Withdrawn)
            .min_by(|a, b| a.amount.cmp(&b.amount).then(a.id.cmp(&b.id)))
            .cloned()
            .ok_or(EngineError::LedgerRejected {
                reason: "no active bids".to_string(),
            })?;

        Self::award(&mut state, tender_id, winner, contract_start, contract_end)?;
        Ok(self.next_tx())
    }

    async fn close_bidding(&self, tender_id: u64) -> EngineResult<PendingWrite> {
        let mut state = self.state.lock().unwrap();
        let tender = state
            .tenders
            .get_mut(&tender_id)
            .ok_or(EngineError::TenderNotFound { tender_id })?;
        if tender.status != TenderStatus::Open {
            return Err(EngineError::LedgerRejected {
                reason: "tender is not open".to_string(),
            });
        }
        tender.status = TenderStatus::Closed;
        Ok(self.next_tx())
    }

    async fn accept_bid_and_award(
        &self,
        tender_id: u64,
        bid_id: u64,
        contract_start: u64,
        contract_end: u64,
    ) -> EngineResult<PendingWrite> {
        let mut state = self.state.lock().unwrap();
        let tender = state
            .tenders
            .get(&tender_id)
            .ok_or(EngineError::TenderNotFound { tender_id })?;
        if !matches!(tender.status, TenderStatus::Open | TenderStatus::Closed) {
            return Err(EngineError::LedgerRejected {
                reason: "tender cannot be awarded".to_string(),
            });
        }
        let winner = state
            .bids
            .get(&bid_id)
            .filter(|b| b.tender_id == tender_id && b.status != BidStatus::Withdrawn)
            .cloned()
            .ok_or(EngineError::LedgerRejected {
                reason: "bid is not acceptable".to_string(),
            })?;

        Self::award(&mut state, tender_id, winner, contract_start, contract_end)?;
        Ok(self.next_tx())
    }

    async fn complete_milestone(&self, contract_id: u64, index: u8) -> EngineResult<PendingWrite> {
        let now = self.now();
        let mut state = self.state.lock().unwrap();
        let milestones = state
            .milestones
            .get_mut(&contract_id)
            .ok_or(EngineError::ContractNotFound { contract_id })?;

        let first_incomplete = milestones.iter().position(|m| !m.completed);
        match first_incomplete {
            Some(pos) if pos as u8 == index => {
                milestones[pos].completed = true;
                milestones[pos].completed_at = Some(now);
                Ok(self.next_tx())
            }
            _ => Err(EngineError::LedgerRejected {
                reason: "milestone out of order".to_string(),
            }),
        }
    }

    async fn set_payout_address(
        &self,
        contract_id: u64,
        address: String,
    ) -> EngineResult<PendingWrite> {
        let mut state = self.state.lock().unwrap();
        let contract = state
            .contracts
            .get_mut(&contract_id)
            .ok_or(EngineError::ContractNotFound { contract_id })?;
        contract.payout_address = Some(address);
        Ok(self.next_tx())
    }

    async fn wait_confirmed(&self, write: &PendingWrite) -> EngineResult<WriteReceipt> {
        Ok(WriteReceipt {
            tx_hash: write.tx_hash,
            block_number: self.tx_counter.load(Ordering::SeqCst),
            success: true,
        })
    }
}

#[derive(Default)]
struct ReplicaState {
    tenders: HashMap<u64, TenderView>,
    bids: HashMap<u64, BidView>,
    payments: HashMap<u64, PaymentRecord>,
    failures: HashMap<u64, SettlementFailure>,
}

/// In-memory replica with the mirror's overwrite semantics
#[derive(Default)]
pub struct MemoryReplica {
    state: Mutex<ReplicaState>,
}

impl MemoryReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tender(&self, tender_id: u64) -> Option<TenderView> {
        self.state.lock().unwrap().tenders.get(&tender_id).cloned()
    }

    pub fn payment(&self, contract_id: u64) -> Option<PaymentRecord> {
        self.state.lock().unwrap().payments.get(&contract_id).cloned()
    }

    pub fn payment_count(&self) -> usize {
        self.state.lock().unwrap().payments.len()
    }

    pub fn failure(&self, contract_id: u64) -> Option<SettlementFailure> {
        self.state.lock().unwrap().failures.get(&contract_id).cloned()
    }
}

#[async_trait]
impl Replica for MemoryReplica {
    async fn upsert_tender(
        &self,
        tender: &TenderView,
        _ledger_tx_hash: Option<H256>,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.tenders.insert(tender.id, tender.clone());
        Ok(())
    }

    async fn upsert_bid(&self, bid: &BidView) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.bids.insert(bid.id, bid.clone());
        Ok(())
    }

    async fn insert_payment(&self, payment: &PaymentRecord) -> EngineResult<bool> {
        let mut state = self.state.lock().unwrap();
        if state.payments.contains_key(&payment.contract_id) {
            return Ok(false);
        }
        state.payments.insert(payment.contract_id, payment.clone());
        Ok(true)
    }

    async fn payment_exists(&self, contract_id: u64) -> EngineResult<bool> {
        Ok(self.state.lock().unwrap().payments.contains_key(&contract_id))
    }

    async fn record_settlement_failure(&self, contract_id: u64, reason: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.failures.insert(
            contract_id,
            SettlementFailure {
                contract_id,
                reason: reason.to_string(),
                occurred_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn clear_settlement_failure(&self, contract_id: u64) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.failures.remove(&contract_id);
        Ok(())
    }
}

/// Configurable settlement target that records every transfer
pub struct MockSettlementTarget {
    calls: Mutex<Vec<(String, u64)>>,
    fail: AtomicBool,
    balance: AtomicU64,
}

impl MockSettlementTarget {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            balance: AtomicU64::new(u64::MAX),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn set_balance(&self, balance: u64) {
        self.balance.store(balance, Ordering::SeqCst);
    }

    pub fn transfers(&self) -> Vec<(String, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SettlementTarget for MockSettlementTarget {
    async fn pay(&self, recipient: &str, amount_minor_units: u64) -> EngineResult<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Internal("transfer rejected".to_string()));
        }
        let mut calls = self.calls.lock().unwrap();
        calls.push((recipient.to_string(), amount_minor_units));
        Ok(format!("stx-{}", calls.len()))
    }

    async fn balance(&self, _address: &str) -> EngineResult<u64> {
        Ok(self.balance.load(Ordering::SeqCst))
    }
}

/// Conversion stub with a fixed multiplier, for tests that need something
/// other than the one-to-one placeholder
pub struct FixedConversion(pub u64);

impl ValueConversion for FixedConversion {
    fn to_settlement_units(&self, value: U256) -> EngineResult<u64> {
        let base: u64 = value
            .try_into()
            .map_err(|_| EngineError::Conversion("value exceeds u64".to_string()))?;
        base.checked_mul(self.0)
            .ok_or_else(|| EngineError::Conversion("conversion overflow".to_string()))
    }
}
