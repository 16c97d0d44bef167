//! Typed client over the tender contract
//!
//! Maps the contract's tuple-shaped return values into the explicit structs
//! of [`crate::ledger::types`] and submits writes as signed transactions.

use crate::config::{CoordinatorConfig, LedgerConfig};
use crate::error::{EngineError, EngineResult};
use crate::ledger::types::*;
use crate::ledger::TenderLedger;

use super::confirm::ConfirmationTracker;
use super::nonce::NonceManager;
use super::provider::{GasPrice, LedgerProvider};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::id as selector;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Production ledger client backed by an ethers provider
pub struct EthersLedger {
    provider: Arc<LedgerProvider>,
    confirmations: Arc<ConfirmationTracker>,
    nonce: Arc<NonceManager>,
    wallet: LocalWallet,
    contract: Address,
    max_retries: u32,
    retry_delay: Duration,
    inflight: DashMap<H256, u64>,
}

impl EthersLedger {
    /// Create a new client; initializes the wallet nonce from the ledger
    pub async fn new(
        provider: Arc<LedgerProvider>,
        ledger_config: &LedgerConfig,
        coordinator_config: &CoordinatorConfig,
    ) -> EngineResult<Self> {
        let wallet = Self::load_wallet(ledger_config)?.with_chain_id(ledger_config.chain_id);
        let contract = Address::from_str(&ledger_config.contract_address)
            .map_err(|e| EngineError::Config(format!("Invalid contract address: {}", e)))?;

        info!("Ledger client wallet: {:?}", wallet.address());

        let nonce = Arc::new(NonceManager::new(wallet.address()));
        nonce.init(&provider).await?;

        let confirmations = Arc::new(ConfirmationTracker::new(
            ledger_config.confirmation_blocks,
            provider.clone(),
        ));

        Ok(Self {
            provider,
            confirmations,
            nonce,
            wallet,
            contract,
            max_retries: coordinator_config.max_retries,
            retry_delay: Duration::from_millis(coordinator_config.retry_delay_ms),
            inflight: DashMap::new(),
        })
    }

    /// Load the signing wallet from the configured environment variable
    fn load_wallet(config: &LedgerConfig) -> EngineResult<LocalWallet> {
        let env_name = config
            .private_key_env
            .as_deref()
            .unwrap_or("TENDER_ENGINE_PRIVATE_KEY");

        let key = std::env::var(env_name).map_err(|_| {
            EngineError::Wallet(format!("No signing key in environment variable {}", env_name))
        })?;

        key.parse::<LocalWallet>()
            .map_err(|e| EngineError::Wallet(format!("Invalid private key: {}", e)))
    }

    pub fn confirmation_tracker(&self) -> Arc<ConfirmationTracker> {
        self.confirmations.clone()
    }

    /// Execute a read call and decode its return tuple
    async fn read(
        &self,
        signature: &str,
        args: &[Token],
        returns: &[ParamType],
    ) -> EngineResult<TokenCursor> {
        let tx = TransactionRequest::new()
            .to(self.contract)
            .data(calldata(signature, args));
        let bytes = self.provider.call(&tx.into()).await?;

        let tokens = abi::decode(returns, &bytes)
            .map_err(|e| EngineError::Codec(format!("{}: {}", signature, e)))?;
        Ok(TokenCursor::new(tokens))
    }

    /// Sign and submit a write; estimate_gas acts as the preflight that
    /// surfaces deterministic contract rejections before anything is sent
    async fn submit(&self, signature: &str, args: &[Token]) -> EngineResult<PendingWrite> {
        let nonce = self.nonce.next().await;
        let data = calldata(signature, args);

        let base = TransactionRequest::new()
            .to(self.contract)
            .data(data.clone())
            .nonce(nonce);
        let preflight: TypedTransaction = base.clone().from(self.wallet.address()).into();

        let gas_limit = match self.provider.estimate_gas(&preflight).await {
            Ok(gas) => gas * 120 / 100,
            Err(e) => {
                self.nonce.release(nonce).await;
                return Err(e);
            }
        };

        // Any failure before the transaction is sent must hand the nonce
        // back, or every later write queues behind the gap
        let gas_price = match self.provider.get_gas_price().await {
            Ok(price) => price,
            Err(e) => {
                self.nonce.release(nonce).await;
                return Err(e);
            }
        };
        let tx = build_tx(base, gas_limit, &gas_price);

        let tx_hash = self.send_with_retry(tx, nonce).await?;
        self.nonce.mark_pending(nonce, &format!("{:?}", tx_hash)).await;
        self.inflight.insert(tx_hash, nonce);

        debug!("Submitted {} as {:?}", signature, tx_hash);
        Ok(PendingWrite { tx_hash })
    }

    /// Send a signed transaction with bounded retries
    async fn send_with_retry(&self, tx: TypedTransaction, nonce: u64) -> EngineResult<H256> {
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            let signed = match self.wallet.sign_transaction(&tx).await {
                Ok(sig) => tx.rlp_signed(&sig),
                Err(e) => {
                    last_error = Some(EngineError::Wallet(e.to_string()));
                    break;
                }
            };

            let send_timeout = Duration::from_secs(30);
            let result = timeout(
                send_timeout,
                self.provider.http().send_raw_transaction(signed),
            )
            .await;

            match result {
                Ok(Ok(pending)) => {
                    let tx_hash = pending.tx_hash();
                    info!(
                        "Write sent: {:?} (attempt {}/{})",
                        tx_hash, attempt, self.max_retries
                    );
                    return Ok(tx_hash);
                }
                Ok(Err(e)) => {
                    let msg = e.to_string();
                    if msg.contains("nonce too low") {
                        warn!("Nonce too low, resyncing");
                        self.nonce.sync(&self.provider).await?;
                        last_error = Some(EngineError::Nonce("nonce too low".to_string()));
                        break;
                    }
                    last_error = Some(EngineError::LedgerConnection(msg));
                }
                Err(_) => {
                    warn!("Write send timeout (attempt {})", attempt);
                    last_error = Some(EngineError::Timeout {
                        operation: "send transaction".to_string(),
                    });
                }
            }

            if attempt < self.max_retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        self.nonce.release(nonce).await;
        Err(last_error
            .unwrap_or_else(|| EngineError::Internal("write submission failed".to_string())))
    }
}

#[async_trait]
impl TenderLedger for EthersLedger {
    async fn tender(&self, tender_id: u64) -> EngineResult<TenderView> {
        let mut out = self
            .read(
                "getTender(uint64)",
                &[Token::Uint(tender_id.into())],
                &[
                    ParamType::Address,
                    ParamType::String,
                    ParamType::String,
                    ParamType::Uint(256),
                    ParamType::Uint(64),
                    ParamType::Uint(64),
                    ParamType::Uint(8),
                    ParamType::Uint(64),
                    ParamType::Bool,
                ],
            )
            .await?;

        let owner = out.take_address()?;
        let title = out.take_string()?;
        let category = out.take_string()?;
        let estimated_budget = out.take_uint()?;
        let window_start = out.take_u64()?;
        let window_end = out.take_u64()?;
        let status = TenderStatus::from_u8(out.take_u8()?)?;
        let contract_id = out.take_u64()?;
        let has_contract = out.take_bool()?;

        Ok(TenderView {
            id: tender_id,
            owner,
            title,
            category,
            estimated_budget,
            window_start,
            window_end,
            status,
            contract_id: has_contract.then_some(contract_id),
        })
    }

    async fn bid(&self, bid_id: u64) -> EngineResult<BidView> {
        let mut out = self
            .read(
                "getBid(uint64)",
                &[Token::Uint(bid_id.into())],
                &[
                    ParamType::Uint(64),
                    ParamType::Address,
                    ParamType::Uint(256),
                    ParamType::String,
                    ParamType::Uint(8),
                ],
            )
            .await?;

        Ok(BidView {
            id: bid_id,
            tender_id: out.take_u64()?,
            bidder: out.take_address()?,
            amount: out.take_uint()?,
            proposal_cid: out.take_string()?,
            status: BidStatus::from_u8(out.take_u8()?)?,
        })
    }

    async fn tender_bids(&self, tender_id: u64) -> EngineResult<Vec<BidView>> {
        let mut out = self
            .read(
                "getTenderBids(uint64)",
                &[Token::Uint(tender_id.into())],
                &[ParamType::Array(Box::new(ParamType::Uint(64)))],
            )
            .await?;

        let mut bids = Vec::new();
        for bid_id in out.take_u64_array()? {
            bids.push(self.bid(bid_id).await?);
        }
        Ok(bids)
    }

    async fn lowest_bid(&self, tender_id: u64) -> EngineResult<Option<LowestBid>> {
        let mut out = self
            .read(
                "getLowestBid(uint64)",
                &[Token::Uint(tender_id.into())],
                &[
                    ParamType::Uint(64),
                    ParamType::Uint(256),
                    ParamType::Address,
                    ParamType::Bool,
                ],
            )
            .await?;

        let bid_id = out.take_u64()?;
        let amount = out.take_uint()?;
        let bidder = out.take_address()?;
        let exists = out.take_bool()?;

        Ok(exists.then_some(LowestBid {
            bid_id,
            amount,
            bidder,
        }))
    }

    async fn can_close(&self, tender_id: u64) -> EngineResult<CloseEligibility> {
        let mut out = self
            .read(
                "canCloseTender(uint64)",
                &[Token::Uint(tender_id.into())],
                &[ParamType::Bool, ParamType::String],
            )
            .await?;

        Ok(CloseEligibility {
            eligible: out.take_bool()?,
            reason: out.take_string()?,
        })
    }

    async fn contract(&self, contract_id: u64) -> EngineResult<ContractView> {
        let mut out = self
            .read(
                "getContract(uint64)",
                &[Token::Uint(contract_id.into())],
                &[
                    ParamType::Uint(64),
                    ParamType::Uint(64),
                    ParamType::Address,
                    ParamType::Uint(256),
                    ParamType::Uint(256),
                    ParamType::Uint(64),
                    ParamType::Uint(64),
                    ParamType::String,
                ],
            )
            .await?;

        let tender_id = out.take_u64()?;
        let winning_bid_id = out.take_u64()?;
        let contractor = out.take_address()?;
        let value = out.take_uint()?;
        let total_paid = out.take_uint()?;
        let start = out.take_u64()?;
        let end = out.take_u64()?;
        let payout = out.take_string()?;

        Ok(ContractView {
            id: contract_id,
            tender_id,
            winning_bid_id,
            contractor,
            value,
            total_paid,
            start,
            end,
            payout_address: (!payout.is_empty()).then_some(payout),
        })
    }

    async fn contract_milestones(&self, contract_id: u64) -> EngineResult<Vec<MilestoneView>> {
        let mut milestones = Vec::with_capacity(MILESTONE_COUNT as usize);
        for index in 0..MILESTONE_COUNT {
            milestones.push(self.milestone(contract_id, index).await?);
        }
        Ok(milestones)
    }

    async fn milestone(&self, contract_id: u64, index: u8) -> EngineResult<MilestoneView> {
        if index >= MILESTONE_COUNT {
            return Err(EngineError::MilestoneIndex { contract_id, index });
        }

        let mut out = self
            .read(
                "getMilestone(uint64,uint8)",
                &[Token::Uint(contract_id.into()), Token::Uint(index.into())],
                &[
                    ParamType::Uint(8),
                    ParamType::Bool,
                    ParamType::Uint(64),
                    ParamType::Bool,
                    ParamType::Uint(64),
                ],
            )
            .await?;

        let percentage = out.take_u8()?;
        let completed = out.take_bool()?;
        let completed_at = out.take_u64()?;
        let paid = out.take_bool()?;
        let paid_at = out.take_u64()?;

        Ok(MilestoneView {
            index,
            percentage,
            completed,
            completed_at: completed.then_some(completed_at),
            paid,
            paid_at: paid.then_some(paid_at),
        })
    }

    async fn contract_progress(&self, contract_id: u64) -> EngineResult<ContractProgress> {
        let mut out = self
            .read(
                "getContractProgress(uint64)",
                &[Token::Uint(contract_id.into())],
                &[
                    ParamType::Uint(64),
                    ParamType::Uint(64),
                    ParamType::Uint(256),
                    ParamType::Uint(256),
                ],
            )
            .await?;

        Ok(ContractProgress {
            contract_id,
            completed: out.take_u64()?,
            total: out.take_u64()?,
            total_paid: out.take_uint()?,
            contract_value: out.take_uint()?,
        })
    }

    async fn open_tenders(&self) -> EngineResult<Vec<u64>> {
        let mut out = self
            .read(
                "getOpenTenderIds()",
                &[],
                &[ParamType::Array(Box::new(ParamType::Uint(64)))],
            )
            .await?;
        out.take_u64_array()
    }

    async fn create_tender(&self, params: CreateTender) -> EngineResult<PendingWrite> {
        self.submit(
            "createTender(string,string,uint256,uint64,uint64)",
            &[
                Token::String(params.title),
                Token::String(params.category),
                Token::Uint(params.estimated_budget),
                Token::Uint(params.window_start.into()),
                Token::Uint(params.window_end.into()),
            ],
        )
        .await
    }

    async fn open_for_bidding(&self, tender_id: u64) -> EngineResult<PendingWrite> {
        self.submit(
            "openTenderForBidding(uint64)",
            &[Token::Uint(tender_id.into())],
        )
        .await
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
        self.submit(
            "submitBid(uint64,uint256,string)",
            &[
                Token::Uint(tender_id.into()),
                Token::Uint(amount),
                Token::String(proposal_cid),
            ],
        )
        .await
    }

    async fn withdraw_bid(&self, bid_id: u64) -> EngineResult<PendingWrite> {
        self.submit("withdrawBid(uint64)", &[Token::Uint(bid_id.into())])
            .await
    }

    async fn close_bidding(&self, tender_id: u64) -> EngineResult<PendingWrite> {
        self.submit("closeTenderBidding(uint64)", &[Token::Uint(tender_id.into())])
            .await
    }

    async fn accept_bid_and_award(
        &self,
        tender_id: u64,
        bid_id: u64,
        contract_start: u64,
        contract_end: u64,
    ) -> EngineResult<PendingWrite> {
        self.submit(
            "acceptBidAndAwardTender(uint64,uint64,uint64,uint64)",
            &[
                Token::Uint(tender_id.into()),
                Token::Uint(bid_id.into()),
                Token::Uint(contract_start.into()),
                Token::Uint(contract_end.into()),
            ],
        )
        .await
    }

    async fn close_and_award(
        &self,
        tender_id: u64,
        contract_start: u64,
        contract_end: u64,
    ) -> EngineResult<PendingWrite> {
        self.submit(
            "closeTenderAndAwardLowestBid(uint64,uint64,uint64)",
            &[
                Token::Uint(tender_id.into()),
                Token::Uint(contract_start.into()),
                Token::Uint(contract_end.into()),
            ],
        )
        .await
    }

    async fn complete_milestone(&self, contract_id: u64, index: u8) -> EngineResult<PendingWrite> {
        if index >= MILESTONE_COUNT {
            return Err(EngineError::MilestoneIndex { contract_id, index });
        }
        self.submit(
            "completeMilestone(uint64,uint8)",
            &[Token::Uint(contract_id.into()), Token::Uint(index.into())],
        )
        .await
    }

    async fn set_payout_address(
        &self,
        contract_id: u64,
        address: String,
    ) -> EngineResult<PendingWrite> {
        self.submit(
            "setAptosWallet(uint64,string)",
            &[Token::Uint(contract_id.into()), Token::String(address)],
        )
        .await
    }

    async fn wait_confirmed(&self, write: &PendingWrite) -> EngineResult<WriteReceipt> {
        let receipt = self.confirmations.wait_confirmed(write).await?;
        if let Some((_, nonce)) = self.inflight.remove(&write.tx_hash) {
            self.nonce.confirm(nonce).await;
        }
        Ok(receipt)
    }
}

/// Encode a function call as selector + ABI-encoded arguments
fn calldata(signature: &str, args: &[Token]) -> Bytes {
    let mut data = selector(signature).to_vec();
    data.extend_from_slice(&abi::encode(args));
    data.into()
}

/// Build a typed transaction for the configured gas strategy
fn build_tx(base: TransactionRequest, gas_limit: U256, gas_price: &GasPrice) -> TypedTransaction {
    let base = base.gas(gas_limit);
    match gas_price {
        GasPrice::Legacy(price) => TypedTransaction::Legacy(base.gas_price(*price)),
        GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => {
            let tx = Eip1559TransactionRequest {
                to: base.to,
                data: base.data,
                nonce: base.nonce,
                gas: base.gas,
                max_fee_per_gas: Some(*max_fee_per_gas),
                max_priority_fee_per_gas: Some(*max_priority_fee_per_gas),
                ..Default::default()
            };
            TypedTransaction::Eip1559(tx)
        }
    }
}

/// Ordered reader over a decoded return tuple
struct TokenCursor {
    tokens: std::vec::IntoIter<Token>,
}

impl TokenCursor {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens: tokens.into_iter(),
        }
    }

    fn next(&mut self) -> EngineResult<Token> {
        self.tokens
            .next()
            .ok_or_else(|| EngineError::Codec("return tuple shorter than expected".to_string()))
    }

    fn take_uint(&mut self) -> EngineResult<U256> {
        match self.next()? {
            Token::Uint(v) => Ok(v),
            other => Err(EngineError::Codec(format!("expected uint, got {:?}", other))),
        }
    }

    fn take_u64(&mut self) -> EngineResult<u64> {
        uint_to_u64(self.take_uint()?)
    }

    fn take_u8(&mut self) -> EngineResult<u8> {
        let value = self.take_uint()?;
        if value > U256::from(u8::MAX) {
            return Err(EngineError::Codec(format!(
                "uint {} out of range for u8",
                value
            )));
        }
        Ok(value.as_u64() as u8)
    }

    fn take_bool(&mut self) -> EngineResult<bool> {
        match self.next()? {
            Token::Bool(v) => Ok(v),
            other => Err(EngineError::Codec(format!("expected bool, got {:?}", other))),
        }
    }

    fn take_address(&mut self) -> EngineResult<Address> {
        match self.next()? {
            Token::Address(v) => Ok(v),
            other => Err(EngineError::Codec(format!(
                "expected address, got {:?}",
                other
            ))),
        }
    }

    fn take_string(&mut self) -> EngineResult<String> {
        match self.next()? {
            Token::String(v) => Ok(v),
            other => Err(EngineError::Codec(format!(
                "expected string, got {:?}",
                other
            ))),
        }
    }

    fn take_u64_array(&mut self) -> EngineResult<Vec<u64>> {
        match self.next()? {
            Token::Array(items) => items
                .into_iter()
                .map(|t| match t {
                    Token::Uint(v) => uint_to_u64(v),
                    other => Err(EngineError::Codec(format!(
                        "expected uint element, got {:?}",
                        other
                    ))),
                })
                .collect(),
            other => Err(EngineError::Codec(format!(
                "expected array, got {:?}",
                other
            ))),
        }
    }
}

// Contracts return uint64 fields widened to a full word; a word that does
// not fit is a malformed response, not a panic
fn uint_to_u64(value: U256) -> EngineResult<u64> {
    if value > U256::from(u64::MAX) {
        return Err(EngineError::Codec(format!(
            "uint {} out of range for u64",
            value
        )));
    }
    Ok(value.as_u64())
}
