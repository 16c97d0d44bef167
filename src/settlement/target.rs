//! Secondary ledger access and value conversion

use crate::config::SettlementConfig;
use crate::error::{EngineError, EngineResult};

use async_trait::async_trait;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// A settlement network that can execute contractor payouts.
///
/// One implementation per network; the bridge only ever sees this trait.
#[async_trait]
pub trait SettlementTarget: Send + Sync {
    /// Execute a single transfer; returns the network's transaction reference
    async fn pay(&self, recipient: &str, amount_minor_units: u64) -> EngineResult<String>;

    /// Current balance of an account in minor units
    async fn balance(&self, address: &str) -> EngineResult<u64>;
}

/// Strategy for mapping primary-ledger contract value into settlement minor
/// units. Injectable so the placeholder below can be replaced without
/// touching the pipeline.
pub trait ValueConversion: Send + Sync {
    fn to_settlement_units(&self, contract_value: U256) -> EngineResult<u64>;
}

/// Placeholder 1:1 mapping between primary-ledger value and settlement minor
/// units. Carried over from the source system as an explicit strategy rather
/// than silently corrected; a real deployment swaps in an exchange rate here.
pub struct OneToOne;

impl ValueConversion for OneToOne {
    fn to_settlement_units(&self, contract_value: U256) -> EngineResult<u64> {
        if contract_value > U256::from(u64::MAX) {
            return Err(EngineError::Conversion(format!(
                "contract value {} exceeds settlement unit range",
                contract_value
            )));
        }
        Ok(contract_value.as_u64())
    }
}

/// REST gateway client for the secondary settlement ledger
pub struct RestSettlementLedger {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct TransferRequest<'a> {
    recipient: &'a str,
    amount: u64,
}

#[derive(Deserialize)]
struct TransferResponse {
    tx_ref: String,
}

#[derive(Deserialize)]
struct BalanceResponse {
    balance: u64,
}

impl RestSettlementLedger {
    pub fn new(config: &SettlementConfig) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::Config(format!("settlement client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SettlementTarget for RestSettlementLedger {
    async fn pay(&self, recipient: &str, amount_minor_units: u64) -> EngineResult<String> {
        let url = format!("{}/transfers", self.base_url);
        debug!("Submitting transfer of {} to {}", amount_minor_units, recipient);

        let response = self
            .http
            .post(&url)
            .json(&TransferRequest {
                recipient,
                amount: amount_minor_units,
            })
            .send()
            .await
            .map_err(|e| EngineError::LedgerConnection(format!("settlement: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::LedgerRejected {
                reason: format!("settlement transfer rejected ({}): {}", status, body),
            });
        }

        let transfer: TransferResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Codec(format!("settlement response: {}", e)))?;

        info!(
            "Settlement transfer of {} to {} confirmed: {}",
            amount_minor_units, recipient, transfer.tx_ref
        );
        Ok(transfer.tx_ref)
    }

    async fn balance(&self, address: &str) -> EngineResult<u64> {
        let url = format!("{}/accounts/{}/balance", self.base_url, address);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::LedgerConnection(format!("settlement: {}", e)))?
            .error_for_status()
            .map_err(|e| EngineError::LedgerConnection(format!("settlement: {}", e)))?;

        let balance: BalanceResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Codec(format!("settlement response: {}", e)))?;

        Ok(balance.balance)
    }
}
