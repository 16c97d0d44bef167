//! Ledger RPC provider with multi-endpoint support and automatic failover

use crate::config::{GasPriceStrategy, LedgerConfig};
use crate::error::{EngineError, EngineResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct LedgerProvider {
    /// Ledger configuration
    config: LedgerConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Last known block number
    last_block: RwLock<u64>,
}

impl LedgerProvider {
    /// Create a new ledger provider
    pub async fn new(config: LedgerConfig) -> EngineResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added RPC provider: {}", url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(EngineError::LedgerConnection(
                "No valid RPC providers".to_string(),
            ));
        }

        let initial_block = http_providers[0]
            .get_block_number()
            .await
            .map(|b| b.as_u64())
            .unwrap_or(0);

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            last_block: RwLock::new(initial_block),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Ledger RPC failover to provider {}", next);
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> EngineResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => {
                    let block_num = block.as_u64();
                    *self.last_block.write().await = block_num;
                    return Ok(block_num);
                }
                Err(e) => {
                    warn!("Failed to get block number: {}", e);
                    self.failover();
                }
            }
        }

        Err(EngineError::LedgerConnection(
            "All providers failed".to_string(),
        ))
    }

    /// Execute an eth_call with failover
    pub async fn call(&self, tx: &TypedTransaction) -> EngineResult<Bytes> {
        for _ in 0..self.http_providers.len() {
            match self.http().call(tx, None).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    // Revert reasons are real answers, not connection failures
                    if let Some(reason) = revert_reason(&e) {
                        return Err(EngineError::LedgerRejected { reason });
                    }
                    warn!("eth_call failed: {}", e);
                    self.failover();
                }
            }
        }

        Err(EngineError::LedgerConnection(
            "All providers failed eth_call".to_string(),
        ))
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> EngineResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| EngineError::LedgerConnection(e.to_string()))
    }

    /// Get logs for a filter with failover
    pub async fn get_logs(&self, filter: &Filter) -> EngineResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get logs: {}", e);
                    self.failover();
                }
            }
        }

        Err(EngineError::LedgerConnection(
            "All providers failed to get logs".to_string(),
        ))
    }

    /// Get the account nonce for an address
    pub async fn get_transaction_count(&self, address: Address) -> EngineResult<u64> {
        self.http()
            .get_transaction_count(address, None)
            .await
            .map(|n| n.as_u64())
            .map_err(|e| EngineError::LedgerConnection(e.to_string()))
    }

    /// Estimate gas for a transaction; reverts surface the ledger's reason
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> EngineResult<U256> {
        self.http().estimate_gas(tx, None).await.map_err(|e| {
            if let Some(reason) = revert_reason(&e) {
                EngineError::LedgerRejected { reason }
            } else {
                EngineError::Gas(e.to_string())
            }
        })
    }

    /// Get current gas price based on the configured strategy
    pub async fn get_gas_price(&self) -> EngineResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| EngineError::Gas(e.to_string()))?;
                Ok(GasPrice::Legacy(self.cap(price)))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> EngineResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| EngineError::Gas(e.to_string()))?
            .ok_or_else(|| EngineError::Gas("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| EngineError::Gas("No base fee in block".to_string()))?;

        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei default

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = self.cap(base_fee * 2 + priority_fee);

        Ok((max_fee, priority_fee))
    }

    fn cap(&self, price: U256) -> U256 {
        let max = U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        std::cmp::min(price, max)
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Ledger health check failed: {}", e);
                false
            }
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn contract_address(&self) -> &str {
        &self.config.contract_address
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.config.confirmation_blocks
    }
}

/// Extract a solidity revert reason from a provider error, if present
fn revert_reason<E: std::fmt::Display>(err: &E) -> Option<String> {
    let msg = err.to_string();
    let needle = "execution reverted";
    let idx = msg.find(needle)?;
    let tail = msg[idx + needle.len()..]
        .trim_start_matches([':', ' '])
        .trim();
    if tail.is_empty() {
        Some("execution reverted".to_string())
    } else {
        Some(tail.to_string())
    }
}

/// Gas price types
#[derive(Debug, Clone)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revert_reason_extraction() {
        let err = "error: execution reverted: tender is not open";
        assert_eq!(
            revert_reason(&err).as_deref(),
            Some("tender is not open")
        );

        let bare = "execution reverted";
        assert_eq!(revert_reason(&bare).as_deref(), Some("execution reverted"));

        let other = "connection refused";
        assert!(revert_reason(&other).is_none());
    }
}
