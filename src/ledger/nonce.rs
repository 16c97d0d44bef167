//! Nonce management for reliable write submission
//!
//! Handles:
//! - Local nonce tracking to avoid conflicts between concurrent writes
//! - Gap detection and recovery by resyncing against the ledger

use crate::error::EngineResult;

use super::LedgerProvider;

use ethers::types::Address;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct NonceState {
    /// Next nonce to hand out
    current: u64,
    /// Pending submissions: nonce -> tx_hash
    pending: HashMap<u64, String>,
    /// Last nonce known confirmed on the ledger
    confirmed: u64,
}

/// Tracks the signing wallet's nonce against the primary ledger
pub struct NonceManager {
    wallet_address: Address,
    state: Mutex<NonceState>,
}

impl NonceManager {
    pub fn new(wallet_address: Address) -> Self {
        Self {
            wallet_address,
            state: Mutex::new(NonceState {
                current: 0,
                pending: HashMap::new(),
                confirmed: 0,
            }),
        }
    }

    /// Initialize from the ledger's current account nonce
    pub async fn init(&self, provider: &LedgerProvider) -> EngineResult<()> {
        let on_chain = provider.get_transaction_count(self.wallet_address).await?;

        let mut state = self.state.lock().await;
        state.current = on_chain;
        state.confirmed = on_chain.saturating_sub(1);
        state.pending.clear();

        debug!("Initialized wallet nonce: {}", on_chain);
        Ok(())
    }

    /// Allocate the next nonce
    pub async fn next(&self) -> u64 {
        let mut state = self.state.lock().await;
        let nonce = state.current;
        state.current += 1;
        debug!("Allocated nonce {}", nonce);
        nonce
    }

    /// Mark a nonce as pending with its transaction hash
    pub async fn mark_pending(&self, nonce: u64, tx_hash: &str) {
        let mut state = self.state.lock().await;
        state.pending.insert(nonce, tx_hash.to_string());
    }

    /// Confirm a nonce (transaction mined)
    pub async fn confirm(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.pending.remove(&nonce);
        if nonce > state.confirmed {
            state.confirmed = nonce;
        }
    }

    /// Release a nonce after a failed submission so it can be reused
    pub async fn release(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.pending.remove(&nonce);
        if nonce == state.current.saturating_sub(1) {
            state.current = nonce;
        }
    }

    /// Resync against the ledger's account nonce
    pub async fn sync(&self, provider: &LedgerProvider) -> EngineResult<()> {
        let on_chain = provider.get_transaction_count(self.wallet_address).await?;

        let mut state = self.state.lock().await;

        if on_chain > state.confirmed + 1 {
            warn!(
                "Nonce gap detected: expected {}, ledger reports {}",
                state.confirmed + 1,
                on_chain
            );
        }

        state.pending.retain(|nonce, _| *nonce >= on_chain);
        state.confirmed = on_chain.saturating_sub(1);
        if state.current < on_chain {
            state.current = on_chain;
        }

        Ok(())
    }

    /// Number of submissions awaiting confirmation
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet_address
    }
}
