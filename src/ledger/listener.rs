//! Ledger event listener with checkpointed HTTP log polling

use crate::error::{EngineError, EngineResult};
use crate::events::{EventParser, LedgerEvent};
use crate::mirror::StateMirror;

use super::LedgerProvider;

use ethers::types::{Address, BlockNumber, Filter};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Listens for tender contract events on the primary ledger
pub struct LedgerListener {
    provider: Arc<LedgerProvider>,
    /// Event broadcast channel
    event_tx: broadcast::Sender<LedgerEvent>,
    /// Mirror, for checkpoint persistence and the event journal
    mirror: Arc<StateMirror>,
    /// Last processed block
    last_processed_block: RwLock<u64>,
    event_parser: EventParser,
    contract: Address,
}

impl LedgerListener {
    pub async fn new(
        provider: Arc<LedgerProvider>,
        event_tx: broadcast::Sender<LedgerEvent>,
        mirror: Arc<StateMirror>,
    ) -> EngineResult<Self> {
        let contract = Address::from_str(provider.contract_address())
            .map_err(|e| EngineError::Config(format!("Invalid contract address: {}", e)))?;

        // Resume from the last persisted checkpoint
        let last_block = mirror.get_checkpoint().await.unwrap_or(0);

        Ok(Self {
            provider,
            event_tx,
            mirror,
            last_processed_block: RwLock::new(last_block),
            event_parser: EventParser::new(),
            contract,
        })
    }

    /// Main polling loop; runs until the task is aborted
    pub async fn listen(&self) -> EngineResult<()> {
        let poll_interval = Duration::from_secs(2);

        loop {
            let current_block = match self.provider.get_block_number().await {
                Ok(b) => b,
                Err(e) => {
                    warn!("Failed to get block number: {}", e);
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
            };

            let last_block = *self.last_processed_block.read().await;

            if current_block <= last_block {
                tokio::time::sleep(poll_interval).await;
                continue;
            }

            // Bounded range to keep log queries small
            let from_block = last_block + 1;
            let to_block = std::cmp::min(current_block, from_block + 1000);

            debug!("Processing blocks {} to {}", from_block, to_block);

            let filter = Filter::new()
                .address(self.contract)
                .from_block(BlockNumber::Number(from_block.into()))
                .to_block(BlockNumber::Number(to_block.into()));

            match self.provider.get_logs(&filter).await {
                Ok(logs) => {
                    for log in logs {
                        if let Err(e) = self.process_log(&log).await {
                            error!("Failed to process log: {}", e);
                        }
                    }

                    *self.last_processed_block.write().await = to_block;
                    if let Err(e) = self.mirror.save_checkpoint(to_block).await {
                        warn!("Failed to save checkpoint: {}", e);
                    }

                    crate::metrics::record_blocks_processed(to_block);
                }
                Err(e) => {
                    // Checkpoint untouched, the range is retried next pass
                    warn!("Failed to get logs: {}", e);
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn process_log(&self, log: &ethers::types::Log) -> EngineResult<()> {
        let event = self.event_parser.parse_log(log)?;

        debug!("Ledger event: {}", event.name());
        crate::metrics::record_event(&event);

        // No receivers is fine; the journal below still records it
        let _ = self.event_tx.send(event.clone());

        self.mirror.record_event(&event).await?;
        Ok(())
    }
}
