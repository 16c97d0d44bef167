//! PostgreSQL-backed state mirror

use crate::config::DatabaseConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::LedgerEvent;
use crate::ledger::types::{BidView, TenderView};

use super::{PaymentRecord, Replica, SettlementFailure};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::H256;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info, warn};

/// Mirror backed by a PostgreSQL pool
pub struct StateMirror {
    pool: PgPool,
}

impl StateMirror {
    pub async fn new(config: &DatabaseConfig) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(EngineError::Database)?;

        Ok(Self { pool })
    }

    /// Create mirror tables
    pub async fn run_migrations(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listener_checkpoint (
                id SMALLINT PRIMARY KEY CHECK (id = 1),
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenders (
                tender_id BIGINT PRIMARY KEY,
                owner VARCHAR(66) NOT NULL,
                title TEXT NOT NULL,
                category TEXT NOT NULL,
                estimated_budget TEXT NOT NULL,
                window_start BIGINT NOT NULL,
                window_end BIGINT NOT NULL,
                status VARCHAR(16) NOT NULL,
                contract_id BIGINT,
                ledger_tx_hash VARCHAR(66),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bids (
                bid_id BIGINT PRIMARY KEY,
                tender_id BIGINT NOT NULL,
                bidder VARCHAR(66) NOT NULL,
                amount TEXT NOT NULL,
                status VARCHAR(16) NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Best-effort one-active-bid-per-bidder rule; the ledger itself does
        // not enforce this, so a violation here is logged and skipped rather
        // than treated as corruption
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS uq_bids_active_bidder
            ON bids (tender_id, bidder)
            WHERE status IN ('submitted', 'accepted')
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS payments (
                contract_id BIGINT PRIMARY KEY,
                recipient TEXT NOT NULL,
                amount_minor_units BIGINT NOT NULL,
                tx_ref TEXT NOT NULL,
                paid_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settlement_failures (
                contract_id BIGINT PRIMARY KEY,
                reason TEXT NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_events (
                id BIGSERIAL PRIMARY KEY,
                block_number BIGINT NOT NULL,
                tx_hash VARCHAR(66) NOT NULL,
                event_type VARCHAR(50) NOT NULL,
                event_data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_events_block
            ON ledger_events (block_number)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Mirror migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> EngineResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(EngineError::Database)?;
        Ok(())
    }

    /// Last block processed by the listener
    pub async fn get_checkpoint(&self) -> EngineResult<u64> {
        let row = sqlx::query("SELECT block_number FROM listener_checkpoint WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|r| r.get::<i64, _>("block_number") as u64)
            .unwrap_or(0))
    }

    pub async fn save_checkpoint(&self, block_number: u64) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO listener_checkpoint (id, block_number, updated_at)
            VALUES (1, $1, NOW())
            ON CONFLICT (id)
            DO UPDATE SET block_number = $1, updated_at = NOW()
            "#,
        )
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved listener checkpoint: block {}", block_number);
        Ok(())
    }

    /// Append a ledger event to the journal
    pub async fn record_event(&self, event: &LedgerEvent) -> EngineResult<()> {
        let event_data =
            serde_json::to_value(event).map_err(|e| EngineError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO ledger_events (block_number, tx_hash, event_type, event_data)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event.block_number() as i64)
        .bind(format!("{:?}", event.tx_hash()))
        .bind(event.name())
        .bind(event_data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All mirrored tenders, newest first
    pub async fn list_tenders(&self) -> EngineResult<Vec<TenderRow>> {
        let rows = sqlx::query(
            r#"
            SELECT tender_id, owner, title, category, estimated_budget,
                   window_start, window_end, status, contract_id, ledger_tx_hash, updated_at
            FROM tenders
            ORDER BY tender_id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(tender_row).collect())
    }

    pub async fn get_tender(&self, tender_id: u64) -> EngineResult<Option<TenderRow>> {
        let row = sqlx::query(
            r#"
            SELECT tender_id, owner, title, category, estimated_budget,
                   window_start, window_end, status, contract_id, ledger_tx_hash, updated_at
            FROM tenders
            WHERE tender_id = $1
            "#,
        )
        .bind(tender_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(tender_row))
    }

    pub async fn list_payments(&self) -> EngineResult<Vec<PaymentRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT contract_id, recipient, amount_minor_units, tx_ref, paid_at
            FROM payments
            ORDER BY paid_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PaymentRecord {
                contract_id: row.get::<i64, _>("contract_id") as u64,
                recipient: row.get("recipient"),
                amount_minor_units: row.get::<i64, _>("amount_minor_units") as u64,
                tx_ref: row.get("tx_ref"),
                paid_at: row.get("paid_at"),
            })
            .collect())
    }

    /// The operator queue of settlement attempts that need manual retry
    pub async fn list_settlement_failures(&self) -> EngineResult<Vec<SettlementFailure>> {
        let rows = sqlx::query(
            r#"
            SELECT contract_id, reason, occurred_at
            FROM settlement_failures
            ORDER BY occurred_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| SettlementFailure {
                contract_id: row.get::<i64, _>("contract_id") as u64,
                reason: row.get("reason"),
                occurred_at: row.get("occurred_at"),
            })
            .collect())
    }

    /// Tender counts by status, plus payment count
    pub async fn get_stats(&self) -> EngineResult<MirrorStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'open') as open,
                COUNT(*) FILTER (WHERE status = 'closed') as closed,
                COUNT(*) FILTER (WHERE status = 'awarded') as awarded,
                COUNT(*) FILTER (WHERE status = 'cancelled') as cancelled,
                (SELECT COUNT(*) FROM payments) as payments,
                (SELECT COUNT(*) FROM settlement_failures) as settlement_failures
            FROM tenders
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(MirrorStats {
            open: row.get::<i64, _>("open") as u64,
            closed: row.get::<i64, _>("closed") as u64,
            awarded: row.get::<i64, _>("awarded") as u64,
            cancelled: row.get::<i64, _>("cancelled") as u64,
            payments: row.get::<i64, _>("payments") as u64,
            settlement_failures: row.get::<i64, _>("settlement_failures") as u64,
        })
    }
}

#[async_trait]
impl Replica for StateMirror {
    async fn upsert_tender(
        &self,
        tender: &TenderView,
        ledger_tx_hash: Option<H256>,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tenders
                (tender_id, owner, title, category, estimated_budget,
                 window_start, window_end, status, contract_id, ledger_tx_hash, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (tender_id)
            DO UPDATE SET
                owner = $2, title = $3, category = $4, estimated_budget = $5,
                window_start = $6, window_end = $7, status = $8, contract_id = $9,
                ledger_tx_hash = COALESCE($10, tenders.ledger_tx_hash),
                updated_at = NOW()
            "#,
        )
        .bind(tender.id as i64)
        .bind(format!("{:?}", tender.owner))
        .bind(&tender.title)
        .bind(&tender.category)
        .bind(tender.estimated_budget.to_string())
        .bind(tender.window_start as i64)
        .bind(tender.window_end as i64)
        .bind(tender.status.as_str())
        .bind(tender.contract_id.map(|id| id as i64))
        .bind(ledger_tx_hash.map(|h| format!("0x{}", hex::encode(h))))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_bid(&self, bid: &BidView) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO bids (bid_id, tender_id, bidder, amount, status, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (bid_id)
            DO UPDATE SET
                tender_id = $2, bidder = $3, amount = $4, status = $5, updated_at = NOW()
            "#,
        )
        .bind(bid.id as i64)
        .bind(bid.tender_id as i64)
        .bind(format!("{:?}", bid.bidder))
        .bind(bid.amount.to_string())
        .bind(bid.status.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            // A bidder holding two active ledger-level bids trips the partial
            // unique index. The ledger allows it, so the mirror only warns.
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                warn!(
                    "Bid {} violates one-active-bid-per-bidder on tender {}; skipping mirror row",
                    bid.id, bid.tender_id
                );
                Ok(())
            }
            Err(e) => Err(EngineError::Database(e)),
        }
    }

    async fn insert_payment(&self, payment: &PaymentRecord) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO payments (contract_id, recipient, amount_minor_units, tx_ref, paid_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (contract_id) DO NOTHING
            "#,
        )
        .bind(payment.contract_id as i64)
        .bind(&payment.recipient)
        .bind(payment.amount_minor_units as i64)
        .bind(&payment.tx_ref)
        .bind(payment.paid_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn payment_exists(&self, contract_id: u64) -> EngineResult<bool> {
        let row = sqlx::query("SELECT 1 as present FROM payments WHERE contract_id = $1")
            .bind(contract_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn record_settlement_failure(&self, contract_id: u64, reason: &str) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settlement_failures (contract_id, reason, occurred_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (contract_id)
            DO UPDATE SET reason = $2, occurred_at = NOW()
            "#,
        )
        .bind(contract_id as i64)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_settlement_failure(&self, contract_id: u64) -> EngineResult<()> {
        sqlx::query("DELETE FROM settlement_failures WHERE contract_id = $1")
            .bind(contract_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn tender_row(row: sqlx::postgres::PgRow) -> TenderRow {
    TenderRow {
        tender_id: row.get::<i64, _>("tender_id") as u64,
        owner: row.get("owner"),
        title: row.get("title"),
        category: row.get("category"),
        estimated_budget: row.get("estimated_budget"),
        window_start: row.get::<i64, _>("window_start") as u64,
        window_end: row.get::<i64, _>("window_end") as u64,
        status: row.get("status"),
        contract_id: row.get::<Option<i64>, _>("contract_id").map(|id| id as u64),
        ledger_tx_hash: row.get("ledger_tx_hash"),
        updated_at: row.get("updated_at"),
    }
}

/// Mirrored tender as served to the operator API
#[derive(Debug, Clone, Serialize)]
pub struct TenderRow {
    pub tender_id: u64,
    pub owner: String,
    pub title: String,
    pub category: String,
    pub estimated_budget: String,
    pub window_start: u64,
    pub window_end: u64,
    pub status: String,
    pub contract_id: Option<u64>,
    pub ledger_tx_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate mirror statistics
#[derive(Debug, Clone, Serialize)]
pub struct MirrorStats {
    pub open: u64,
    pub closed: u64,
    pub awarded: u64,
    pub cancelled: u64,
    pub payments: u64,
    pub settlement_failures: u64,
}
