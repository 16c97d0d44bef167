//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Ledger connection status and listener progress
//! - Closing attempts, conflicts and successes
//! - Milestone and settlement throughput

use crate::error::EngineResult;
use crate::events::LedgerEvent;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Ledger metrics
    pub static ref LEDGER_CONNECTED: Gauge = register_gauge!(
        "tender_engine_ledger_connected",
        "Primary ledger connection status (1=connected, 0=disconnected)"
    ).unwrap();

    pub static ref LEDGER_BLOCK_HEIGHT: Gauge = register_gauge!(
        "tender_engine_ledger_block_height",
        "Last block processed by the event listener"
    ).unwrap();

    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "tender_engine_events_received_total",
        "Total ledger events received by type",
        &["event_type"]
    ).unwrap();

    // Closing metrics
    pub static ref CLOSE_ATTEMPTS: Counter = register_counter!(
        "tender_engine_close_attempts_total",
        "Total close-and-award submissions"
    ).unwrap();

    pub static ref CLOSE_CONFLICTS: Counter = register_counter!(
        "tender_engine_close_conflicts_total",
        "Close attempts rejected because another writer won the race"
    ).unwrap();

    pub static ref CLOSE_FAILURES: Counter = register_counter!(
        "tender_engine_close_failures_total",
        "Close evaluations that failed and will retry next tick"
    ).unwrap();

    pub static ref TENDERS_CLOSED: Counter = register_counter!(
        "tender_engine_tenders_closed_total",
        "Tenders successfully closed and awarded by this process"
    ).unwrap();

    // Milestone metrics
    pub static ref MILESTONES_COMPLETED: Counter = register_counter!(
        "tender_engine_milestones_completed_total",
        "Milestones confirmed complete through this process"
    ).unwrap();

    // Settlement metrics
    pub static ref SETTLEMENTS_PAID: Counter = register_counter!(
        "tender_engine_settlements_paid_total",
        "Settlement transfers executed and recorded"
    ).unwrap();

    pub static ref SETTLEMENTS_FAILED: Counter = register_counter!(
        "tender_engine_settlements_failed_total",
        "Settlement transfers queued for manual operator retry"
    ).unwrap();

    pub static ref SETTLEMENT_AMOUNT: Histogram = register_histogram!(
        "tender_engine_settlement_amount_minor_units",
        "Distribution of payout amounts in settlement minor units",
        prometheus::exponential_buckets(1_000.0, 10.0, 8).unwrap()
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECKS: Counter = register_counter!(
        "tender_engine_health_checks_total",
        "Total health check passes"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> EngineResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::error::EngineError::Internal(e.to_string()))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::EngineError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// Helper functions to record metrics

pub fn record_ledger_health(healthy: bool) {
    LEDGER_CONNECTED.set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_blocks_processed(block_number: u64) {
    LEDGER_BLOCK_HEIGHT.set(block_number as f64);
}

pub fn record_event(event: &LedgerEvent) {
    EVENTS_RECEIVED.with_label_values(&[event.name()]).inc();
}

pub fn record_close_attempt() {
    CLOSE_ATTEMPTS.inc();
}

pub fn record_close_conflict() {
    CLOSE_CONFLICTS.inc();
}

pub fn record_close_failure() {
    CLOSE_FAILURES.inc();
}

pub fn record_tender_closed() {
    TENDERS_CLOSED.inc();
}

pub fn record_milestone_completed() {
    MILESTONES_COMPLETED.inc();
}

pub fn record_settlement_paid(amount_minor_units: u64) {
    SETTLEMENTS_PAID.inc();
    SETTLEMENT_AMOUNT.observe(amount_minor_units as f64);
}

pub fn record_settlement_failed() {
    SETTLEMENTS_FAILED.inc();
}

pub fn record_health_check() {
    HEALTH_CHECKS.inc();
}
