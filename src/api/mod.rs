//! HTTP API for health checks, operator actions, and monitoring

use crate::config::ApiConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{LedgerProvider, TenderLedger};
use crate::milestone::MilestoneTracker;
use crate::mirror::{Replica, StateMirror};
use crate::settlement::{SettlementBridge, SettleOutcome};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub mirror: Arc<StateMirror>,
    pub ledger: Arc<dyn TenderLedger>,
    pub provider: Arc<LedgerProvider>,
    pub tracker: Arc<MilestoneTracker>,
    pub bridge: Arc<SettlementBridge>,
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> EngineResult<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/tenders", get(list_tenders))
        .route("/tenders/:id", get(get_tender))
        .route("/contracts/:id/progress", get(get_progress))
        .route(
            "/contracts/:id/milestones/:index/complete",
            post(complete_milestone),
        )
        .route("/payments", get(list_payments))
        .route("/settlement/failures", get(list_settlement_failures))
        .route("/settlement/:id/retry", post(retry_settlement))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the mirror and the primary ledger
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let mirror_ok = state.mirror.health_check().await.is_ok();
    let ledger_ok = state.provider.health_check().await;

    let response = ReadinessResponse {
        ready: mirror_ok && ledger_ok,
        mirror: mirror_ok,
        ledger: ledger_ok,
    };

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Get engine status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let ledger_ok = state.provider.health_check().await;
    let block_height = state.provider.get_block_number().await.unwrap_or(0);
    let stats = state.mirror.get_stats().await.ok();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        chain_id: state.provider.chain_id(),
        ledger_connected: ledger_ok,
        block_height,
        mirror: stats,
    })
}

/// List mirrored tenders. Served from the replica; rows may lag the ledger.
async fn list_tenders(State(state): State<AppState>) -> impl IntoResponse {
    match state.mirror.list_tenders().await {
        Ok(tenders) => (StatusCode::OK, Json(tenders)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Get one tender, reconciling the mirror from the ledger first so the
/// row returned reflects current ledger truth.
async fn get_tender(
    State(state): State<AppState>,
    Path(tender_id): Path<u64>,
) -> impl IntoResponse {
    if let Err(e) = state
        .mirror
        .reconcile_tender(state.ledger.as_ref(), tender_id)
        .await
    {
        // A failed reconcile degrades to serving the possibly-stale row
        if matches!(e, EngineError::TenderNotFound { .. }) {
            return error_response(&e);
        }
        warn!(tender_id, error = %e, "Reconcile failed, serving mirrored row");
    }

    match state.mirror.get_tender(tender_id).await {
        Ok(Some(row)) => (StatusCode::OK, Json(row)).into_response(),
        Ok(None) => error_response(&EngineError::TenderNotFound { tender_id }),
        Err(e) => error_response(&e),
    }
}

/// Get milestone progress for an awarded contract
async fn get_progress(
    State(state): State<AppState>,
    Path(contract_id): Path<u64>,
) -> impl IntoResponse {
    match state.ledger.contract_progress(contract_id).await {
        Ok(progress) => (StatusCode::OK, Json(progress)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Mark a milestone complete on the ledger
async fn complete_milestone(
    State(state): State<AppState>,
    Path((contract_id, index)): Path<(u64, u8)>,
) -> impl IntoResponse {
    match state.tracker.complete(contract_id, index).await {
        Ok(progress) => (StatusCode::OK, Json(progress)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// List recorded settlement payouts
async fn list_payments(State(state): State<AppState>) -> impl IntoResponse {
    match state.mirror.list_payments().await {
        Ok(payments) => (StatusCode::OK, Json(payments)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// List settlements awaiting operator intervention
async fn list_settlement_failures(State(state): State<AppState>) -> impl IntoResponse {
    match state.mirror.list_settlement_failures().await {
        Ok(failures) => (StatusCode::OK, Json(failures)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Operator-triggered settlement retry. Retries are never automatic; this
/// endpoint is the only path that re-runs a failed payout.
async fn retry_settlement(
    State(state): State<AppState>,
    Path(contract_id): Path<u64>,
) -> impl IntoResponse {
    match state.bridge.settle(contract_id).await {
        Ok(SettleOutcome::Paid { tx_ref }) => (
            StatusCode::OK,
            Json(RetryResponse {
                contract_id,
                outcome: "paid".to_string(),
                tx_ref: Some(tx_ref),
            }),
        )
            .into_response(),
        Ok(SettleOutcome::AlreadyPaid) => (
            StatusCode::OK,
            Json(RetryResponse {
                contract_id,
                outcome: "already_paid".to_string(),
                tx_ref: None,
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(error: &EngineError) -> axum::response::Response {
    let status = match error {
        EngineError::TenderNotFound { .. }
        | EngineError::BidNotFound { .. }
        | EngineError::ContractNotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::MilestoneIndex { .. } => StatusCode::BAD_REQUEST,
        EngineError::MilestoneOrder { .. }
        | EngineError::LedgerRejected { .. }
        | EngineError::MissingPayoutAddress { .. } => StatusCode::CONFLICT,
        EngineError::SettlementTransfer { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    mirror: bool,
    ledger: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    chain_id: u64,
    ledger_connected: bool,
    block_height: u64,
    mirror: Option<crate::mirror::MirrorStats>,
}

#[derive(Serialize)]
struct RetryResponse {
    contract_id: u64,
    outcome: String,
    tx_ref: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
