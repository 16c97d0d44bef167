//! Tender Engine - Tender closing, award coordination and milestone settlement
//!
//! The engine watches a procurement ledger for tenders whose bidding windows
//! have elapsed, closes them and awards the lowest bid, tracks milestone
//! completion on awarded contracts, and settles completed contracts on a
//! secondary payment ledger. A Postgres mirror serves operator reads.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use tender_engine::closing::{ClosingCoordinator, Scheduler};
use tender_engine::config::Settings;
use tender_engine::events::LedgerEvent;
use tender_engine::ledger::{EthersLedger, LedgerListener, LedgerProvider, TenderLedger};
use tender_engine::metrics::{self, MetricsServer};
use tender_engine::milestone::{AllComplete, MilestoneTracker};
use tender_engine::mirror::{Replica, StateMirror};
use tender_engine::settlement::{OneToOne, RestSettlementLedger, SettlementBridge, SettlementTarget};
use tender_engine::api;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Tender Engine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: chain {} with {} coordinator replicas",
        settings.ledger.chain_id, settings.coordinator.replicas
    );

    // Initialize the mirror database
    let mirror = Arc::new(StateMirror::new(&settings.database).await?);
    info!("Mirror database connection established");

    mirror.run_migrations().await?;
    info!("Mirror migrations complete");

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Connect to the primary ledger
    let provider = Arc::new(LedgerProvider::new(settings.ledger.clone()).await?);
    let ethers_ledger = Arc::new(
        EthersLedger::new(provider.clone(), &settings.ledger, &settings.coordinator).await?,
    );
    let ledger: Arc<dyn TenderLedger> = ethers_ledger.clone();
    info!("Primary ledger connection initialized");

    // Event listener feeds a broadcast channel and the mirror
    let (event_tx, _) = broadcast::channel::<LedgerEvent>(256);
    let listener =
        LedgerListener::new(provider.clone(), event_tx.clone(), mirror.clone()).await?;
    let listener_handle = tokio::spawn(async move {
        if let Err(e) = listener.listen().await {
            error!("Ledger listener error: {}", e);
        }
    });

    // Settlement pipeline
    let target: Arc<dyn SettlementTarget> =
        Arc::new(RestSettlementLedger::new(&settings.settlement)?);
    let bridge = Arc::new(SettlementBridge::new(
        ledger.clone(),
        mirror.clone() as Arc<dyn Replica>,
        target.clone(),
        Arc::new(OneToOne),
    ));

    let (settlement_tx, settlement_rx) = mpsc::channel::<AllComplete>(64);
    let tracker = Arc::new(MilestoneTracker::new(ledger.clone(), settlement_tx.clone()));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let bridge_handle = tokio::spawn({
        let bridge = bridge.clone();
        async move {
            bridge.run(settlement_rx, cancel_rx).await;
        }
    });

    // Forward completion events observed on the ledger into the settlement
    // queue. This covers contracts completed by writers other than this
    // process; the tracker feeds the same queue directly for its own writes.
    let forwarder_handle = tokio::spawn({
        let mut event_rx = event_tx.subscribe();
        let settlement_tx = settlement_tx.clone();
        async move {
            while let Ok(event) = event_rx.recv().await {
                if let LedgerEvent::AllMilestonesCompleted { contract_id, .. } = event {
                    if settlement_tx.send(AllComplete { contract_id }).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Closing coordinators. Replicas share no state and race on purpose;
    // the ledger serializes close-and-award, losers observe a rejection.
    let scheduler = Scheduler::new(Duration::from_millis(settings.coordinator.poll_interval_ms));
    let contract_term_secs = settings.coordinator.contract_term_days * 86_400;
    let mut coordinator_handles = Vec::new();
    for _ in 0..settings.coordinator.replicas {
        let replica_id = format!("{}-{}", settings.coordinator.instance_id, Uuid::new_v4());
        let coordinator = Arc::new(ClosingCoordinator::new(
            replica_id.clone(),
            ledger.clone(),
            mirror.clone() as Arc<dyn Replica>,
            contract_term_secs,
        ));
        let handle = scheduler.start(replica_id, move || {
            let coordinator = coordinator.clone();
            async move {
                if let Err(e) = coordinator.tick().await {
                    error!("Coordinator tick error: {}", e);
                }
            }
        });
        coordinator_handles.push(handle);
    }
    info!(
        "Started {} closing coordinator replicas",
        settings.coordinator.replicas
    );

    // Start API server
    let api_handle = tokio::spawn({
        let state = api::AppState {
            mirror: mirror.clone(),
            ledger: ledger.clone(),
            provider: provider.clone(),
            tracker: tracker.clone(),
            bridge: bridge.clone(),
        };
        let api_config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(api_config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let provider = provider.clone();
        let mirror = mirror.clone();
        let target = target.clone();
        let payer = settings.settlement.payer_address.clone();
        let alerts = settings.alerts.clone();
        let interval = settings.coordinator.health_check_interval_secs;
        let confirmations = ethers_ledger.confirmation_tracker();
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let ledger_ok = provider.health_check().await;
                metrics::record_ledger_health(ledger_ok);
                if !ledger_ok {
                    warn!("Primary ledger health check failed");
                }

                if let Err(e) = mirror.health_check().await {
                    warn!("Mirror health check failed: {}", e);
                }

                match target.balance(&payer).await {
                    Ok(balance) if balance < alerts.min_payer_balance_minor_units => {
                        warn!(
                            balance,
                            threshold = alerts.min_payer_balance_minor_units,
                            "Settlement payer balance below threshold"
                        );
                        if let Some(url) = &alerts.slack_webhook_url {
                            send_balance_alert(url, &payer, balance).await;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Settlement balance check failed: {}", e),
                }

                confirmations.cleanup_cache(10_000).await;
                metrics::record_health_check();
            }
        }
    });

    info!("Tender Engine is running");
    info!(
        "API server: http://{}:{}",
        settings.api.host, settings.api.port
    );
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: stop tickers after their current tick, drain the
    // settlement worker, then abort the remaining background tasks.
    scheduler.stop();
    let _ = cancel_tx.send(true);

    futures::future::join_all(coordinator_handles).await;
    let _ = bridge_handle.await;

    api_handle.abort();
    listener_handle.abort();
    forwarder_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Tender Engine stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tender_engine=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn send_balance_alert(webhook_url: &str, payer: &str, balance: u64) {
    let body = serde_json::json!({
        "text": format!(
            "Settlement payer {} balance low: {} minor units",
            payer, balance
        )
    });
    if let Err(e) = reqwest::Client::new()
        .post(webhook_url)
        .json(&body)
        .send()
        .await
    {
        warn!("Failed to send balance alert: {}", e);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
