//! Wall-clock scheduler for coordinator ticks
//!
//! Owns its own start/stop lifecycle and a cancellation signal, so tickers
//! are decoupled from any caller's lifetime. A tick abandoned mid-flight is
//! safe: no local state records "in progress".

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

/// Fixed-interval ticker with cancellation
pub struct Scheduler {
    tick_interval: Duration,
    cancel: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(tick_interval: Duration) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            tick_interval,
            cancel,
        }
    }

    /// Spawn a ticker that runs `tick` every interval until stopped
    pub fn start<F, Fut>(&self, name: String, tick: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut cancelled = self.cancel.subscribe();
        let tick_interval = self.tick_interval;

        tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            info!("Scheduler {} started", name);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("Scheduler {} tick", name);
                        tick().await;
                    }
                    _ = cancelled.changed() => {
                        if *cancelled.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Scheduler {} stopped", name);
        })
    }

    /// Signal all tickers to stop after their current tick
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}
