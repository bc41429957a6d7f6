//! Scheduled mode: an immediate initial run, then one run per interval.
//!
//! SIGINT flips the coordinator's shutdown flag so the in-flight record
//! finishes before the cycle stops; a second signal is not required.

use crate::coordinator::{RunCoordinator, RunReport, RunType};
use crate::entity::EntityKind;
use crate::error::SyncResult;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

pub struct SyncScheduler {
    coordinator: Arc<RunCoordinator>,
    interval: Duration,
    last_report: Arc<RwLock<Option<RunReport>>>
}

impl SyncScheduler {
    pub fn new(coordinator: RunCoordinator, interval: Duration) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            interval,
            last_report: Arc::new(RwLock::new(None))
        }
    }

    pub async fn run_until_shutdown(&self, entities: &[EntityKind]) -> SyncResult<()> {
        let shutdown = self.coordinator.shutdown_handle();
        let stop = Arc::new(Notify::new());
        spawn_sigint_listener(Arc::clone(&shutdown), Some(Arc::clone(&stop)));

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    match self.coordinator.run(entities, RunType::Scheduled).await {
                        Ok(report) => {
                            let mut guard = self.last_report.write().await;
                            *guard = Some(report);
                        }
                        Err(e) => error!(error = %e, "scheduled sync cycle failed")
                    }
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                }
                _ = stop.notified() => break
            }
        }

        info!("scheduler stopped");
        Ok(())
    }

    pub async fn last_report(&self) -> Option<RunReport> {
        self.last_report.read().await.clone()
    }
}

/// Install a SIGINT listener that flips the shutdown flag (and optionally
/// wakes a waiter). Used by both the scheduler and the one-shot command.
pub fn spawn_sigint_listener(shutdown: Arc<AtomicBool>, stop: Option<Arc<Notify>>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("SIGINT received, finishing in-flight work");
            shutdown.store(true, Ordering::Relaxed);
            if let Some(stop) = stop {
                stop.notify_one();
            }
        }
    });
}
