mod ledger_retention;

use tokio::sync::{broadcast, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{AggregateError, AggregateStore};

pub use ledger_retention::prune_sequence_ledger;

pub struct WorkerManager {
    scheduler: Mutex<JobScheduler>,
    shutdown_tx: broadcast::Sender<()>,
    store: AggregateStore,
    enable_retention: bool,
    retention_schedule: String,
    retention_days: u32,
}

impl WorkerManager {
    pub async fn new(store: AggregateStore, config: &Config) -> Result<Self, WorkerError> {
        let scheduler = JobScheduler::new().await.map_err(WorkerError::Scheduler)?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            shutdown_tx,
            store,
            enable_retention: config.enable_retention_worker,
            retention_schedule: config.retention_schedule.clone(),
            retention_days: config.ledger_retention_days,
        })
    }

    pub async fn start(&self) -> Result<(), WorkerError> {
        if !self.enable_retention {
            info!("ENABLE_RETENTION_WORKER disabled, skipping worker startup");
            return Ok(());
        }

        let scheduler = self.scheduler.lock().await;

        let store = self.store.clone();
        let retention_days = self.retention_days;
        let shutdown_rx = self.shutdown_tx.subscribe();
        let job = Job::new_async(self.retention_schedule.as_str(), move |_uuid, _lock| {
            let store = store.clone();
            let mut rx = shutdown_rx.resubscribe();
            Box::pin(async move {
                tokio::select! {
                    _ = rx.recv() => {},
                    result = prune_sequence_ledger(store, retention_days) => {
                        if let Err(e) = result {
                            error!(error = %e, "Ledger retention worker error");
                        }
                    }
                }
            })
        })
        .map_err(WorkerError::Scheduler)?;
        scheduler.add(job).await.map_err(WorkerError::Scheduler)?;
        info!(
            schedule = %self.retention_schedule,
            retention_days,
            "Ledger retention worker scheduled"
        );

        scheduler.start().await.map_err(WorkerError::Scheduler)?;
        info!("All workers started");

        Ok(())
    }

    pub async fn stop(&self) {
        if !self.enable_retention {
            return;
        }

        info!("Stopping workers...");
        let _ = self.shutdown_tx.send(());

        let mut scheduler = self.scheduler.lock().await;
        if let Err(e) = scheduler.shutdown().await {
            warn!(error = %e, "Error shutting down scheduler");
        }

        info!("Workers stopped");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
    #[error("Aggregate store error: {0}")]
    Aggregate(#[from] AggregateError),
}
