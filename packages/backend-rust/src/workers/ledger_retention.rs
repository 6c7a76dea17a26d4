use std::time::Instant;

use chrono::Local;
use tracing::{debug, info};

use crate::db::{AggregateStore, LedgerPruneReport};

pub async fn prune_sequence_ledger(
    store: AggregateStore,
    retention_days: u32,
) -> Result<LedgerPruneReport, super::WorkerError> {
    let start = Instant::now();
    debug!(retention_days, "Starting ledger retention cycle");

    let report = store
        .prune_ledger(Local::now().date_naive(), retention_days)
        .await?;

    info!(
        cutoff = %report.cutoff,
        removed = report.removed,
        duration_secs = format!("{:.2}", start.elapsed().as_secs_f64()),
        "Ledger retention completed"
    );

    Ok(report)
}
