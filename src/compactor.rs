use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Background task that compacts the WAL once `threshold` appends have
/// accumulated, and drops notification channels nobody listens on.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
        let pruned = engine.notify.prune();
        if pruned > 0 {
            tracing::debug!(pruned, "dropped idle notification channels");
        }
    }
}

/// Returns the compacted event count when a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Option<usize> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold.max(1) {
        return None;
    }
    match engine.compact_wal().await {
        Ok(events) => {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            info!(appends, events, "WAL compacted");
            Some(events)
        }
        Err(e) => {
            tracing::error!(error = %e, "WAL compaction failed");
            None
        }
    }
}
