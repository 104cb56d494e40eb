use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::engine::{Engine, SchedulingError};
use crate::service::SchedulingService;

/// Background task that periodically expires waitlist entries whose slot has started.
pub async fn run_sweeper(service: Arc<SchedulingService>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let now = Utc::now().timestamp_millis();
        let sweep = service.sweep_expired(now).await;
        if let Some(e) = sweep.error {
            // Untouched entries are picked up on the next tick.
            warn!(error = %e, expired = sweep.expired.len(), "waitlist sweep incomplete");
        }
    }
}

/// Compact once `threshold` appends have accumulated since the last compaction.
/// Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, SchedulingError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!(appends, threshold, "compaction not due");
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!(appends, "compacted WAL");
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            warn!(error = %e, "WAL compaction failed");
        }
    }
}
