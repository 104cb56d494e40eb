use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking requests. Labels: outcome (confirmed, conflict).
pub const BOOKINGS_TOTAL: &str = "roomkeeper_bookings_total";

/// Counter: conflict checks that found an overlapping booking.
pub const CONFLICTS_TOTAL: &str = "roomkeeper_conflicts_total";

/// Counter: bookings moved to CANCELLED.
pub const CANCELLATIONS_TOTAL: &str = "roomkeeper_cancellations_total";

/// Counter: recurring occurrences that could not be placed.
pub const OCCURRENCES_SKIPPED_TOTAL: &str = "roomkeeper_occurrences_skipped_total";

/// Counter: waitlist entries moved WAITING → NOTIFIED.
pub const WAITLIST_PROMOTIONS_TOTAL: &str = "roomkeeper_waitlist_promotions_total";

/// Counter: waitlist entries expired by the sweeper.
pub const WAITLIST_EXPIRED_TOTAL: &str = "roomkeeper_waitlist_expired_total";

/// Counter: notifications or calendar syncs abandoned after retries. Labels: effect.
pub const SIDE_EFFECT_FAILURES_TOTAL: &str = "roomkeeper_side_effect_failures_total";

/// Histogram: engine operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "roomkeeper_operation_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomkeeper_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Global subscriber. Filter comes from `RUST_LOG`, defaulting to `info`.
pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base = fmt::layer().with_target(true).with_line_number(true);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(base.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(base)
            .init();
    }
}
