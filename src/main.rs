use std::sync::Arc;

use tracing::info;

use roomkeeper::config::Config;
use roomkeeper::dispatch::{Dispatcher, LogSink, NoopCalendar, RetryPolicy};
use roomkeeper::engine::Engine;
use roomkeeper::reaper;
use roomkeeper::service::SchedulingService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();
    roomkeeper::observability::init_tracing(config.json_logs);
    roomkeeper::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let engine = Arc::new(Engine::new(config.wal_path(), config.policy.clone())?);
    let (dispatcher, delivery) = Dispatcher::spawn(
        Arc::new(LogSink),
        Arc::new(NoopCalendar),
        RetryPolicy::new(config.delivery_attempts, config.delivery_backoff),
    );
    let service = Arc::new(SchedulingService::new(engine.clone(), dispatcher));

    let sweeper = tokio::spawn(reaper::run_sweeper(service.clone(), config.sweep_interval));
    let compactor = tokio::spawn(reaper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.sweep_interval,
    ));

    let rooms = engine.list_rooms().await;
    info!("roomkeeper started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  rooms: {}", rooms.len());
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown on SIGTERM/ctrl-c
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("shutdown signal received");

    sweeper.abort();
    compactor.abort();

    // Drain queued notifications (up to 10s)
    let drain = tokio::time::timeout(std::time::Duration::from_secs(10), service.dispatcher().flush());
    if drain.await.is_err() {
        tracing::warn!("drain timeout, undelivered side effects dropped");
    }
    delivery.abort();

    info!("roomkeeper stopped");
    Ok(())
}
