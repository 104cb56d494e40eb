#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use roomkeeper::config::BookingPolicy;
use roomkeeper::dispatch::{Dispatcher, NoopCalendar, RetryPolicy};
use roomkeeper::engine::Engine;
use roomkeeper::model::*;
use roomkeeper::notify::NotifyHub;
use roomkeeper::service::SchedulingService;

pub fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roomkeeper_test_integration");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// Midnight UTC a week from now.
pub fn day() -> Ms {
    let now = chrono::Utc::now().timestamp_millis();
    (now / DAY_MS + 7) * DAY_MS
}

pub fn slot(start_hour: Ms, end_hour: Ms) -> Interval {
    Interval::new(day() + start_hour * HOUR_MS, day() + end_hour * HOUR_MS)
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub hub: Arc<NotifyHub>,
    pub service: SchedulingService,
}

pub fn harness(name: &str) -> Harness {
    let engine = Arc::new(Engine::new(test_wal_path(name), BookingPolicy::default()).unwrap());
    let hub = Arc::new(NotifyHub::new());
    let (dispatcher, _worker) = Dispatcher::spawn(
        hub.clone(),
        Arc::new(NoopCalendar),
        RetryPolicy::new(3, Duration::from_millis(1)),
    );
    let service = SchedulingService::new(engine.clone(), dispatcher);
    Harness { engine, hub, service }
}
