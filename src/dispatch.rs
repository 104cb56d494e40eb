//! Side effects of committed changes: user notifications and external
//! calendar sync.
//!
//! Nothing here runs under a room lock. The engine commits first, the service
//! layer then queues effects on a [`Dispatcher`], whose single worker delivers
//! them in the order they were queued.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::{Booking, Interval, WaitlistEntry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    BookingConfirmed { booking: Booking },
    BookingUpdated { booking: Booking },
    BookingCancelled { booking: Booking },
    /// The entry's slot (or part of it) was freed by `freed`.
    WaitlistPromoted { entry: WaitlistEntry, freed: Interval },
    WaitlistExpired { entry: WaitlistEntry },
}

impl Notification {
    pub fn room_id(&self) -> Ulid {
        match self {
            Notification::BookingConfirmed { booking }
            | Notification::BookingUpdated { booking }
            | Notification::BookingCancelled { booking } => booking.room_id,
            Notification::WaitlistPromoted { entry, .. } | Notification::WaitlistExpired { entry } => {
                entry.room_id
            }
        }
    }

    /// User the notification is addressed to.
    pub fn recipient(&self) -> Ulid {
        match self {
            Notification::BookingConfirmed { booking }
            | Notification::BookingUpdated { booking }
            | Notification::BookingCancelled { booking } => booking.owner_id,
            Notification::WaitlistPromoted { entry, .. } | Notification::WaitlistExpired { entry } => {
                entry.user_id
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Notification::BookingConfirmed { .. } => "booking_confirmed",
            Notification::BookingUpdated { .. } => "booking_updated",
            Notification::BookingCancelled { .. } => "booking_cancelled",
            Notification::WaitlistPromoted { .. } => "waitlist_promoted",
            Notification::WaitlistExpired { .. } => "waitlist_expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CalendarChange {
    /// Create or refresh the external event for a booking.
    Upsert { booking: Booking },
    Remove { booking: Booking },
}

impl CalendarChange {
    pub fn booking(&self) -> &Booking {
        match self {
            CalendarChange::Upsert { booking } | CalendarChange::Remove { booking } => booking,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Worth retrying (timeouts, 5xx, connection resets).
    #[error("transient delivery failure: {0}")]
    Transient(String),

    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

#[async_trait]
pub trait CalendarSync: Send + Sync {
    async fn sync(&self, change: &CalendarChange) -> Result<(), DeliveryError>;
}

/// Writes each notification to the log as a JSON line.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let payload = serde_json::to_string(notification)
            .map_err(|e| DeliveryError::Permanent(e.to_string()))?;
        info!(
            kind = notification.label(),
            recipient = %notification.recipient(),
            %payload,
            "notification"
        );
        Ok(())
    }
}

/// Calendar backend for deployments without one.
pub struct NoopCalendar;

#[async_trait]
impl CalendarSync for NoopCalendar {
    async fn sync(&self, change: &CalendarChange) -> Result<(), DeliveryError> {
        debug!(booking = %change.booking().id, "calendar sync skipped");
        Ok(())
    }
}

/// Redelivery schedule for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. At least 1.
    pub attempts: u32,
    /// Wait before the second attempt; doubles after each failure.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1 << attempt.saturating_sub(1).min(16))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<F, Fut>(&self, mut op: F) -> Result<(), DeliveryError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), DeliveryError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let delay = self.delay(attempt);
                    warn!(attempt, ?delay, error = %e, "delivery failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(200))
    }
}

enum Job {
    Notify(Notification),
    Calendar(CalendarChange),
    Flush(oneshot::Sender<()>),
}

/// Ordered, retrying side-effect queue. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
    retry: RetryPolicy,
}

impl Dispatcher {
    /// Start the delivery worker. It exits once every clone is dropped and the
    /// queue has drained.
    pub fn spawn(
        sink: Arc<dyn NotificationSink>,
        calendar: Arc<dyn CalendarSync>,
        retry: RetryPolicy,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(delivery_loop(rx, sink, calendar, retry));
        (Self { tx, retry }, handle)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Queue a notification. Never waits on the sink.
    pub fn notify(&self, notification: Notification) {
        if self.tx.send(Job::Notify(notification)).is_err() {
            warn!("dispatcher stopped; notification dropped");
        }
    }

    pub fn sync_calendar(&self, change: CalendarChange) {
        if self.tx.send(Job::Calendar(change)).is_err() {
            warn!("dispatcher stopped; calendar change dropped");
        }
    }

    /// Resolves once everything queued before this call has been handled.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Job::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn delivery_loop(
    mut rx: mpsc::UnboundedReceiver<Job>,
    sink: Arc<dyn NotificationSink>,
    calendar: Arc<dyn CalendarSync>,
    retry: RetryPolicy,
) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Notify(notification) => {
                let result = retry.run(|| sink.deliver(&notification)).await;
                if let Err(e) = result {
                    error!(
                        kind = notification.label(),
                        recipient = %notification.recipient(),
                        error = %e,
                        "notification not delivered"
                    );
                    metrics::counter!(crate::observability::SIDE_EFFECT_FAILURES_TOTAL, "effect" => "notification")
                        .increment(1);
                }
            }
            Job::Calendar(change) => {
                let result = retry.run(|| calendar.sync(&change)).await;
                if let Err(e) = result {
                    error!(booking = %change.booking().id, error = %e, "calendar sync failed");
                    metrics::counter!(crate::observability::SIDE_EFFECT_FAILURES_TOTAL, "effect" => "calendar")
                        .increment(1);
                }
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("dispatcher drained");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::model::*;

    fn booking(title: &str) -> Booking {
        Booking {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            room_id: Ulid::new(),
            title: title.into(),
            description: None,
            interval: Interval::new(10 * HOUR_MS, 11 * HOUR_MS),
            status: BookingStatus::Confirmed,
            attendees: Vec::new(),
            recurrence: None,
            parent_id: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationSink for Recorder {
        async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
            let title = match notification {
                Notification::BookingConfirmed { booking } => booking.title.clone(),
                other => other.label().to_string(),
            };
            self.seen.lock().unwrap().push(title);
            Ok(())
        }
    }

    /// Fails transiently `failures` times, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CalendarSync for Flaky {
        async fn sync(&self, _change: &CalendarChange) -> Result<(), DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(DeliveryError::Transient("503".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Broken {
        calls: AtomicU32,
    }

    #[async_trait]
    impl NotificationSink for Broken {
        async fn deliver(&self, _notification: &Notification) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DeliveryError::Permanent("mailbox gone".into()))
        }
    }

    fn quick_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn delivers_in_queue_order() {
        let recorder = Arc::new(Recorder::default());
        let (dispatcher, _handle) = Dispatcher::spawn(recorder.clone(), Arc::new(NoopCalendar), quick_retry(3));

        for title in ["first", "second", "third"] {
            dispatcher
                .notify(Notification::BookingConfirmed { booking: booking(title) });
        }
        dispatcher.flush().await;

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calendar = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let (dispatcher, _handle) = Dispatcher::spawn(Arc::new(LogSink), calendar.clone(), quick_retry(5));

        dispatcher
            .sync_calendar(CalendarChange::Upsert { booking: booking("sync") });
        dispatcher.flush().await;
        assert_eq!(calendar.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_stop_at_attempt_limit() {
        let calendar = Arc::new(Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let (dispatcher, _handle) = Dispatcher::spawn(Arc::new(LogSink), calendar.clone(), quick_retry(3));

        dispatcher
            .sync_calendar(CalendarChange::Remove { booking: booking("gone") });
        dispatcher.flush().await;
        assert_eq!(calendar.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let sink = Arc::new(Broken {
            calls: AtomicU32::new(0),
        });
        let (dispatcher, _handle) = Dispatcher::spawn(sink.clone(), Arc::new(NoopCalendar), quick_retry(5));

        dispatcher
            .notify(Notification::BookingCancelled { booking: booking("x") });
        dispatcher.flush().await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn worker_exits_when_dispatcher_dropped() {
        let (dispatcher, handle) = Dispatcher::spawn(Arc::new(LogSink), Arc::new(NoopCalendar), quick_retry(1));
        drop(dispatcher);
        handle.await.unwrap();
    }

    #[test]
    fn backoff_doubles() {
        let retry = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(3), Duration::from_millis(400));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts, 1);
    }

    #[test]
    fn notification_serializes_with_tag() {
        let b = booking("json");
        let json = serde_json::to_value(Notification::BookingUpdated { booking: b.clone() }).unwrap();
        assert_eq!(json["type"], "booking_updated");
        assert_eq!(json["booking"]["title"], "json");
    }
}
