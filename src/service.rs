use std::sync::Arc;

use tracing::{error, info, warn};
use ulid::Ulid;

use crate::dispatch::{CalendarChange, Dispatcher, Notification};
use crate::engine::{
    BookingChanges, BookingRequest, Cancellation, CreatedBooking, Engine, SchedulingError, Sweep,
};
use crate::model::*;

/// Engine plus side effects. Mutations commit in the engine first; their
/// notifications and calendar changes are queued afterwards.
#[derive(Clone)]
pub struct SchedulingService {
    engine: Arc<Engine>,
    dispatcher: Dispatcher,
}

impl SchedulingService {
    pub fn new(engine: Arc<Engine>, dispatcher: Dispatcher) -> Self {
        Self { engine, dispatcher }
    }

    /// Read access for queries.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn request_booking(&self, req: BookingRequest) -> Result<CreatedBooking, SchedulingError> {
        let created = self.engine.request_booking(req).await?;
        for booking in std::iter::once(&created.booking).chain(&created.occurrences) {
            self.dispatcher
                .notify(Notification::BookingConfirmed {
                    booking: booking.clone(),
                });
            self.dispatcher
                .sync_calendar(CalendarChange::Upsert {
                    booking: booking.clone(),
                });
        }
        Ok(created)
    }

    pub async fn update_booking(
        &self,
        id: Ulid,
        actor: Actor,
        changes: BookingChanges,
    ) -> Result<Booking, SchedulingError> {
        let booking = self.engine.update_booking(id, actor, changes).await?;
        self.dispatcher
            .notify(Notification::BookingUpdated {
                booking: booking.clone(),
            });
        self.dispatcher
            .sync_calendar(CalendarChange::Upsert {
                booking: booking.clone(),
            });
        Ok(booking)
    }

    /// Cancel and notify everyone the freed slot promoted. An incomplete
    /// promotion is retried in the background; the cancellation stands.
    pub async fn cancel_booking(&self, id: Ulid, actor: Actor) -> Result<Cancellation, SchedulingError> {
        let cancellation = self.engine.cancel_booking(id, actor).await?;
        let booking = &cancellation.booking;

        self.dispatcher
            .notify(Notification::BookingCancelled {
                booking: booking.clone(),
            });
        self.dispatcher
            .sync_calendar(CalendarChange::Remove {
                booking: booking.clone(),
            });
        self.notify_promoted(&cancellation.promoted, booking.interval);

        if let Some(e) = &cancellation.promotion_error {
            warn!(booking = %id, error = %e, "scheduling waitlist promotion retry");
            let service = self.clone();
            let (room_id, freed) = (booking.room_id, booking.interval);
            tokio::spawn(async move { service.retry_promotion(room_id, freed).await });
        }
        Ok(cancellation)
    }

    fn notify_promoted(&self, promoted: &[WaitlistEntry], freed: Interval) {
        for entry in promoted {
            self.dispatcher
                .notify(Notification::WaitlistPromoted {
                    entry: entry.clone(),
                    freed,
                });
        }
    }

    /// Re-run promotion for a freed interval until it completes or attempts run
    /// out. Entries promoted on an earlier attempt are not touched again.
    pub async fn retry_promotion(&self, room_id: Ulid, freed: Interval) {
        let retry = self.dispatcher.retry_policy();
        let mut delay = retry.backoff;
        for attempt in 1..=retry.attempts {
            tokio::time::sleep(delay).await;
            match self.engine.notify_waitlist(room_id, freed).await {
                Ok(promoted) => {
                    info!(room = %room_id, attempt, promoted = promoted.len(), "waitlist promotion completed");
                    self.notify_promoted(&promoted, freed);
                    return;
                }
                Err(e) => {
                    warn!(room = %room_id, attempt, error = %e, "waitlist promotion retry failed");
                    delay = delay.saturating_mul(2);
                }
            }
        }
        error!(room = %room_id, start = freed.start, end = freed.end, "waitlist promotion abandoned");
    }

    pub async fn join_waitlist(
        &self,
        user_id: Ulid,
        room_id: Ulid,
        interval: Interval,
    ) -> Result<WaitlistEntry, SchedulingError> {
        self.engine.join_waitlist(user_id, room_id, interval).await
    }

    pub async fn leave_waitlist(&self, entry_id: Ulid, actor: Actor) -> Result<(), SchedulingError> {
        self.engine.leave_waitlist(entry_id, actor).await
    }

    /// Expire started entries and tell their owners.
    pub async fn sweep_expired(&self, now: Ms) -> Sweep {
        let sweep = self.engine.sweep_expired(now).await;
        for entry in &sweep.expired {
            self.dispatcher
                .notify(Notification::WaitlistExpired {
                    entry: entry.clone(),
                });
        }
        sweep
    }
}
