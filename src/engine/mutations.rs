use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_attendees, validate_interval, validate_text};
use super::lifecycle::{authorize, ensure_cancellable, ensure_mutable, BookingChanges};
use super::recurrence::{expand, plan_occurrences, validate_rule, RecurrenceOutcome, SkipReason, SkippedOccurrence};
use super::{Engine, SchedulingError, WalCommand};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub owner_id: Ulid,
    pub room_id: Ulid,
    pub interval: Interval,
    pub title: String,
    pub description: Option<String>,
    pub attendees: Vec<Attendee>,
    pub recurrence: Option<RecurrenceRule>,
}

impl BookingRequest {
    pub fn new(owner_id: Ulid, room_id: Ulid, interval: Interval, title: impl Into<String>) -> Self {
        Self {
            owner_id,
            room_id,
            interval,
            title: title.into(),
            description: None,
            attendees: Vec::new(),
            recurrence: None,
        }
    }

    pub fn with_attendees(mut self, attendees: Vec<Attendee>) -> Self {
        self.attendees = attendees;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn recurring(mut self, rule: RecurrenceRule) -> Self {
        self.recurrence = Some(rule);
        self
    }
}

/// Result of a successful `request_booking`.
#[derive(Debug, Clone)]
pub struct CreatedBooking {
    pub booking: Booking,
    /// Present when the request carried a recurrence rule.
    pub recurrence: Option<RecurrenceOutcome>,
    /// Child bookings created from the rule.
    pub occurrences: Vec<Booking>,
    /// The owner's NOTIFIED waitlist entries this booking satisfied.
    pub fulfilled: Vec<WaitlistEntry>,
}

/// Result of a successful `cancel_booking`.
#[derive(Debug)]
pub struct Cancellation {
    pub booking: Booking,
    /// Entries moved WAITING → NOTIFIED, in first-come order.
    pub promoted: Vec<WaitlistEntry>,
    /// Set when promotion stopped early. The cancellation itself stands.
    pub promotion_error: Option<SchedulingError>,
}

impl Engine {
    pub async fn register_room(
        &self,
        id: Ulid,
        name: Option<String>,
        capacity: u32,
        active: bool,
    ) -> Result<(), SchedulingError> {
        if self.rooms.len() >= MAX_ROOMS {
            return Err(SchedulingError::Invalid("too many rooms"));
        }
        if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(SchedulingError::Invalid("room name too long"));
        }
        if capacity == 0 {
            return Err(SchedulingError::Invalid("room capacity must be positive"));
        }
        // Serializes registration against itself and against compaction.
        let _registry = self.registry.lock().await;
        if self.rooms.contains_key(&id) {
            return Err(SchedulingError::RoomExists(id));
        }
        let event = Event::RoomRegistered {
            id,
            name: name.clone(),
            capacity,
            active,
        };
        self.wal_append(&event).await?;
        self.rooms
            .insert(id, Arc::new(RwLock::new(RoomState::new(id, name, capacity, active))));
        info!(room = %id, capacity, active, "room registered");
        Ok(())
    }

    pub async fn update_room(
        &self,
        id: Ulid,
        name: Option<String>,
        capacity: u32,
        active: bool,
    ) -> Result<(), SchedulingError> {
        if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(SchedulingError::Invalid("room name too long"));
        }
        if capacity == 0 {
            return Err(SchedulingError::Invalid("room capacity must be positive"));
        }
        let mut guard = self.room_write(&id).await?;
        let event = Event::RoomUpdated {
            id,
            name,
            capacity,
            active,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(room = %id, capacity, active, "room updated");
        Ok(())
    }

    /// Create a CONFIRMED booking, then place any recurring occurrences.
    ///
    /// The room's write lock is held from the conflict check through the last
    /// write, so two requests for the same slot can never both succeed.
    pub async fn request_booking(
        &self,
        req: BookingRequest,
    ) -> Result<CreatedBooking, SchedulingError> {
        let started = Instant::now();
        let now = now_ms();
        validate_interval(&self.policy, &req.interval, now)?;
        validate_text(&req.title, req.description.as_deref())?;
        if let Some(rule) = &req.recurrence {
            validate_rule(rule, &req.interval)?;
        }

        let mut guard = self.room_write(&req.room_id).await?;
        if !guard.active {
            return Err(SchedulingError::Invalid("room is not active"));
        }
        validate_attendees(&self.policy, &req.attendees, guard.capacity)?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(SchedulingError::Invalid("too many bookings in room"));
        }
        if let Err(e) = check_no_conflict(&guard, &req.interval, None) {
            metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => "conflict").increment(1);
            return Err(e);
        }

        let booking = Booking {
            id: Ulid::new(),
            owner_id: req.owner_id,
            room_id: req.room_id,
            title: req.title,
            description: req.description,
            interval: req.interval,
            status: BookingStatus::Confirmed,
            attendees: req.attendees,
            recurrence: req.recurrence,
            parent_id: None,
            created_at: now,
            updated_at: now,
        };
        self.persist_and_apply(
            &mut guard,
            &Event::BookingCreated {
                booking: booking.clone(),
            },
        )
        .await?;
        info!(
            booking = %booking.id,
            room = %booking.room_id,
            owner = %booking.owner_id,
            start = booking.interval.start,
            end = booking.interval.end,
            "booking confirmed"
        );
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => "confirmed").increment(1);

        let (occurrences, recurrence) = match &booking.recurrence {
            Some(rule) => {
                let (children, outcome) = self.place_occurrences(&mut guard, &booking, rule, now).await;
                (children, Some(outcome))
            }
            None => (Vec::new(), None),
        };

        let fulfilled = self
            .fulfil_notified(&mut guard, booking.owner_id, &booking.interval)
            .await;

        metrics::histogram!(crate::observability::OPERATION_DURATION_SECONDS, "op" => "request_booking")
            .record(started.elapsed().as_secs_f64());
        Ok(CreatedBooking {
            booking,
            recurrence,
            occurrences,
            fulfilled,
        })
    }

    /// Best effort: the parent is already committed, nothing here can undo it.
    async fn place_occurrences(
        &self,
        rs: &mut RoomState,
        parent: &Booking,
        rule: &RecurrenceRule,
        now: Ms,
    ) -> (Vec<Booking>, RecurrenceOutcome) {
        let occurrences = expand(&parent.interval, rule, self.policy.max_occurrences);
        let (accepted, mut skipped) = plan_occurrences(rs, occurrences, &self.policy, now);
        let requested = u32::try_from(accepted.len() + skipped.len()).unwrap_or(u32::MAX);

        let mut children = Vec::with_capacity(accepted.len());
        let mut pending = accepted.into_iter();
        for interval in pending.by_ref() {
            let child = Booking {
                id: Ulid::new(),
                interval,
                recurrence: None,
                parent_id: Some(parent.id),
                ..parent.clone()
            };
            let event = Event::BookingCreated {
                booking: child.clone(),
            };
            if let Err(e) = self.persist_and_apply(rs, &event).await {
                warn!(parent = %parent.id, error = %e, "stopped placing occurrences");
                skipped.push(SkippedOccurrence {
                    interval,
                    reason: SkipReason::Storage,
                });
                break;
            }
            children.push(child);
        }
        skipped.extend(pending.map(|interval| SkippedOccurrence {
            interval,
            reason: SkipReason::Storage,
        }));
        skipped.sort_by_key(|s| s.interval.start);

        info!(
            parent = %parent.id,
            requested,
            created = children.len(),
            skipped = skipped.len(),
            "recurring occurrences placed"
        );
        metrics::counter!(crate::observability::OCCURRENCES_SKIPPED_TOTAL).increment(skipped.len() as u64);

        let outcome = RecurrenceOutcome {
            requested,
            created: children.iter().map(|c| c.id).collect(),
            skipped,
        };
        (children, outcome)
    }

    /// Edit a CONFIRMED booking in place. A new interval is conflict-checked
    /// against every other booking in the room, never against itself.
    pub async fn update_booking(
        &self,
        id: Ulid,
        actor: Actor,
        changes: BookingChanges,
    ) -> Result<Booking, SchedulingError> {
        let now = now_ms();
        let mut guard = self.booking_write(&id).await?;
        let current = guard
            .bookings
            .get(&id)
            .cloned()
            .ok_or(SchedulingError::BookingNotFound(id))?;
        authorize(&actor, &current)?;
        ensure_mutable(&current)?;
        if changes.is_empty() {
            return Ok(current);
        }

        let title = changes.title.unwrap_or(current.title);
        let description = changes.description.unwrap_or(current.description);
        validate_text(&title, description.as_deref())?;

        let interval = changes.interval.unwrap_or(current.interval);
        if interval != current.interval {
            validate_interval(&self.policy, &interval, now)?;
            check_no_conflict(&guard, &interval, Some(id))?;
        }

        let attendees = match changes.attendees {
            Some(attendees) => {
                validate_attendees(&self.policy, &attendees, guard.capacity)?;
                attendees
            }
            None => current.attendees,
        };

        let event = Event::BookingUpdated {
            id,
            room_id: current.room_id,
            title,
            description,
            interval,
            attendees,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(booking = %id, actor = %actor.user_id, "booking updated");

        guard
            .bookings
            .get(&id)
            .cloned()
            .ok_or(SchedulingError::BookingNotFound(id))
    }

    /// Cancel, then promote waiting entries for the freed slot.
    ///
    /// Once the cancellation is durable the call succeeds; a promotion failure is
    /// reported in the result for the caller to retry.
    pub async fn cancel_booking(&self, id: Ulid, actor: Actor) -> Result<Cancellation, SchedulingError> {
        let now = now_ms();
        let mut guard = self.booking_write(&id).await?;
        let current = guard
            .bookings
            .get(&id)
            .cloned()
            .ok_or(SchedulingError::BookingNotFound(id))?;
        authorize(&actor, &current)?;
        ensure_cancellable(&current)?;

        let held_slot = current.is_confirmed();
        let event = Event::BookingCancelled {
            id,
            room_id: current.room_id,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(booking = %id, actor = %actor.user_id, "booking cancelled");
        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL).increment(1);

        let (promoted, promotion_error) = if held_slot {
            match self.promote_waiting(&mut guard, &current.interval, now).await {
                Ok(promoted) => (promoted, None),
                Err((promoted, e)) => {
                    warn!(booking = %id, error = %e, "waitlist promotion incomplete");
                    (promoted, Some(e))
                }
            }
        } else {
            (Vec::new(), None)
        };

        let booking = guard
            .bookings
            .get(&id)
            .cloned()
            .ok_or(SchedulingError::BookingNotFound(id))?;
        Ok(Cancellation {
            booking,
            promoted,
            promotion_error,
        })
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    ///
    /// Every room is read-locked for the duration, so no mutation can land
    /// between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), SchedulingError> {
        let _registry = self.registry.lock().await;
        let mut rooms: Vec<_> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        rooms.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(rooms.len());
        for (_, rs) in &rooms {
            guards.push(rs.read().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::RoomRegistered {
                id: guard.id,
                name: guard.name.clone(),
                capacity: guard.capacity,
                active: guard.active,
            });
            let mut bookings: Vec<&Booking> = guard.bookings.values().collect();
            bookings.sort_by_key(|b| (b.created_at, b.id));
            events.extend(bookings.into_iter().map(|b| Event::BookingCreated { booking: b.clone() }));
            events.extend(
                guard
                    .waitlist
                    .iter()
                    .map(|e| Event::WaitlistJoined { entry: e.clone() }),
            );
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| SchedulingError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulingError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| SchedulingError::Storage(e.to_string()))?;
        drop(guards);
        info!(events = count, rooms = rooms.len(), "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
