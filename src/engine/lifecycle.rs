use crate::model::*;

use super::SchedulingError;

/// Owner or admin may modify a booking; nobody else.
pub(crate) fn authorize(actor: &Actor, booking: &Booking) -> Result<(), SchedulingError> {
    if actor.is_admin || actor.user_id == booking.owner_id {
        Ok(())
    } else {
        Err(SchedulingError::Forbidden {
            actor: actor.user_id,
            target: booking.id,
        })
    }
}

/// A booking can be edited only while it holds its slot.
pub(crate) fn ensure_mutable(booking: &Booking) -> Result<(), SchedulingError> {
    match booking.status {
        BookingStatus::Confirmed | BookingStatus::Pending => Ok(()),
        BookingStatus::Cancelled => Err(SchedulingError::Invalid("booking is cancelled")),
    }
}

/// CANCELLED is terminal; a second cancel is reported, not absorbed.
pub(crate) fn ensure_cancellable(booking: &Booking) -> Result<(), SchedulingError> {
    match booking.status {
        BookingStatus::Confirmed | BookingStatus::Pending => Ok(()),
        BookingStatus::Cancelled => Err(SchedulingError::AlreadyCancelled(booking.id)),
    }
}

/// Waitlist transitions that may be written. Everything else is rejected.
pub(crate) fn waitlist_transition_allowed(from: WaitlistStatus, to: WaitlistStatus) -> bool {
    use WaitlistStatus::*;
    matches!(
        (from, to),
        (Waiting, Notified) | (Waiting, Expired) | (Notified, Booked) | (Notified, Expired)
    )
}

/// Fields an update may change. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingChanges {
    pub title: Option<String>,
    /// `Some(None)` clears the description.
    pub description: Option<Option<String>>,
    pub interval: Option<Interval>,
    /// Replaces the whole attendee list when present.
    pub attendees: Option<Vec<Attendee>>,
}

impl BookingChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.interval.is_none()
            && self.attendees.is_none()
    }

    pub fn reschedule(interval: Interval) -> Self {
        Self {
            interval: Some(interval),
            ..Self::default()
        }
    }
}
