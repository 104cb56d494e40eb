use std::collections::HashSet;

use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::config::BookingPolicy;
use crate::limits::*;
use crate::model::*;

use super::SchedulingError;

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// First CONFIRMED booking on the room overlapping `interval`, ignoring `exclude`.
///
/// Only the canonical half-open overlap rule is used, so touching endpoints never conflict.
pub fn find_conflict(rs: &RoomState, interval: &Interval, exclude: Option<Ulid>) -> Option<Ulid> {
    rs.overlapping(interval)
        .find(|slot| Some(slot.booking_id) != exclude && slot.interval.overlaps(interval))
        .map(|slot| slot.booking_id)
}

pub fn has_conflict(rs: &RoomState, interval: &Interval, exclude: Option<Ulid>) -> bool {
    find_conflict(rs, interval, exclude).is_some()
}

pub(crate) fn check_no_conflict(
    rs: &RoomState,
    interval: &Interval,
    exclude: Option<Ulid>,
) -> Result<(), SchedulingError> {
    match find_conflict(rs, interval, exclude) {
        Some(booking) => {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
            Err(SchedulingError::Conflict { booking })
        }
        None => Ok(()),
    }
}

/// Business-rule validation for an interval that is about to be occupied.
pub(crate) fn validate_interval(
    policy: &BookingPolicy,
    interval: &Interval,
    now: Ms,
) -> Result<(), SchedulingError> {
    if interval.start >= interval.end {
        return Err(SchedulingError::Invalid("end must be after start"));
    }
    if interval.start < MIN_VALID_TIMESTAMP_MS || interval.end > MAX_VALID_TIMESTAMP_MS {
        return Err(SchedulingError::Invalid("timestamp out of range"));
    }
    if interval.start < now {
        return Err(SchedulingError::Invalid("start is in the past"));
    }
    if interval.duration_ms() < policy.min_duration_ms {
        return Err(SchedulingError::Invalid("duration below minimum"));
    }
    if interval.duration_ms() > policy.max_duration_ms {
        return Err(SchedulingError::Invalid("duration above maximum"));
    }
    if let Some(horizon) = policy.max_advance_ms
        && interval.start > now + horizon
    {
        return Err(SchedulingError::Invalid("beyond advance booking horizon"));
    }
    if let Some((open, close)) = policy.business_hours
        && !within_business_hours(interval, open, close)
    {
        return Err(SchedulingError::Invalid("outside business hours"));
    }
    Ok(())
}

fn within_business_hours(interval: &Interval, open: u32, close: u32) -> bool {
    let Some(start) = DateTime::<Utc>::from_timestamp_millis(interval.start) else {
        return false;
    };
    let Some(midnight) = start.date_naive().and_hms_opt(0, 0, 0) else {
        return false;
    };
    let day_start = midnight.and_utc().timestamp_millis();
    let window = Interval::new(
        day_start + Ms::from(open) * HOUR_MS,
        day_start + Ms::from(close) * HOUR_MS,
    );
    window.contains(interval)
}

pub(crate) fn validate_text(
    title: &str,
    description: Option<&str>,
) -> Result<(), SchedulingError> {
    if title.trim().is_empty() {
        return Err(SchedulingError::Invalid("title is required"));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(SchedulingError::Invalid("title too long"));
    }
    if description.is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(SchedulingError::Invalid("description too long"));
    }
    Ok(())
}

pub(crate) fn validate_attendees(
    policy: &BookingPolicy,
    attendees: &[Attendee],
    room_capacity: u32,
) -> Result<(), SchedulingError> {
    if attendees.len() > policy.max_attendees.min(MAX_ATTENDEES) {
        return Err(SchedulingError::Invalid("too many attendees"));
    }
    if attendees.len() > room_capacity as usize {
        return Err(SchedulingError::Invalid("attendees exceed room capacity"));
    }
    let mut seen = HashSet::with_capacity(attendees.len());
    for attendee in attendees {
        let email = attendee.email.trim();
        if email.is_empty() || !email.contains('@') || email.len() > MAX_EMAIL_LEN {
            return Err(SchedulingError::Invalid("invalid attendee email"));
        }
        if !seen.insert(email.to_ascii_lowercase()) {
            return Err(SchedulingError::Invalid("duplicate attendee email"));
        }
    }
    Ok(())
}
