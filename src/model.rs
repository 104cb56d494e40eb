use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only instant type the engine stores.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open time range `[start, end)`.
///
/// A booking ending at 10:00 does not overlap one starting at 10:00.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start: Ms,
    pub end: Ms,
}

impl Interval {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Interval start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied ranges.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn duration_minutes(&self) -> i64 {
        self.duration_ms() / MINUTE_MS
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// True if `self` fully contains `other`.
    pub fn contains(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn shifted(&self, by: Ms) -> Self {
        Self::new(self.start + by, self.end + by)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    /// Reserved for approval flows; nothing creates it today.
    Pending,
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendee {
    pub email: String,
    pub name: Option<String>,
}

impl Attendee {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    pub fn named(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

/// Repeat pattern carried by a parent booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    /// Step between occurrences, in units of `frequency`. Must be >= 1.
    pub interval: u32,
    /// Total occurrences including the parent.
    pub count: Option<u32>,
    /// Last instant an occurrence may start at (inclusive).
    pub until: Option<Ms>,
}

impl RecurrenceRule {
    pub fn weekly(count: u32) -> Self {
        Self {
            frequency: Frequency::Weekly,
            interval: 1,
            count: Some(count),
            until: None,
        }
    }

    pub fn daily(count: u32) -> Self {
        Self {
            frequency: Frequency::Daily,
            interval: 1,
            count: Some(count),
            until: None,
        }
    }

    pub fn monthly(count: u32) -> Self {
        Self {
            frequency: Frequency::Monthly,
            interval: 1,
            count: Some(count),
            until: None,
        }
    }

    pub fn every(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn until(mut self, until: Ms) -> Self {
        self.until = Some(until);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub room_id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub interval: Interval,
    pub status: BookingStatus,
    pub attendees: Vec<Attendee>,
    /// Present only on a recurrence parent.
    pub recurrence: Option<RecurrenceRule>,
    /// Present only on a generated occurrence.
    pub parent_id: Option<Ulid>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitlistStatus {
    Waiting,
    Notified,
    Booked,
    Expired,
}

impl WaitlistStatus {
    /// Still holds a place in the queue (can be promoted, booked or expired).
    pub fn is_open(self) -> bool {
        matches!(self, WaitlistStatus::Waiting | WaitlistStatus::Notified)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub user_id: Ulid,
    pub room_id: Ulid,
    pub interval: Interval,
    pub status: WaitlistStatus,
    pub created_at: Ms,
    /// Per-room join counter, assigned under the room lock. Defines queue
    /// order; `created_at` is informational and may go backwards.
    pub seq: u64,
}

/// Who is performing an operation. Threaded explicitly into every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Ulid,
    pub is_admin: bool,
}

impl Actor {
    pub fn user(user_id: Ulid) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    pub fn admin(user_id: Ulid) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }
}

/// A CONFIRMED booking's slot on a room timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub booking_id: Ulid,
    pub interval: Interval,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub name: Option<String>,
    pub capacity: u32,
    pub active: bool,
    /// CONFIRMED bookings only, sorted by `interval.start`. Pairwise non-overlapping.
    pub timeline: Vec<Slot>,
    /// Every booking ever made in this room, cancelled ones included.
    pub bookings: HashMap<Ulid, Booking>,
    /// Entries in join order.
    pub waitlist: Vec<WaitlistEntry>,
    pub next_seq: u64,
}

impl RoomState {
    pub fn new(id: Ulid, name: Option<String>, capacity: u32, active: bool) -> Self {
        Self {
            id,
            name,
            capacity,
            active,
            timeline: Vec::new(),
            bookings: HashMap::new(),
            waitlist: Vec::new(),
            next_seq: 0,
        }
    }

    /// Insert a slot maintaining sort order by start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .timeline
            .binary_search_by_key(&slot.interval.start, |s| s.interval.start)
            .unwrap_or_else(|e| e);
        self.timeline.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, booking_id: Ulid) -> Option<Slot> {
        let pos = self.timeline.iter().position(|s| s.booking_id == booking_id)?;
        Some(self.timeline.remove(pos))
    }

    /// Slots overlapping the query. Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Interval) -> impl Iterator<Item = &Slot> {
        let right_bound = self
            .timeline
            .partition_point(|s| s.interval.start < query.end);
        self.timeline[..right_bound]
            .iter()
            .filter(move |s| s.interval.end > query.start)
    }

    pub fn entry(&self, id: &Ulid) -> Option<&WaitlistEntry> {
        self.waitlist.iter().find(|e| e.id == *id)
    }

    pub fn entry_mut(&mut self, id: &Ulid) -> Option<&mut WaitlistEntry> {
        self.waitlist.iter_mut().find(|e| e.id == *id)
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            name: self.name.clone(),
            capacity: self.capacity,
            active: self.active,
        }
    }
}

/// WAL record format. Flat; each variant is one committed state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomRegistered {
        id: Ulid,
        name: Option<String>,
        capacity: u32,
        active: bool,
    },
    RoomUpdated {
        id: Ulid,
        name: Option<String>,
        capacity: u32,
        active: bool,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingUpdated {
        id: Ulid,
        room_id: Ulid,
        title: String,
        description: Option<String>,
        interval: Interval,
        attendees: Vec<Attendee>,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        room_id: Ulid,
        at: Ms,
    },
    WaitlistJoined {
        entry: WaitlistEntry,
    },
    WaitlistStatusChanged {
        id: Ulid,
        room_id: Ulid,
        status: WaitlistStatus,
    },
}

impl Event {
    /// Room the event applies to.
    pub fn room_id(&self) -> Ulid {
        match self {
            Event::RoomRegistered { id, .. } | Event::RoomUpdated { id, .. } => *id,
            Event::BookingCreated { booking } => booking.room_id,
            Event::WaitlistJoined { entry } => entry.room_id,
            Event::BookingUpdated { room_id, .. }
            | Event::BookingCancelled { room_id, .. }
            | Event::WaitlistStatusChanged { room_id, .. } => *room_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub capacity: u32,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(start: Ms, end: Ms) -> Slot {
        Slot {
            booking_id: Ulid::new(),
            interval: Interval::new(start, end),
        }
    }

    #[test]
    fn interval_basics() {
        let i = Interval::new(0, 90 * MINUTE_MS);
        assert_eq!(i.duration_minutes(), 90);
        assert!(i.contains_instant(0));
        assert!(!i.contains_instant(90 * MINUTE_MS)); // half-open
        assert!(Interval::try_new(10, 10).is_none());
        assert!(Interval::try_new(11, 10).is_none());
    }

    #[test]
    fn interval_overlap_is_half_open() {
        let a = Interval::new(10 * HOUR_MS, 11 * HOUR_MS);
        let b = Interval::new(11 * HOUR_MS, 12 * HOUR_MS);
        let c = Interval::new(10 * HOUR_MS + 30 * MINUTE_MS, 11 * HOUR_MS + 30 * MINUTE_MS);
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
        assert!(a.overlaps(&c));
        assert!(a.overlaps(&a));
    }

    #[test]
    fn interval_contains() {
        let outer = Interval::new(100, 400);
        assert!(outer.contains(&Interval::new(150, 300)));
        assert!(outer.contains(&outer));
        assert!(!outer.contains(&Interval::new(50, 200)));
    }

    #[test]
    fn timeline_stays_sorted() {
        let mut rs = RoomState::new(Ulid::new(), None, 10, true);
        rs.insert_slot(slot(300, 400));
        rs.insert_slot(slot(100, 200));
        rs.insert_slot(slot(200, 300));
        let starts: Vec<Ms> = rs.timeline.iter().map(|s| s.interval.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_slot_by_booking() {
        let mut rs = RoomState::new(Ulid::new(), None, 10, true);
        let s = slot(100, 200);
        rs.insert_slot(s);
        rs.insert_slot(slot(300, 400));
        assert_eq!(rs.remove_slot(s.booking_id), Some(s));
        assert_eq!(rs.timeline.len(), 1);
        assert!(rs.remove_slot(Ulid::new()).is_none());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = RoomState::new(Ulid::new(), None, 10, true);
        rs.insert_slot(slot(100, 200));
        rs.insert_slot(slot(450, 600));
        rs.insert_slot(slot(1000, 1100));
        let hits: Vec<_> = rs.overlapping(&Interval::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].interval, Interval::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut rs = RoomState::new(Ulid::new(), None, 10, true);
        rs.insert_slot(slot(100, 200));
        assert_eq!(rs.overlapping(&Interval::new(200, 300)).count(), 0);
        assert_eq!(rs.overlapping(&Interval::new(0, 100)).count(), 0);
        assert_eq!(rs.overlapping(&Interval::new(199, 300)).count(), 1);
    }

    #[test]
    fn open_waitlist_statuses() {
        assert!(WaitlistStatus::Waiting.is_open());
        assert!(WaitlistStatus::Notified.is_open());
        assert!(!WaitlistStatus::Booked.is_open());
        assert!(!WaitlistStatus::Expired.is_open());
    }

    #[test]
    fn event_bincode_roundtrip() {
        let event = Event::WaitlistJoined {
            entry: WaitlistEntry {
                id: Ulid::new(),
                user_id: Ulid::new(),
                room_id: Ulid::new(),
                interval: Interval::new(1000, 2000),
                status: WaitlistStatus::Waiting,
                created_at: 5,
                seq: 0,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
