use ulid::Ulid;

use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;

use super::availability::{free_slots, merge_overlapping};
use super::{Engine, SchedulingError};

impl Engine {
    /// `None` for an unknown room, otherwise whether it accepts new bookings.
    pub async fn room_status(&self, room_id: &Ulid) -> Option<bool> {
        let rs = self.get_room(room_id)?;
        let active = rs.read().await.active;
        Some(active)
    }

    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(rooms.len());
        for rs in rooms {
            infos.push(rs.read().await.info());
        }
        infos.sort_by_key(|r| r.id);
        infos
    }

    /// True if a CONFIRMED booking in the room overlaps `interval`, other than
    /// `exclude`. Unknown rooms have no conflicts.
    pub async fn has_conflict(&self, room_id: &Ulid, interval: &Interval, exclude: Option<Ulid>) -> bool {
        let Some(rs) = self.get_room(room_id) else {
            return false;
        };
        let guard = rs.read().await;
        super::conflict::has_conflict(&guard, interval, exclude)
    }

    pub async fn get_booking(&self, id: &Ulid) -> Result<Booking, SchedulingError> {
        let room_id = self
            .booking_rooms
            .get(id)
            .map(|e| *e.value())
            .ok_or(SchedulingError::BookingNotFound(*id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(SchedulingError::RoomNotFound(room_id))?;
        let guard = rs.read().await;
        guard
            .bookings
            .get(id)
            .cloned()
            .ok_or(SchedulingError::BookingNotFound(*id))
    }

    /// Bookings in a room ordered by start.
    pub async fn list_bookings(
        &self,
        room_id: &Ulid,
        include_cancelled: bool,
    ) -> Result<Vec<Booking>, SchedulingError> {
        let rs = self
            .get_room(room_id)
            .ok_or(SchedulingError::RoomNotFound(*room_id))?;
        let guard = rs.read().await;
        let mut bookings: Vec<Booking> = guard
            .bookings
            .values()
            .filter(|b| include_cancelled || b.status != BookingStatus::Cancelled)
            .cloned()
            .collect();
        bookings.sort_by_key(|b| (b.interval.start, b.id));
        Ok(bookings)
    }

    /// Every booking owned by `user_id` across rooms, ordered by start.
    pub async fn list_user_bookings(&self, user_id: &Ulid) -> Vec<Booking> {
        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut bookings = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            bookings.extend(guard.bookings.values().filter(|b| b.owner_id == *user_id).cloned());
        }
        bookings.sort_by_key(|b| (b.interval.start, b.id));
        bookings
    }

    /// Waitlist for a room in join order.
    pub async fn list_waitlist(&self, room_id: &Ulid) -> Result<Vec<WaitlistEntry>, SchedulingError> {
        let rs = self
            .get_room(room_id)
            .ok_or(SchedulingError::RoomNotFound(*room_id))?;
        let guard = rs.read().await;
        let mut entries = guard.waitlist.clone();
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    pub async fn get_waitlist_entry(&self, id: &Ulid) -> Result<WaitlistEntry, SchedulingError> {
        let room_id = self
            .entry_rooms
            .get(id)
            .map(|e| *e.value())
            .ok_or(SchedulingError::EntryNotFound(*id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(SchedulingError::RoomNotFound(room_id))?;
        let guard = rs.read().await;
        guard
            .entry(id)
            .cloned()
            .ok_or(SchedulingError::EntryNotFound(*id))
    }

    pub async fn free_slots(
        &self,
        room_id: &Ulid,
        window: Interval,
        min_duration: Option<Ms>,
    ) -> Result<Vec<Interval>, SchedulingError> {
        check_window(&window)?;
        let rs = self
            .get_room(room_id)
            .ok_or(SchedulingError::RoomNotFound(*room_id))?;
        let guard = rs.read().await;
        Ok(free_slots(&guard, &window, min_duration))
    }

    /// Occupied stretches of a window; back-to-back bookings collapse into one.
    pub async fn busy_periods(
        &self,
        room_id: &Ulid,
        window: Interval,
    ) -> Result<Vec<Interval>, SchedulingError> {
        check_window(&window)?;
        let rs = self
            .get_room(room_id)
            .ok_or(SchedulingError::RoomNotFound(*room_id))?;
        let guard = rs.read().await;
        let clamped: Vec<Interval> = guard
            .overlapping(&window)
            .map(|s| Interval::new(s.interval.start.max(window.start), s.interval.end.min(window.end)))
            .collect();
        Ok(merge_overlapping(&clamped))
    }
}

fn check_window(window: &Interval) -> Result<(), SchedulingError> {
    if window.start >= window.end {
        return Err(SchedulingError::Invalid("window end must be after start"));
    }
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(SchedulingError::Invalid("query window too wide"));
    }
    Ok(())
}
