use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::MAX_WAITLIST_PER_ROOM;
use crate::model::*;

use super::conflict::{find_conflict, now_ms, validate_interval};
use super::lifecycle::waitlist_transition_allowed;
use super::{Engine, SchedulingError};

/// Result of one expiry pass over every room.
#[derive(Debug, Default)]
pub struct Sweep {
    pub expired: Vec<WaitlistEntry>,
    /// First failure; rooms after it were still swept.
    pub error: Option<SchedulingError>,
}

/// Entries a freed interval promotes, oldest first.
fn promotion_candidates(rs: &RoomState, freed: &Interval, now: Ms) -> Vec<Ulid> {
    let mut candidates: Vec<&WaitlistEntry> = rs
        .waitlist
        .iter()
        .filter(|e| e.status == WaitlistStatus::Waiting)
        .filter(|e| e.interval.overlaps(freed))
        // Already started: the sweeper expires these, nobody can use the slot.
        .filter(|e| e.interval.start > now)
        .collect();
    candidates.sort_by_key(|e| e.seq);
    candidates.into_iter().map(|e| e.id).collect()
}

impl Engine {
    /// Queue for a slot that is currently taken.
    ///
    /// A free slot is rejected (book it instead), as is a second open entry for
    /// the same user and exact interval.
    pub async fn join_waitlist(
        &self,
        user_id: Ulid,
        room_id: Ulid,
        interval: Interval,
    ) -> Result<WaitlistEntry, SchedulingError> {
        let now = now_ms();
        validate_interval(&self.policy, &interval, now)?;

        let mut guard = self.room_write(&room_id).await?;
        if !guard.active {
            return Err(SchedulingError::Invalid("room is not active"));
        }
        if find_conflict(&guard, &interval, None).is_none() {
            return Err(SchedulingError::Invalid("slot is free; book it directly"));
        }
        if let Some(existing) = guard.waitlist.iter().find(|e| {
            e.status == WaitlistStatus::Waiting && e.user_id == user_id && e.interval == interval
        }) {
            return Err(SchedulingError::DuplicateWaitlistEntry { entry: existing.id });
        }
        let open = guard.waitlist.iter().filter(|e| e.status.is_open()).count();
        if open >= MAX_WAITLIST_PER_ROOM {
            return Err(SchedulingError::Invalid("waitlist is full"));
        }

        let entry = WaitlistEntry {
            id: Ulid::new(),
            user_id,
            room_id,
            interval,
            status: WaitlistStatus::Waiting,
            created_at: now,
            seq: guard.next_seq,
        };
        self.persist_and_apply(
            &mut guard,
            &Event::WaitlistJoined {
                entry: entry.clone(),
            },
        )
        .await?;
        info!(entry = %entry.id, room = %room_id, user = %user_id, "joined waitlist");
        Ok(entry)
    }

    /// Withdraw an open entry (it becomes EXPIRED). Closed entries are left as is.
    pub async fn leave_waitlist(&self, entry_id: Ulid, actor: Actor) -> Result<(), SchedulingError> {
        let mut guard = self.entry_write(&entry_id).await?;
        let entry = guard
            .entry(&entry_id)
            .cloned()
            .ok_or(SchedulingError::EntryNotFound(entry_id))?;
        if entry.user_id != actor.user_id && !actor.is_admin {
            return Err(SchedulingError::Forbidden {
                actor: actor.user_id,
                target: entry_id,
            });
        }
        if !entry.status.is_open() {
            return Ok(());
        }
        self.transition_entry(&mut guard, &entry, WaitlistStatus::Expired)
            .await?;
        info!(entry = %entry_id, user = %actor.user_id, "left waitlist");
        Ok(())
    }

    /// Promote every WAITING entry overlapping `freed`, in join order.
    ///
    /// Safe to re-run: entries already NOTIFIED are not touched again.
    pub async fn notify_waitlist(
        &self,
        room_id: Ulid,
        freed: Interval,
    ) -> Result<Vec<WaitlistEntry>, SchedulingError> {
        let mut guard = self.room_write(&room_id).await?;
        self.promote_waiting(&mut guard, &freed, now_ms())
            .await
            .map_err(|(_, e)| e)
    }

    /// Caller holds the room's write lock. On failure, returns what was promoted
    /// before the failing write together with the error.
    pub(super) async fn promote_waiting(
        &self,
        rs: &mut RoomState,
        freed: &Interval,
        now: Ms,
    ) -> Result<Vec<WaitlistEntry>, (Vec<WaitlistEntry>, SchedulingError)> {
        let mut promoted = Vec::new();
        for id in promotion_candidates(rs, freed, now) {
            let Some(entry) = rs.entry(&id).cloned() else {
                continue;
            };
            match self.transition_entry(rs, &entry, WaitlistStatus::Notified).await {
                Ok(updated) => {
                    info!(entry = %id, user = %updated.user_id, room = %rs.id, "waitlist entry promoted");
                    metrics::counter!(crate::observability::WAITLIST_PROMOTIONS_TOTAL).increment(1);
                    promoted.push(updated);
                }
                Err(e) => return Err((promoted, e)),
            }
        }
        Ok(promoted)
    }

    /// Mark `user_id`'s NOTIFIED entries overlapping a new booking as BOOKED.
    /// Write failures are logged; the booking already stands.
    pub(super) async fn fulfil_notified(
        &self,
        rs: &mut RoomState,
        user_id: Ulid,
        booked: &Interval,
    ) -> Vec<WaitlistEntry> {
        let matching: Vec<WaitlistEntry> = rs
            .waitlist
            .iter()
            .filter(|e| e.user_id == user_id && e.status == WaitlistStatus::Notified)
            .filter(|e| e.interval.overlaps(booked))
            .cloned()
            .collect();

        let mut fulfilled = Vec::with_capacity(matching.len());
        for entry in matching {
            match self.transition_entry(rs, &entry, WaitlistStatus::Booked).await {
                Ok(updated) => fulfilled.push(updated),
                Err(e) => warn!(entry = %entry.id, error = %e, "could not mark waitlist entry booked"),
            }
        }
        fulfilled
    }

    async fn transition_entry(
        &self,
        rs: &mut RoomState,
        entry: &WaitlistEntry,
        to: WaitlistStatus,
    ) -> Result<WaitlistEntry, SchedulingError> {
        if !waitlist_transition_allowed(entry.status, to) {
            return Err(SchedulingError::Invalid("waitlist transition not allowed"));
        }
        let event = Event::WaitlistStatusChanged {
            id: entry.id,
            room_id: entry.room_id,
            status: to,
        };
        self.persist_and_apply(rs, &event).await?;
        Ok(WaitlistEntry {
            status: to,
            ..entry.clone()
        })
    }

    /// Expire every WAITING/NOTIFIED entry whose start is at or before `now`.
    pub async fn sweep_expired(&self, now: Ms) -> Sweep {
        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut sweep = Sweep::default();

        for room in rooms {
            let mut guard = room.write().await;
            let due: Vec<WaitlistEntry> = guard
                .waitlist
                .iter()
                .filter(|e| e.status.is_open() && e.interval.start <= now)
                .cloned()
                .collect();
            for entry in due {
                match self.transition_entry(&mut guard, &entry, WaitlistStatus::Expired).await {
                    Ok(expired) => sweep.expired.push(expired),
                    Err(e) => {
                        warn!(entry = %entry.id, error = %e, "waitlist expiry failed");
                        sweep.error.get_or_insert(e);
                        break;
                    }
                }
            }
        }

        if !sweep.expired.is_empty() {
            info!(count = sweep.expired.len(), "expired waitlist entries");
            metrics::counter!(crate::observability::WAITLIST_EXPIRED_TOTAL)
                .increment(sweep.expired.len() as u64);
        }
        sweep
    }
}
