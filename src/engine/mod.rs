mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod recurrence;
mod waitlist;

pub use availability::{free_slots, merge_overlapping, subtract_intervals};
pub use conflict::{find_conflict, has_conflict};
pub use error::{ErrorKind, SchedulingError};
pub use lifecycle::BookingChanges;
pub use mutations::{BookingRequest, Cancellation, CreatedBooking};
pub use recurrence::{expand, Occurrences, RecurrenceOutcome, SkipReason, SkippedOccurrence};
pub use waitlist::Sweep;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::config::BookingPolicy;
use crate::model::*;
use crate::wal::Wal;

/// One room's timeline and waitlist. Every mutation holds the write lock from
/// validation through WAL append and apply, so check-then-act is atomic per room.
pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());

        for (_, tx) in batch {
            let reply = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(reply);
        }

        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stray buffered bytes never leak into
    // the next batch; the whole batch is reported failed either way.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_snapshot(wal.path(), &events).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: booking id → room id.
    pub(super) booking_rooms: DashMap<Ulid, Ulid>,
    /// Reverse lookup: waitlist entry id → room id.
    pub(super) entry_rooms: DashMap<Ulid, Ulid>,
    pub(super) policy: BookingPolicy,
    pub(super) registry: Mutex<()>,
}

/// Apply an event to a room (no locking; caller holds the write lock or owns the state).
fn apply_to_room(
    rs: &mut RoomState,
    event: &Event,
    booking_rooms: &DashMap<Ulid, Ulid>,
    entry_rooms: &DashMap<Ulid, Ulid>,
) {
    match event {
        Event::RoomUpdated {
            name,
            capacity,
            active,
            ..
        } => {
            rs.name = name.clone();
            rs.capacity = *capacity;
            rs.active = *active;
        }
        Event::BookingCreated { booking } => {
            if booking.is_confirmed() {
                rs.insert_slot(Slot {
                    booking_id: booking.id,
                    interval: booking.interval,
                });
            }
            booking_rooms.insert(booking.id, booking.room_id);
            rs.bookings.insert(booking.id, booking.clone());
        }
        Event::BookingUpdated {
            id,
            title,
            description,
            interval,
            attendees,
            at,
            ..
        } => {
            let Some(booking) = rs.bookings.get_mut(id) else {
                return;
            };
            booking.title = title.clone();
            booking.description = description.clone();
            booking.attendees = attendees.clone();
            booking.updated_at = *at;
            let moved = booking.interval != *interval;
            booking.interval = *interval;
            if moved && booking.is_confirmed() {
                rs.remove_slot(*id);
                rs.insert_slot(Slot {
                    booking_id: *id,
                    interval: *interval,
                });
            }
        }
        Event::BookingCancelled { id, at, .. } => {
            if let Some(booking) = rs.bookings.get_mut(id) {
                booking.status = BookingStatus::Cancelled;
                booking.updated_at = *at;
            }
            rs.remove_slot(*id);
        }
        Event::WaitlistJoined { entry } => {
            rs.next_seq = rs.next_seq.max(entry.seq + 1);
            entry_rooms.insert(entry.id, entry.room_id);
            rs.waitlist.push(entry.clone());
        }
        Event::WaitlistStatusChanged { id, status, .. } => {
            if let Some(entry) = rs.entry_mut(id) {
                entry.status = *status;
            }
        }
        // Registration happens at the map level.
        Event::RoomRegistered { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, policy: BookingPolicy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let booking_rooms = DashMap::new();
        let entry_rooms = DashMap::new();

        // Rebuild plain state first; nothing else can see it yet, so no locks.
        let mut rebuilt: HashMap<Ulid, RoomState> = HashMap::new();
        for event in &events {
            match event {
                Event::RoomRegistered {
                    id,
                    name,
                    capacity,
                    active,
                } => {
                    rebuilt.insert(*id, RoomState::new(*id, name.clone(), *capacity, *active));
                }
                other => {
                    if let Some(rs) = rebuilt.get_mut(&other.room_id()) {
                        apply_to_room(rs, other, &booking_rooms, &entry_rooms);
                    }
                }
            }
        }

        let rooms = DashMap::with_capacity(rebuilt.len());
        for (id, rs) in rebuilt {
            rooms.insert(id, Arc::new(RwLock::new(rs)));
        }
        if !events.is_empty() {
            tracing::info!(
                events = events.len(),
                rooms = rooms.len(),
                bookings = booking_rooms.len(),
                "replayed WAL"
            );
        }

        Ok(Self {
            rooms,
            wal_tx,
            booking_rooms,
            entry_rooms,
            policy,
            registry: Mutex::new(()),
        })
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), SchedulingError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| SchedulingError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulingError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| SchedulingError::Storage(e.to_string()))
    }

    pub(super) fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// Durably record the event, then apply it. Nothing is applied if the write fails.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), SchedulingError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.booking_rooms, &self.entry_rooms);
        Ok(())
    }

    pub(super) async fn room_write(
        &self,
        room_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, SchedulingError> {
        let rs = self
            .get_room(room_id)
            .ok_or(SchedulingError::RoomNotFound(*room_id))?;
        Ok(rs.write_owned().await)
    }

    /// Booking id → room, then that room's write lock.
    pub(super) async fn booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, SchedulingError> {
        let room_id = self
            .booking_rooms
            .get(booking_id)
            .map(|e| *e.value())
            .ok_or(SchedulingError::BookingNotFound(*booking_id))?;
        self.room_write(&room_id).await
    }

    /// Waitlist entry id → room, then that room's write lock.
    pub(super) async fn entry_write(
        &self,
        entry_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, SchedulingError> {
        let room_id = self
            .entry_rooms
            .get(entry_id)
            .map(|e| *e.value())
            .ok_or(SchedulingError::EntryNotFound(*entry_id))?;
        self.room_write(&room_id).await
    }
}
