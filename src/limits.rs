use crate::model::{Ms, DAY_MS};

/// Earliest instant accepted anywhere (2000-01-01T00:00:00Z).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// Latest instant accepted anywhere (2200-01-01T00:00:00Z).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_ROOMS: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_ATTENDEES: usize = 500;

pub const MAX_BOOKINGS_PER_ROOM: usize = 100_000;
pub const MAX_WAITLIST_PER_ROOM: usize = 10_000;

/// One year of weekly meetings.
pub const MAX_OCCURRENCES: u32 = 52;
/// Iteration bound for sparse monthly rules (e.g. the 31st every month).
pub const MAX_RECURRENCE_STEPS: u32 = 1_000;

pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;
