use std::path::PathBuf;
use std::time::Duration;

use crate::limits::MAX_OCCURRENCES;
use crate::model::{Ms, DAY_MS, HOUR_MS, MINUTE_MS};

/// Business rules every new or moved interval must satisfy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookingPolicy {
    pub min_duration_ms: Ms,
    pub max_duration_ms: Ms,
    /// Daily window `[open, close)` in UTC hours. `None` disables the check.
    ///
    /// An interval must start and end on the same day inside this window.
    pub business_hours: Option<(u32, u32)>,
    /// How far ahead a start may be. `None` means unbounded.
    pub max_advance_ms: Option<Ms>,
    /// Attendee ceiling; the room's capacity applies as well.
    pub max_attendees: usize,
    /// Ceiling for recurrence expansion, parent included.
    pub max_occurrences: u32,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            min_duration_ms: 15 * MINUTE_MS,
            max_duration_ms: 8 * HOUR_MS,
            business_hours: Some((7, 22)),
            max_advance_ms: Some(365 * DAY_MS),
            max_attendees: 100,
            max_occurrences: MAX_OCCURRENCES,
        }
    }
}

impl BookingPolicy {
    /// Only structural rules: no business hours, no horizon.
    pub fn relaxed() -> Self {
        Self {
            min_duration_ms: MINUTE_MS,
            max_duration_ms: 7 * DAY_MS,
            business_hours: None,
            max_advance_ms: None,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding the WAL.
    pub data_dir: PathBuf,

    /// Prometheus exporter port. `None` disables the exporter.
    pub metrics_port: Option<u16>,

    /// Emit JSON log lines instead of the human-readable format.
    pub json_logs: bool,

    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,

    /// Waitlist expiry sweep period.
    pub sweep_interval: Duration,

    /// Delivery attempts for a side effect that fails transiently.
    ///
    /// Permanent failures are never retried.
    pub delivery_attempts: u32,

    /// Backoff before the first redelivery; doubles per attempt.
    pub delivery_backoff: Duration,

    pub policy: BookingPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            json_logs: false,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(30),
            delivery_attempts: 5,
            delivery_backoff: Duration::from_millis(200),
            policy: BookingPolicy::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let policy_defaults = defaults.policy.clone();

        let business_hours = match std::env::var("ROOMKEEPER_BUSINESS_HOURS").ok().as_deref() {
            Some("off") | Some("") => None,
            Some(raw) => parse_hours(raw).or(policy_defaults.business_hours),
            None => policy_defaults.business_hours,
        };

        let policy = BookingPolicy {
            min_duration_ms: env_parse("ROOMKEEPER_MIN_DURATION_MINUTES")
                .and_then(|m| scale(m, MINUTE_MS))
                .unwrap_or(policy_defaults.min_duration_ms),
            max_duration_ms: env_parse("ROOMKEEPER_MAX_DURATION_MINUTES")
                .and_then(|m| scale(m, MINUTE_MS))
                .unwrap_or(policy_defaults.max_duration_ms),
            business_hours,
            max_advance_ms: match env_parse::<Ms>("ROOMKEEPER_MAX_ADVANCE_DAYS") {
                Some(0) => None,
                Some(days) => scale(days, DAY_MS).or(policy_defaults.max_advance_ms),
                None => policy_defaults.max_advance_ms,
            },
            max_attendees: env_parse("ROOMKEEPER_MAX_ATTENDEES")
                .unwrap_or(policy_defaults.max_attendees),
            max_occurrences: env_parse::<u32>("ROOMKEEPER_MAX_OCCURRENCES")
                .map_or(policy_defaults.max_occurrences, |n| n.clamp(1, MAX_OCCURRENCES)),
        };

        Self {
            data_dir: std::env::var("ROOMKEEPER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: env_parse("ROOMKEEPER_METRICS_PORT"),
            json_logs: env_parse("ROOMKEEPER_JSON_LOGS").unwrap_or(defaults.json_logs),
            compact_threshold: env_parse("ROOMKEEPER_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            sweep_interval: env_parse("ROOMKEEPER_SWEEP_INTERVAL_SECS")
                .map_or(defaults.sweep_interval, Duration::from_secs),
            delivery_attempts: env_parse::<u32>("ROOMKEEPER_DELIVERY_ATTEMPTS")
                .map_or(defaults.delivery_attempts, |n| n.max(1)),
            delivery_backoff: env_parse("ROOMKEEPER_DELIVERY_BACKOFF_MS")
                .map_or(defaults.delivery_backoff, Duration::from_millis),
            policy,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roomkeeper.wal")
    }
}

/// `n` units as milliseconds; `None` for negative or overflowing values.
fn scale(n: Ms, unit: Ms) -> Option<Ms> {
    if n < 0 {
        return None;
    }
    n.checked_mul(unit)
}

/// Parse `"7-22"` into `(7, 22)`.
fn parse_hours(raw: &str) -> Option<(u32, u32)> {
    let (open, close) = raw.split_once('-')?;
    let open: u32 = open.trim().parse().ok()?;
    let close: u32 = close.trim().parse().ok()?;
    (open < close && close <= 24).then_some((open, close))
}
