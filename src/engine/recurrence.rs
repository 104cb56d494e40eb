//! Recurrence expansion.
//!
//! A parent booking plus its rule yields a bounded, lazy sequence of candidate
//! intervals. The first candidate is always the parent itself; placement starts
//! from the second and skips any candidate that cannot be placed.

use std::iter::FusedIterator;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use ulid::Ulid;

use crate::config::BookingPolicy;
use crate::limits::MAX_RECURRENCE_STEPS;
use crate::model::*;

use super::conflict::{find_conflict, validate_interval};
use super::SchedulingError;

/// Why an occurrence was not created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Slot already held by this CONFIRMED booking.
    Conflict { booking: Ulid },
    /// Violates a business rule (past, beyond horizon, outside hours).
    Policy(&'static str),
    /// The WAL rejected the write after the parent was committed.
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedOccurrence {
    pub interval: Interval,
    pub reason: SkipReason,
}

/// Placement summary returned alongside a recurring parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecurrenceOutcome {
    /// Occurrences attempted after the parent.
    pub requested: u32,
    /// Ids of the child bookings created, in chronological order.
    pub created: Vec<Ulid>,
    pub skipped: Vec<SkippedOccurrence>,
}

impl RecurrenceOutcome {
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

/// Lazy occurrence sequence. Consumed by iteration; cannot be rewound.
#[derive(Debug)]
pub struct Occurrences {
    anchor: DateTime<Utc>,
    duration: Ms,
    frequency: Frequency,
    step: u32,
    until: Option<Ms>,
    remaining: u32,
    index: u32,
}

/// Expand `rule` from `parent`'s interval, yielding at most `max_occurrences`
/// intervals (the parent's own interval first).
pub fn expand(parent: &Interval, rule: &RecurrenceRule, max_occurrences: u32) -> Occurrences {
    let limit = rule.count.unwrap_or(max_occurrences).min(max_occurrences);
    // An out-of-range anchor yields nothing rather than a bogus epoch series.
    let (anchor, remaining) = match DateTime::<Utc>::from_timestamp_millis(parent.start) {
        Some(anchor) => (anchor, limit),
        None => (DateTime::<Utc>::default(), 0),
    };
    Occurrences {
        anchor,
        duration: parent.duration_ms(),
        frequency: rule.frequency,
        step: rule.interval.max(1),
        until: rule.until,
        remaining,
        index: 0,
    }
}

impl Occurrences {
    /// Start of the `k`-th candidate, or `None` when that month has no such day.
    fn candidate(&self, k: u32) -> Option<DateTime<Utc>> {
        let n = i64::from(k) * i64::from(self.step);
        match self.frequency {
            Frequency::Daily => Some(self.anchor + Duration::days(n)),
            Frequency::Weekly => Some(self.anchor + Duration::weeks(n)),
            Frequency::Monthly => {
                let months = i64::from(self.anchor.month0()) + n;
                let year = self.anchor.year() + i32::try_from(months / 12).ok()?;
                let month = u32::try_from(months % 12).ok()? + 1;
                let date = NaiveDate::from_ymd_opt(year, month, self.anchor.day())?;
                Some(date.and_time(self.anchor.time()).and_utc())
            }
        }
    }
}

impl Iterator for Occurrences {
    type Item = Interval;

    fn next(&mut self) -> Option<Interval> {
        while self.remaining > 0 {
            if self.index > MAX_RECURRENCE_STEPS {
                self.remaining = 0;
                break;
            }
            let k = self.index;
            self.index += 1;
            let Some(start) = self.candidate(k) else {
                continue;
            };
            let start = start.timestamp_millis();
            if self.until.is_some_and(|until| start > until) {
                self.remaining = 0;
                break;
            }
            self.remaining -= 1;
            return Some(Interval::new(start, start + self.duration));
        }
        None
    }
}

impl FusedIterator for Occurrences {}

/// Structural checks on a rule before anything is committed.
pub(crate) fn validate_rule(rule: &RecurrenceRule, parent: &Interval) -> Result<(), SchedulingError> {
    if rule.interval == 0 {
        return Err(SchedulingError::Invalid("recurrence interval must be at least 1"));
    }
    if rule.count == Some(0) {
        return Err(SchedulingError::Invalid("recurrence count must be at least 1"));
    }
    if rule.until.is_some_and(|until| until < parent.start) {
        return Err(SchedulingError::Invalid("recurrence ends before it starts"));
    }
    let min_step = match rule.frequency {
        Frequency::Daily => DAY_MS,
        Frequency::Weekly => 7 * DAY_MS,
        // Shortest month.
        Frequency::Monthly => 28 * DAY_MS,
    } * Ms::from(rule.interval);
    if parent.duration_ms() > min_step {
        return Err(SchedulingError::Invalid("occurrences would overlap each other"));
    }
    Ok(())
}

/// Decide which occurrences after the parent can be placed on `rs`.
///
/// `rs` must already contain the parent. Returns the placeable intervals and the
/// skipped ones, in chronological order.
pub(crate) fn plan_occurrences(
    rs: &RoomState,
    occurrences: Occurrences,
    policy: &BookingPolicy,
    now: Ms,
) -> (Vec<Interval>, Vec<SkippedOccurrence>) {
    let mut accepted: Vec<Interval> = Vec::new();
    let mut skipped = Vec::new();

    for interval in occurrences.skip(1) {
        if let Err(SchedulingError::Invalid(reason)) = validate_interval(policy, &interval, now) {
            tracing::debug!(start = interval.start, reason, "occurrence skipped by policy");
            skipped.push(SkippedOccurrence {
                interval,
                reason: SkipReason::Policy(reason),
            });
            continue;
        }
        if let Some(booking) = find_conflict(rs, &interval, None) {
            tracing::debug!(start = interval.start, %booking, "occurrence skipped by conflict");
            skipped.push(SkippedOccurrence {
                interval,
                reason: SkipReason::Conflict { booking },
            });
            continue;
        }
        debug_assert!(!accepted.iter().any(|a| a.overlaps(&interval)));
        accepted.push(interval);
    }

    (accepted, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> Ms {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis()
    }

    fn hour_at(start: Ms) -> Interval {
        Interval::new(start, start + HOUR_MS)
    }

    #[test]
    fn weekly_first_is_parent() {
        let parent = hour_at(at(2031, 3, 3, 10));
        let got: Vec<_> = expand(&parent, &RecurrenceRule::weekly(4), 52).collect();
        assert_eq!(got.len(), 4);
        assert_eq!(got[0], parent);
        for (k, occ) in got.iter().enumerate() {
            assert_eq!(occ.start, parent.start + k as Ms * 7 * DAY_MS);
            assert_eq!(occ.duration_ms(), HOUR_MS);
        }
    }

    #[test]
    fn count_is_capped_by_ceiling() {
        let parent = hour_at(at(2031, 1, 6, 9));
        assert_eq!(expand(&parent, &RecurrenceRule::weekly(200), 52).count(), 52);
        let open_ended = RecurrenceRule {
            count: None,
            ..RecurrenceRule::daily(1)
        };
        assert_eq!(expand(&parent, &open_ended, 52).count(), 52);
    }

    #[test]
    fn until_is_inclusive() {
        let parent = hour_at(at(2031, 1, 1, 9));
        let rule = RecurrenceRule {
            count: None,
            ..RecurrenceRule::daily(1)
        }
        .until(at(2031, 1, 4, 9));
        let got: Vec<_> = expand(&parent, &rule, 52).collect();
        assert_eq!(got.len(), 4);
        assert_eq!(got[3].start, at(2031, 1, 4, 9));
    }

    #[test]
    fn interval_steps_multiply() {
        let parent = hour_at(at(2031, 1, 1, 9));
        let got: Vec<_> = expand(&parent, &RecurrenceRule::weekly(3).every(2), 52).collect();
        assert_eq!(got[1].start, parent.start + 14 * DAY_MS);
        assert_eq!(got[2].start, parent.start + 28 * DAY_MS);
    }

    #[test]
    fn monthly_skips_missing_days() {
        let parent = hour_at(at(2031, 1, 31, 9));
        let got: Vec<_> = expand(&parent, &RecurrenceRule::monthly(4), 52).collect();
        let starts: Vec<Ms> = got.iter().map(|i| i.start).collect();
        // February, April have no 31st.
        assert_eq!(
            starts,
            vec![at(2031, 1, 31, 9), at(2031, 3, 31, 9), at(2031, 5, 31, 9), at(2031, 7, 31, 9)]
        );
    }

    #[test]
    fn monthly_crosses_year_boundary() {
        let parent = hour_at(at(2031, 11, 15, 9));
        let got: Vec<_> = expand(&parent, &RecurrenceRule::monthly(3), 52).collect();
        assert_eq!(got[2].start, at(2032, 1, 15, 9));
    }

    #[test]
    fn sequence_is_consumed() {
        let parent = hour_at(at(2031, 1, 1, 9));
        let mut occ = expand(&parent, &RecurrenceRule::daily(2), 52);
        assert!(occ.next().is_some());
        assert!(occ.next().is_some());
        assert!(occ.next().is_none());
        assert!(occ.next().is_none());
    }

    #[test]
    fn rule_validation() {
        let parent = hour_at(at(2031, 1, 1, 9));
        assert!(validate_rule(&RecurrenceRule::weekly(4), &parent).is_ok());
        assert!(validate_rule(&RecurrenceRule::weekly(4).every(0), &parent).is_err());
        assert!(validate_rule(&RecurrenceRule::weekly(0), &parent).is_err());
        assert!(validate_rule(&RecurrenceRule::weekly(4).until(parent.start - 1), &parent).is_err());
        let long = Interval::new(parent.start, parent.start + 2 * DAY_MS);
        assert!(validate_rule(&RecurrenceRule::daily(3), &long).is_err());
    }

    #[test]
    fn plan_skips_taken_slot() {
        let parent = hour_at(at(2031, 3, 3, 10));
        let mut rs = RoomState::new(Ulid::new(), None, 10, true);
        rs.insert_slot(Slot {
            booking_id: Ulid::new(),
            interval: parent,
        });
        let blocker = Ulid::new();
        rs.insert_slot(Slot {
            booking_id: blocker,
            interval: parent.shifted(14 * DAY_MS),
        });

        let occurrences = expand(&parent, &RecurrenceRule::weekly(4), 52);
        let (accepted, skipped) =
            plan_occurrences(&rs, occurrences, &BookingPolicy::relaxed(), at(2031, 1, 1, 0));
        assert_eq!(accepted, vec![parent.shifted(7 * DAY_MS), parent.shifted(21 * DAY_MS)]);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].reason, SkipReason::Conflict { booking: blocker });
    }

    #[test]
    fn plan_skips_beyond_horizon() {
        let parent = hour_at(at(2031, 3, 3, 10));
        let rs = RoomState::new(Ulid::new(), None, 10, true);
        let policy = BookingPolicy {
            max_advance_ms: Some(10 * DAY_MS),
            ..BookingPolicy::relaxed()
        };
        let now = parent.start - DAY_MS;
        let (accepted, skipped) =
            plan_occurrences(&rs, expand(&parent, &RecurrenceRule::weekly(3), 52), &policy, now);
        assert_eq!(accepted.len(), 1);
        assert_eq!(
            skipped[0].reason,
            SkipReason::Policy("beyond advance booking horizon")
        );
    }
}
