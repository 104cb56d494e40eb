use crate::model::*;

/// Free sub-ranges of `window` on a room, after removing CONFIRMED bookings.
/// Gaps shorter than `min_duration` are dropped.
pub fn free_slots(rs: &RoomState, window: &Interval, min_duration: Option<Ms>) -> Vec<Interval> {
    // The timeline is sorted and non-overlapping, so the taken list is too.
    let taken: Vec<Interval> = rs.overlapping(window).map(|s| s.interval).collect();
    let mut free = subtract_intervals(&[*window], &taken);
    if let Some(min) = min_duration {
        free.retain(|gap| gap.duration_ms() >= min);
    }
    free
}

/// Merge sorted intervals that overlap or touch into disjoint ones.
pub fn merge_overlapping(sorted: &[Interval]) -> Vec<Interval> {
    let mut merged: Vec<Interval> = Vec::with_capacity(sorted.len());
    for &next in sorted {
        match merged.last_mut() {
            Some(last) if next.start <= last.end => last.end = last.end.max(next.end),
            _ => merged.push(next),
        }
    }
    merged
}

/// `base` minus `to_remove`. Both must be sorted by start.
pub fn subtract_intervals(base: &[Interval], to_remove: &[Interval]) -> Vec<Interval> {
    let mut result = Vec::new();
    let mut first = 0;

    for b in base {
        let mut cursor = b.start;
        while first < to_remove.len() && to_remove[first].end <= cursor {
            first += 1;
        }
        for r in to_remove[first..].iter().take_while(|r| r.start < b.end) {
            if r.start > cursor {
                result.push(Interval::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
        }
        if cursor < b.end {
            result.push(Interval::new(cursor, b.end));
        }
    }

    result
}
