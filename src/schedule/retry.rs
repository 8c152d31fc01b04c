//! The retry ladder.
//!
//! A pure mapping from retry index to the next scheduled instant. The index
//! counts retries past the initial attempt: after attempt `n` fails, the
//! ladder is consulted with index `n` and the new entry carries `n + 1`.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayKind {
    /// Re-dial as soon as a slot frees up.
    Immediate,
    /// Fixed offset from now.
    Delay,
    /// Anchored to a wall-clock hour in the civil zone.
    AtHour,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub kind: DelayKind,
    pub at: DateTime<Utc>,
}

/// immediate / +1h / immediate / 09:00 / immediate / 14:00 / immediate /
/// 19:00 / immediate
const LADDER_LEN: i64 = 9;

/// Next scheduled instant for the given retry index, or `None` once the
/// ladder is exhausted. Pure: same inputs, same output.
pub fn next(retry_index: i64, now: DateTime<Utc>, tz: Tz) -> Option<RetrySchedule> {
    if !(0..LADDER_LEN).contains(&retry_index) {
        return None;
    }
    let schedule = match retry_index {
        0 | 2 | 4 | 6 | 8 => RetrySchedule {
            kind: DelayKind::Immediate,
            at: now,
        },
        1 => RetrySchedule {
            kind: DelayKind::Delay,
            at: now + Duration::hours(1),
        },
        3 => at_hour(now, tz, 9),
        5 => at_hour(now, tz, 14),
        7 => at_hour(now, tz, 19),
        _ => return None,
    };
    Some(schedule)
}

/// Bypass the ladder entirely, e.g. to re-dial after an abrupt hangup.
pub fn forced_immediate(now: DateTime<Utc>) -> RetrySchedule {
    RetrySchedule {
        kind: DelayKind::Immediate,
        at: now,
    }
}

/// True once no further attempt may be scheduled for this sequence.
pub fn is_exhausted(attempt: i64, max_attempts: i64) -> bool {
    attempt >= max_attempts - 1
}

fn at_hour(now: DateTime<Utc>, tz: Tz, hour: u32) -> RetrySchedule {
    RetrySchedule {
        kind: DelayKind::AtHour,
        at: super::clock::next_occurrence_of_hour(now, tz, hour),
    }
}
