//! Civil-time helpers for the retry ladder and operating-hours checks.
//!
//! All queue arithmetic is UTC; the configured IANA zone only matters when
//! a retry is anchored to a wall-clock hour.

use chrono::{DateTime, Datelike, Days, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;

/// Parse the configured zone name, e.g. "Europe/Rome".
pub fn parse_zone(name: &str) -> Result<Tz, ClockError> {
    name.parse::<Tz>()
        .map_err(|_| ClockError::UnknownZone(name.to_string()))
}

/// The smallest instant strictly after `now` whose wall clock in `tz` reads
/// `hour`:00. If `now` is exactly on the hour, that occurrence is skipped.
pub fn next_occurrence_of_hour(now: DateTime<Utc>, tz: Tz, hour: u32) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);

    // Up to three days covers today, tomorrow, and a DST gap on either.
    for days in 0..4 {
        let candidate = local
            .date_naive()
            .checked_add_days(Days::new(days))
            .and_then(|date| date.and_hms_opt(hour, 0, 0))
            .and_then(|naive| tz.from_local_datetime(&naive).earliest())
            .map(|dt| dt.with_timezone(&Utc));

        if let Some(candidate) = candidate {
            if candidate > now {
                return candidate;
            }
        }
    }

    // Unreachable with sane zone data; degrade to a plain one-day delay.
    now + chrono::Duration::hours(24)
}

/// Calls may be placed 08:00-20:00 civil time.
pub fn is_within_operating_hours(now: DateTime<Utc>, tz: Tz) -> bool {
    let hour = now.with_timezone(&tz).hour();
    (8..20).contains(&hour)
}

/// Wall-clock retries are only anchored inside 09:00-20:00 civil time.
pub fn is_within_retry_hours(now: DateTime<Utc>, tz: Tz) -> bool {
    let hour = now.with_timezone(&tz).hour();
    (9..20).contains(&hour)
}

/// Midnight (civil) of the next Monday-Friday day after `now`.
pub fn next_business_day(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let mut date = now.with_timezone(&tz).date_naive();

    for _ in 0..7 {
        date = match date.checked_add_days(Days::new(1)) {
            Some(d) => d,
            None => break,
        };
        if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            if let Some(dt) = date
                .and_hms_opt(0, 0, 0)
                .and_then(|naive| tz.from_local_datetime(&naive).earliest())
            {
                return dt.with_timezone(&Utc);
            }
        }
    }

    now + chrono::Duration::hours(24)
}

#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    #[error("unknown time zone: {0}")]
    UnknownZone(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rome() -> Tz {
        parse_zone("Europe/Rome").unwrap()
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn hour_already_past_rolls_to_next_day() {
        // 10:15Z on 2025-03-14 is 11:15 in Rome (UTC+1), past 09:00.
        // Expect 09:00 Rome the next day = 08:00Z.
        let t = utc(2025, 3, 14, 10, 15);
        assert_eq!(
            next_occurrence_of_hour(t, rome(), 9),
            utc(2025, 3, 15, 8, 0)
        );
    }

    #[test]
    fn hour_still_ahead_lands_today() {
        // 06:30Z = 07:30 Rome; 09:00 Rome today = 08:00Z.
        let t = utc(2025, 3, 14, 6, 30);
        assert_eq!(
            next_occurrence_of_hour(t, rome(), 9),
            utc(2025, 3, 14, 8, 0)
        );
    }

    #[test]
    fn exactly_on_the_hour_is_strictly_after() {
        // 08:00Z = 09:00 Rome exactly; must skip to the next day.
        let t = utc(2025, 3, 14, 8, 0);
        assert_eq!(
            next_occurrence_of_hour(t, rome(), 9),
            utc(2025, 3, 15, 8, 0)
        );
    }

    #[test]
    fn crosses_dst_spring_forward() {
        // Rome moves to UTC+2 on 2025-03-30; 09:00 Rome becomes 07:00Z.
        let t = utc(2025, 3, 29, 10, 0);
        assert_eq!(
            next_occurrence_of_hour(t, rome(), 9),
            utc(2025, 3, 30, 7, 0)
        );
    }

    #[test]
    fn operating_hours_boundaries() {
        // 07:00Z = 08:00 Rome (winter): opening edge is inside.
        assert!(is_within_operating_hours(utc(2025, 1, 10, 7, 0), rome()));
        // 19:00Z = 20:00 Rome: closing edge is outside.
        assert!(!is_within_operating_hours(utc(2025, 1, 10, 19, 0), rome()));
        // 07:30Z = 08:30 Rome is inside operating but outside retry hours.
        assert!(is_within_operating_hours(utc(2025, 1, 10, 7, 30), rome()));
        assert!(!is_within_retry_hours(utc(2025, 1, 10, 7, 30), rome()));
    }

    #[test]
    fn business_day_skips_weekend() {
        // Friday 2025-03-14 -> Monday 2025-03-17 00:00 Rome = Sunday 23:00Z.
        let t = utc(2025, 3, 14, 10, 0);
        assert_eq!(next_business_day(t, rome()), utc(2025, 3, 16, 23, 0));
    }

    #[test]
    fn unknown_zone_is_rejected() {
        assert!(parse_zone("Mars/Olympus").is_err());
    }
}
