// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Shared helpers for date/time formatting and calendar days.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use chrono_tz::Tz;

/// Format a UTC timestamp as RFC3339 using a `Z` suffix.
pub fn format_utc_rfc3339(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Resolve a user's IANA time zone, falling back to the platform default
/// when the name is missing or unknown.
pub fn resolve_time_zone(name: Option<&str>, fallback: Tz) -> Tz {
    name.and_then(|n| n.parse::<Tz>().ok()).unwrap_or(fallback)
}

/// Calendar day of `instant` as seen in `tz`.
pub fn local_day(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_local_day_crosses_midnight() {
        // 23:30 UTC is already the next day in Budapest (UTC+1 in winter).
        let instant = Utc.with_ymd_and_hms(2026, 1, 14, 23, 30, 0).unwrap();
        assert_eq!(
            local_day(instant, chrono_tz::Europe::Budapest),
            NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()
        );
        assert_eq!(
            local_day(instant, chrono_tz::UTC),
            NaiveDate::from_ymd_opt(2026, 1, 14).unwrap()
        );
    }

    #[test]
    fn test_resolve_time_zone_fallback() {
        let fallback = chrono_tz::Europe::Budapest;
        assert_eq!(resolve_time_zone(None, fallback), fallback);
        assert_eq!(resolve_time_zone(Some("Mars/Olympus"), fallback), fallback);
        assert_eq!(
            resolve_time_zone(Some("America/New_York"), fallback),
            chrono_tz::America::New_York
        );
    }

    #[test]
    fn test_format_utc_rfc3339() {
        let instant = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(format_utc_rfc3339(instant), "2026-03-01T08:00:00Z");
    }
}
