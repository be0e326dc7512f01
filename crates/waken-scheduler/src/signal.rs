//! Parsing of free-text reset announcements.
//!
//! The input is expected to contain a 12-hour clock time followed by a
//! parenthesised IANA timezone, e.g. `"limit reached, resets at 2:30pm
//! (Asia/Calcutta)"`. The result is the next future occurrence of that wall
//! clock time in that zone, as a UTC instant.

use std::sync::LazyLock;

use chrono::{DateTime, Days, LocalResult, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use thiserror::Error;

static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*([ap])\.?\s*m\b\.?").expect("valid time regex")
});

static ZONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\s*([A-Za-z][A-Za-z0-9_+\-]*(?:/[A-Za-z0-9_+\-]+)*)\s*\)")
        .expect("valid zone regex")
});

/// Why a reset announcement could not be turned into a wake instant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no 12-hour time with am/pm found")]
    NoTime,

    #[error("invalid clock time {0:?}")]
    InvalidClock(String),

    #[error("no parenthesised timezone after the time")]
    NoTimezone,

    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),

    #[error("{time} on {date} is ambiguous in {zone} (daylight saving transition)")]
    Ambiguous {
        time: String,
        date: String,
        zone: String,
    },

    #[error("{time} on {date} does not exist in {zone} (daylight saving transition)")]
    Nonexistent {
        time: String,
        date: String,
        zone: String,
    },
}

/// A parsed announcement before it is anchored to a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSignal {
    pub time: NaiveTime,
    pub zone: Tz,
}

/// Extract the local time and zone from `text`.
pub fn parse_signal(text: &str) -> Result<ResetSignal, ParseError> {
    let caps = TIME_RE.captures(text).ok_or(ParseError::NoTime)?;
    let whole = caps.get(0).map_or("", |m| m.as_str());
    let end = caps.get(0).map_or(0, |m| m.end());

    let hour: u32 = caps[1]
        .parse()
        .map_err(|_| ParseError::InvalidClock(whole.to_string()))?;
    let minute: u32 = match caps.get(2) {
        Some(m) => m
            .as_str()
            .parse()
            .map_err(|_| ParseError::InvalidClock(whole.to_string()))?,
        None => 0,
    };
    if !(1..=12).contains(&hour) || minute > 59 {
        return Err(ParseError::InvalidClock(whole.to_string()));
    }
    let pm = caps[3].eq_ignore_ascii_case("p");
    let hour24 = hour % 12 + if pm { 12 } else { 0 };
    let time = NaiveTime::from_hms_opt(hour24, minute, 0)
        .ok_or_else(|| ParseError::InvalidClock(whole.to_string()))?;

    let zone_name = ZONE_RE
        .captures(&text[end..])
        .map(|c| c[1].to_string())
        .ok_or(ParseError::NoTimezone)?;
    let zone: Tz = zone_name
        .parse()
        .map_err(|_| ParseError::UnknownTimezone(zone_name.clone()))?;

    Ok(ResetSignal { time, zone })
}

/// Wake instant for `text` relative to the current time.
pub fn parse(text: &str) -> Result<DateTime<Utc>, ParseError> {
    parse_at(text, Utc::now())
}

/// Wake instant for `text` relative to `now`.
pub fn parse_at(text: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, ParseError> {
    parse_signal(text)?.next_occurrence(now)
}

impl ResetSignal {
    /// The first instant strictly after `now` at which the wall clock in
    /// `zone` reads `time`.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ParseError> {
        let local_now = now.with_timezone(&self.zone);
        let today = local_now.date_naive();
        let naive = today.and_time(self.time);

        match self.zone.from_local_datetime(&naive) {
            LocalResult::Single(dt) => {
                let utc = dt.with_timezone(&Utc);
                if utc > now {
                    return Ok(utc);
                }
            }
            // Both readings already passed: the next occurrence is tomorrow.
            LocalResult::Ambiguous(_, latest) if latest.with_timezone(&Utc) <= now => {}
            LocalResult::Ambiguous(..) => return Err(self.ambiguous(today)),
            LocalResult::None if naive <= local_now.naive_local() => {}
            LocalResult::None => return Err(self.nonexistent(today)),
        }

        let tomorrow = today
            .checked_add_days(Days::new(1))
            .ok_or_else(|| ParseError::InvalidClock(self.time.to_string()))?;
        match self.zone.from_local_datetime(&tomorrow.and_time(self.time)) {
            LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(..) => Err(self.ambiguous(tomorrow)),
            LocalResult::None => Err(self.nonexistent(tomorrow)),
        }
    }

    fn ambiguous(&self, date: chrono::NaiveDate) -> ParseError {
        ParseError::Ambiguous {
            time: self.time.format("%H:%M").to_string(),
            date: date.to_string(),
            zone: self.zone.name().to_string(),
        }
    }

    fn nonexistent(&self, date: chrono::NaiveDate) -> ParseError {
        ParseError::Nonexistent {
            time: self.time.format("%H:%M").to_string(),
            date: date.to_string(),
            zone: self.zone.name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Timelike};
    use proptest::prelude::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_same_day_when_still_future() {
        // 06:00 UTC is 11:30 in Kolkata.
        let now = utc(2026, 10, 19, 6, 0);
        let wake = parse_at("You've hit your limit · resets at 2:30pm (Asia/Calcutta)", now).unwrap();
        assert_eq!(wake, utc(2026, 10, 19, 9, 0));
    }

    #[test]
    fn test_next_day_when_already_past() {
        // 10:00 UTC is 15:30 in Kolkata.
        let now = utc(2026, 10, 19, 10, 0);
        let wake = parse_at("reset at 2:30pm (Asia/Calcutta)", now).unwrap();
        assert_eq!(wake, utc(2026, 10, 20, 9, 0));
    }

    #[test]
    fn test_exactly_now_rolls_to_tomorrow() {
        let now = utc(2026, 10, 19, 9, 0);
        let wake = parse_at("reset at 2:30pm (Asia/Calcutta)", now).unwrap();
        assert_eq!(wake, utc(2026, 10, 20, 9, 0));
    }

    #[test]
    fn test_twelve_am_and_pm() {
        let signal = parse_signal("resets 12am (UTC)").unwrap();
        assert_eq!(signal.time, NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        let signal = parse_signal("resets 12:15 PM (UTC)").unwrap();
        assert_eq!(signal.time, NaiveTime::from_hms_opt(12, 15, 0).unwrap());
    }

    #[test]
    fn test_loose_am_pm_forms() {
        for text in ["at 3pm (Europe/London)", "at 3 p.m. (Europe/London)", "at 3:00PM (Europe/London)"] {
            let signal = parse_signal(text).unwrap();
            assert_eq!(signal.time.hour(), 15, "{text}");
            assert_eq!(signal.zone, chrono_tz::Europe::London);
        }
    }

    #[test]
    fn test_missing_pieces() {
        assert_eq!(parse_signal("no time here"), Err(ParseError::NoTime));
        assert_eq!(parse_signal("reset at 14:30 (UTC)"), Err(ParseError::NoTime));
        assert_eq!(parse_signal("reset at 2:30pm"), Err(ParseError::NoTimezone));
        assert_eq!(parse_signal("(UTC) reset at 2:30pm"), Err(ParseError::NoTimezone));
        assert!(matches!(parse_signal("reset at 13:30pm (UTC)"), Err(ParseError::InvalidClock(_))));
        assert!(matches!(parse_signal("reset at 2:75pm (UTC)"), Err(ParseError::InvalidClock(_))));
        assert!(matches!(parse_signal("reset at 0am (UTC)"), Err(ParseError::InvalidClock(_))));
    }

    #[test]
    fn test_unknown_timezone() {
        assert_eq!(
            parse_signal("reset at 2pm (Mars/Olympus_Mons)"),
            Err(ParseError::UnknownTimezone("Mars/Olympus_Mons".to_string()))
        );
    }

    #[test]
    fn test_ambiguous_fall_back_is_rejected() {
        // 2026-11-01 01:30 happens twice in New York.
        let now = utc(2026, 10, 31, 23, 0);
        assert!(matches!(
            parse_at("reset at 1:30am (America/New_York)", now),
            Err(ParseError::Ambiguous { .. })
        ));
    }

    #[test]
    fn test_spring_forward_gap_is_rejected() {
        // 2026-03-08 02:30 does not exist in New York.
        let now = utc(2026, 3, 8, 4, 0);
        assert!(matches!(
            parse_at("reset at 2:30am (America/New_York)", now),
            Err(ParseError::Nonexistent { .. })
        ));
    }

    #[test]
    fn test_past_ambiguous_today_uses_unambiguous_tomorrow() {
        // 2026-11-01 12:00 UTC: both 01:30 readings have passed.
        let now = utc(2026, 11, 1, 12, 0);
        let wake = parse_at("reset at 1:30am (America/New_York)", now).unwrap();
        assert_eq!(wake, utc(2026, 11, 2, 6, 30));
    }

    proptest! {
        #[test]
        fn kolkata_wall_clock_matches(
            hour in 1u32..=12,
            minute in 0u32..60,
            pm in any::<bool>(),
            offset_mins in 0i64..(60 * 24 * 365),
        ) {
            let now = utc(2026, 1, 1, 0, 0) + Duration::minutes(offset_mins);
            let text = format!(
                "limit hit, reset at {}:{:02}{} (Asia/Calcutta) - retry later",
                hour, minute, if pm { "pm" } else { "am" }
            );
            let wake = parse_at(&text, now).unwrap();
            let local = wake.with_timezone(&chrono_tz::Asia::Kolkata);

            let expected_hour = hour % 12 + if pm { 12 } else { 0 };
            prop_assert_eq!(local.hour(), expected_hour);
            prop_assert_eq!(local.minute(), minute);
            prop_assert!(wake > now);
            prop_assert!(wake - now <= Duration::days(1));

            let today = now.with_timezone(&chrono_tz::Asia::Kolkata).date_naive();
            let today_candidate = today.and_hms_opt(expected_hour, minute, 0).unwrap();
            let expected_date = if chrono_tz::Asia::Kolkata
                .from_local_datetime(&today_candidate)
                .single()
                .unwrap()
                .with_timezone(&Utc) > now
            {
                today
            } else {
                today.succ_opt().unwrap()
            };
            prop_assert_eq!(local.date_naive(), expected_date);
        }

        #[test]
        fn text_without_time_and_zone_fails(text in "[a-zA-Z ,.!]{0,80}") {
            prop_assert!(parse_signal(&text).is_err());
        }
    }
}
