//! Deterministic resolution of free-text time expressions.
//!
//! Two ordered rule tables, evaluated first-match-wins:
//! - day rules: "tomorrow" → +1 day, "next week" → +7 days, "today" →
//!   current day (all count as an explicit day mention)
//! - clock rules, in priority order: `H(:MM)? pm`, `H(:MM)? am`, then
//!   bare 24-hour `HH:MM`
//!
//! When no clock time matches, a day keyword defaults the clock to
//! 09:00; with neither, the expression resolves to one hour from now.
//! Pure over an injected `now`, so every rule is unit-testable away from
//! the executor.

use std::sync::LazyLock;

use chrono::{Days, NaiveDateTime, NaiveTime, TimeDelta};
use regex::{Captures, Regex};

/// Default clock time applied when a day keyword resolved the day but no
/// clock pattern matched.
const DEFAULT_CLOCK: (u32, u32) = (9, 0);

struct DayRule {
    keyword: &'static str,
    offset_days: u64,
}

/// Evaluated in order; first keyword found in the text wins.
const DAY_RULES: &[DayRule] = &[
    DayRule {
        keyword: "tomorrow",
        offset_days: 1,
    },
    DayRule {
        keyword: "next week",
        offset_days: 7,
    },
    DayRule {
        keyword: "today",
        offset_days: 0,
    },
];

struct ClockRule {
    pattern: Regex,
    resolve: fn(&Captures<'_>) -> Option<NaiveTime>,
}

static CLOCK_RULES: LazyLock<Vec<ClockRule>> = LazyLock::new(|| {
    vec![
        ClockRule {
            pattern: Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*pm\b").expect("static pattern"),
            resolve: resolve_pm,
        },
        ClockRule {
            pattern: Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*am\b").expect("static pattern"),
            resolve: resolve_am,
        },
        ClockRule {
            pattern: Regex::new(r"\b([01]?\d|2[0-3]):([0-5]\d)\b").expect("static pattern"),
            resolve: resolve_24h,
        },
    ]
});

fn capture_u32(caps: &Captures<'_>, index: usize) -> Option<u32> {
    caps.get(index).and_then(|m| m.as_str().parse().ok())
}

fn resolve_pm(caps: &Captures<'_>) -> Option<NaiveTime> {
    let hour = capture_u32(caps, 1)?;
    let minute = capture_u32(caps, 2).unwrap_or(0);
    if !(1..=12).contains(&hour) {
        return None;
    }
    // 12pm is noon, not midnight.
    let hour24 = if hour == 12 { 12 } else { hour.saturating_add(12) };
    NaiveTime::from_hms_opt(hour24, minute, 0)
}

fn resolve_am(caps: &Captures<'_>) -> Option<NaiveTime> {
    let hour = capture_u32(caps, 1)?;
    let minute = capture_u32(caps, 2).unwrap_or(0);
    if !(1..=12).contains(&hour) {
        return None;
    }
    // 12am is midnight.
    let hour24 = if hour == 12 { 0 } else { hour };
    NaiveTime::from_hms_opt(hour24, minute, 0)
}

fn resolve_24h(caps: &Captures<'_>) -> Option<NaiveTime> {
    let hour = capture_u32(caps, 1)?;
    let minute = capture_u32(caps, 2)?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Whether `text` mentions a resolvable time: a day keyword or any clock
/// pattern.
pub fn mentions_time(text: &str) -> bool {
    let lower = text.to_lowercase();
    DAY_RULES.iter().any(|r| lower.contains(r.keyword))
        || CLOCK_RULES.iter().any(|r| r.pattern.is_match(&lower))
}

/// Resolve a free-text time expression against `now`.
///
/// Never fails: an expression with no recognizable pattern resolves to
/// one hour from now.
pub fn resolve(expression: &str, now: NaiveDateTime) -> NaiveDateTime {
    let lower = expression.to_lowercase();

    let day_rule = DAY_RULES.iter().find(|r| lower.contains(r.keyword));
    let clock = CLOCK_RULES
        .iter()
        .find_map(|rule| rule.pattern.captures(&lower).and_then(|c| (rule.resolve)(&c)));

    let day = now
        .date()
        .checked_add_days(Days::new(day_rule.map_or(0, |r| r.offset_days)))
        .unwrap_or_else(|| now.date());

    match (clock, day_rule) {
        (Some(time), _) => day.and_time(time),
        (None, Some(_)) => {
            let (h, m) = DEFAULT_CLOCK;
            day.and_time(NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default())
        }
        (None, None) => now
            .checked_add_signed(TimeDelta::hours(1))
            .unwrap_or(now),
    }
}
