//! Reminder trigger-time parsing.
//!
//! Accepted forms, each followed by the reminder text:
//! - `in 30 minutes ...`, `in 2 hours ...`, `in 1 day ...`
//! - `at 14:30 ...` (a clock time already past today rolls to tomorrow)
//! - `+30m ...`, `+2h ...`, `+1d ...`, `+1w ...`

use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

fn clock_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,2}):(\d{2})$").unwrap())
}

fn unit_duration(amount: i64, unit: &str) -> Result<Duration, String> {
    match unit {
        "m" | "min" | "mins" | "minute" | "minutes" => Ok(Duration::minutes(amount)),
        "h" | "hr" | "hrs" | "hour" | "hours" => Ok(Duration::hours(amount)),
        "d" | "day" | "days" => Ok(Duration::days(amount)),
        "w" | "week" | "weeks" => Ok(Duration::weeks(amount)),
        _ => Err(format!("Unknown unit '{}'. Use minutes/hours/days/weeks", unit)),
    }
}

/// Parse `input` into a trigger time and the reminder text.
pub fn parse_reminder(
    input: &str,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, String), String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty reminder".to_string());
    }

    let mut tokens = input.split_whitespace();
    let first = tokens.next().unwrap_or_default();

    // "+30m text..."
    if let Some(rest) = first.strip_prefix('+') {
        let unit_start = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if unit_start == 0 || unit_start == rest.len() {
            return Err(format!("Invalid relative time: '{}'", first));
        }
        let amount: i64 = rest[..unit_start]
            .parse()
            .map_err(|_| format!("Invalid number in '{}'", first))?;
        let duration = unit_duration(amount, &rest[unit_start..])?;
        return Ok((now + duration, remaining_text(tokens)));
    }

    match first.to_lowercase().as_str() {
        // "in 30 minutes text..."
        "in" => {
            let amount: i64 = tokens
                .next()
                .ok_or_else(|| "Missing amount after 'in'".to_string())?
                .parse()
                .map_err(|_| "Expected a number after 'in'".to_string())?;
            let unit = tokens
                .next()
                .ok_or_else(|| "Missing unit after the amount".to_string())?
                .to_lowercase();
            let duration = unit_duration(amount, &unit)?;
            Ok((now + duration, remaining_text(tokens)))
        }
        // "at 14:30 text..."
        "at" => {
            let clock = tokens
                .next()
                .ok_or_else(|| "Missing time after 'at'".to_string())?;
            let caps = clock_re()
                .captures(clock)
                .ok_or_else(|| format!("Invalid time '{}'. Use HH:MM", clock))?;
            let hour: u32 = caps[1].parse().unwrap();
            let minute: u32 = caps[2].parse().unwrap();
            if hour > 23 || minute > 59 {
                return Err(format!("Invalid time '{}'. Use HH:MM", clock));
            }

            let mut fire_at = now
                .date_naive()
                .and_hms_opt(hour, minute, 0)
                .expect("validated clock time")
                .and_utc();
            if fire_at <= now {
                fire_at += Duration::days(1);
            }
            Ok((fire_at, remaining_text(tokens)))
        }
        _ => Err(format!(
            "Could not parse '{}'. Use 'in 30 minutes ...', 'at 14:30 ...' or '+30m ...'",
            first
        )),
    }
}

fn remaining_text<'a>(tokens: impl Iterator<Item = &'a str>) -> String {
    let text = tokens.collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        "Reminder".to_string()
    } else {
        text
    }
}
