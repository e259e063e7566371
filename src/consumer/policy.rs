//! Start policy tokens and relative duration strings

use crate::consumer::config::DeliverPolicy;
use crate::error::{ConsumerError, ConsumerResult};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

const HOUR: f64 = 3600.0;

static SEQUENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("valid regex"));

/// Calendar style durations: `2w`, `1.5d`, `3M`, `1y`
static CALENDAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+(?:\.\d*)?|\.\d+)([wWdDMyY])$").expect("valid regex"));

/// One component of a clock style duration such as `1h30m`
static CLOCK_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d*)?|\.\d+)(ns|us|µs|ms|s|m|h)").expect("valid regex"));

static CLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?:\d+(?:\.\d*)?|\.\d+)(?:ns|us|µs|ms|s|m|h))+$").expect("valid regex")
});

/// Parse a duration such as `90s`, `1h30m`, `2d`, `1w`, `3M` or `1y`
///
/// Months are 30 days and years 365 days.
pub fn parse_duration(input: &str) -> ConsumerResult<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ConsumerError::input("empty duration"));
    }

    if let Some(caps) = CALENDAR.captures(s) {
        let value: f64 = caps[1]
            .parse()
            .map_err(|_| ConsumerError::input(format!("invalid duration '{}'", input)))?;
        let hours = match &caps[2] {
            "w" | "W" => 7.0 * 24.0,
            "d" | "D" => 24.0,
            "M" => 30.0 * 24.0,
            _ => 365.0 * 24.0,
        };
        return seconds(value * hours * HOUR, input);
    }

    if !CLOCK.is_match(s) {
        return Err(ConsumerError::input(format!("invalid duration '{}'", input)));
    }

    let mut total = 0.0;
    for caps in CLOCK_PART.captures_iter(s) {
        let value: f64 = caps[1]
            .parse()
            .map_err(|_| ConsumerError::input(format!("invalid duration '{}'", input)))?;
        let scale = match &caps[2] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            _ => HOUR,
        };
        total += value * scale;
    }

    seconds(total, input)
}

fn seconds(secs: f64, input: &str) -> ConsumerResult<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| ConsumerError::input(format!("duration '{}' is out of range", input)))
}

/// Turn a start policy token into a deliver policy
///
/// Accepts `all`, `last`, `new` or `next`, a stream sequence, or a duration
/// that is subtracted from `now`.
pub fn parse_start_policy(token: &str, now: DateTime<Utc>) -> ConsumerResult<DeliverPolicy> {
    let token = token.trim();

    match token.to_lowercase().as_str() {
        "all" => return Ok(DeliverPolicy::All),
        "last" => return Ok(DeliverPolicy::Last),
        "new" | "next" => return Ok(DeliverPolicy::New),
        _ => {}
    }

    if SEQUENCE.is_match(token) {
        let seq = token
            .parse::<u64>()
            .map_err(|_| ConsumerError::input(format!("start sequence '{}' is out of range", token)))?;
        return Ok(DeliverPolicy::ByStartSequence(seq));
    }

    let delta = parse_duration(token).map_err(|e| {
        ConsumerError::input(format!("could not parse starting delta '{}': {}", token, e))
    })?;
    let delta = chrono::Duration::from_std(delta)
        .map_err(|_| ConsumerError::input(format!("starting delta '{}' is out of range", token)))?;
    let start = now
        .checked_sub_signed(delta)
        .ok_or_else(|| ConsumerError::input(format!("starting delta '{}' is out of range", token)))?;

    Ok(DeliverPolicy::ByStartTime(start))
}
