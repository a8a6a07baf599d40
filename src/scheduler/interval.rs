//! `EVERY <n> <unit>` parsing and next-run arithmetic

use crate::error::{Error, Result};
use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;

/// Parse `"1 day"`, `"30 minutes"`, `"2h"`, `"hour"` and the like
pub fn parse_interval(text: &str) -> Result<TimeDelta> {
    let lowered = text.to_lowercase();
    let re = Regex::new(r"^\s*(?:every\s+)?(\d+)?\s*([a-z]+)\s*$")
        .map_err(|e| Error::Other(e.to_string()))?;
    let caps = re
        .captures(&lowered)
        .ok_or_else(|| Error::Config(format!("invalid interval '{}'", text)))?;
    let count: i64 = match caps.get(1) {
        Some(n) => n
            .as_str()
            .parse()
            .map_err(|_| Error::Config(format!("invalid interval '{}'", text)))?,
        None => 1,
    };
    if count <= 0 {
        return Err(Error::Config(format!("interval must be positive: '{}'", text)));
    }
    let unit = &caps[2];
    let delta = match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => TimeDelta::try_seconds(count),
        "m" | "min" | "mins" | "minute" | "minutes" => TimeDelta::try_minutes(count),
        "h" | "hr" | "hrs" | "hour" | "hours" => TimeDelta::try_hours(count),
        "d" | "day" | "days" => TimeDelta::try_days(count),
        "w" | "week" | "weeks" => TimeDelta::try_weeks(count),
        _ => return Err(Error::Config(format!("unknown interval unit '{}'", unit))),
    };
    delta.ok_or_else(|| Error::Config(format!("interval out of range: '{}'", text)))
}

/// First slot on the `scheduled + k * interval` grid strictly after `now`
pub fn next_run_after(scheduled: DateTime<Utc>, interval: TimeDelta, now: DateTime<Utc>) -> DateTime<Utc> {
    if scheduled > now {
        return scheduled;
    }
    let step = interval.num_milliseconds().max(1);
    let behind = (now - scheduled).num_milliseconds();
    let slots = behind / step + 1;
    scheduled + TimeDelta::milliseconds(step.saturating_mul(slots))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interval_forms() {
        assert_eq!(parse_interval("1 day").unwrap(), TimeDelta::days(1));
        assert_eq!(parse_interval("30 minutes").unwrap(), TimeDelta::minutes(30));
        assert_eq!(parse_interval("2h").unwrap(), TimeDelta::hours(2));
        assert_eq!(parse_interval("EVERY 1 week").unwrap(), TimeDelta::weeks(1));
        assert_eq!(parse_interval("hour").unwrap(), TimeDelta::hours(1));
        assert!(parse_interval("0 days").is_err());
        assert!(parse_interval("3 fortnights").is_err());
        assert!(parse_interval("").is_err());
    }

    #[test]
    fn test_next_run_skips_missed_slots() {
        let start = Utc::now();
        let hour = TimeDelta::hours(1);
        assert_eq!(next_run_after(start, hour, start), start + hour);
        assert_eq!(
            next_run_after(start, hour, start + TimeDelta::minutes(150)),
            start + TimeDelta::hours(3)
        );
        let future = start + TimeDelta::days(1);
        assert_eq!(next_run_after(future, hour, start), future);
    }
}
