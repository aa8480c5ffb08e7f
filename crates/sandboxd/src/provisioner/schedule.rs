//! Interval strings to cron schedules.

use std::time::Duration;

pub const DEFAULT_SCHEDULE: &str = "*/10 * * * *";

/// Parse a duration such as `90s`, `10m`, `1h30m` or `1.5h`.
///
/// Units: `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`. A bare `0` is zero. Negative
/// durations are rejected.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let s = raw.trim();
    if s == "0" {
        return Some(Duration::ZERO);
    }
    if s.is_empty() || s.starts_with('-') {
        return None;
    }
    let mut rest = s.strip_prefix('+').unwrap_or(s);
    if rest.is_empty() {
        return None;
    }

    let mut total_nanos: f64 = 0.0;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        rest = &rest[unit_end..];
        total_nanos += value * nanos_per_unit;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(total_nanos as u64))
}

/// Translate an interval into a cron schedule.
///
/// | interval | schedule |
/// |---|---|
/// | invalid or < 1m | `*/10 * * * *` |
/// | < 60m | `*/{minutes} * * * *` |
/// | < 24h | `0 */{hours} * * *` |
/// | otherwise | `0 0 * * *` |
pub fn interval_to_cron(interval: &str) -> String {
    let Some(duration) = parse_duration(interval) else {
        return DEFAULT_SCHEDULE.to_string();
    };
    let minutes = duration.as_secs() / 60;
    if minutes == 0 {
        return DEFAULT_SCHEDULE.to_string();
    }
    if minutes < 60 {
        return format!("*/{minutes} * * * *");
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("0 */{hours} * * *");
    }
    "0 0 * * *".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("1.5h"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("-5m"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn cron_translation_table() {
        let cases = [
            ("10m", "*/10 * * * *"),
            ("1m", "*/1 * * * *"),
            ("59m", "*/59 * * * *"),
            ("90m", "0 */1 * * *"),
            ("2h", "0 */2 * * *"),
            ("25h", "0 0 * * *"),
            ("30s", DEFAULT_SCHEDULE),
            ("invalid", DEFAULT_SCHEDULE),
            ("", DEFAULT_SCHEDULE),
        ];
        for (interval, expected) in cases {
            assert_eq!(interval_to_cron(interval), expected, "interval {interval}");
        }
    }
}
