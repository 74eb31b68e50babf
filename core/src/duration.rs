//! Scalar duration parsing for the handful of human-readable interval
//! fields that cross the JSON/YAML boundary (`scan_interval`, `interval`,
//! `timeout`). Internally everything is a `std::time::Duration`; only the
//! wire form is a string like `"10s"`, `"5m"`, `"1h"`.

use std::time::Duration;

use crate::error::StoreError;

pub fn parse(input: &str) -> Result<Duration, StoreError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(StoreError::invalid("empty duration"));
    }
    let (digits, suffix) = input.split_at(
        input
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(input.len()),
    );
    let value: f64 = digits
        .parse()
        .map_err(|_| StoreError::invalid(format!("bad duration: {input}")))?;
    let secs = match suffix {
        "s" | "" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(StoreError::invalid(format!("unknown duration suffix: {other}"))),
    };
    if secs < 0.0 || !secs.is_finite() {
        return Err(StoreError::invalid(format!("bad duration: {input}")));
    }
    Ok(Duration::from_secs_f64(secs))
}

pub fn format(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs >= 3600.0 && secs % 3600.0 == 0.0 {
        format!("{}h", (secs / 3600.0) as u64)
    } else if secs >= 60.0 && secs % 60.0 == 0.0 {
        format!("{}m", (secs / 60.0) as u64)
    } else if secs.fract() == 0.0 {
        format!("{}s", secs as u64)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds_minutes_hours() {
        assert_eq!(parse("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse("30").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("abc").is_err());
        assert!(parse("-5s").is_err());
        assert!(parse("5x").is_err());
    }

    #[test]
    fn formats_round_trip() {
        assert_eq!(format(Duration::from_secs(10)), "10s");
        assert_eq!(format(Duration::from_secs(300)), "5m");
        assert_eq!(format(Duration::from_secs(3600)), "1h");
    }
}
