//! 时间解析：RFC3339、Unix 时间戳以及 `5m`、`1h`、`24h`、`7d`、`1w` 这类相对时间。

use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::{Result, VlogsError};

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

pub fn parse_time(input: &str) -> Result<DateTime<Utc>> {
    parse_time_at(input, Utc::now())
}

/// Same as [`parse_time`], with relative times resolved against `now`.
pub fn parse_time_at(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() {
        return Err(VlogsError::TimeParseError {
            input: input.to_string(),
        });
    }

    if let Some(d) = parse_relative(s) {
        let err = || VlogsError::TimeParseError {
            input: input.to_string(),
        };
        let d = chrono::Duration::from_std(d).map_err(|_| err())?;
        // offsets past chrono's representable range are rejected, not wrapped
        return now.checked_sub_signed(d).ok_or_else(err);
    }

    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }

    if let Ok(ts) = s.parse::<i64>() {
        if let Some(t) = Utc.timestamp_opt(ts, 0).single() {
            return Ok(t);
        }
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&t));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(t) = d.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&t));
        }
    }

    Err(VlogsError::TimeParseError {
        input: input.to_string(),
    })
}

/// `<digits><unit>` with a single unit out of s/m/h/d/w.
fn parse_relative(s: &str) -> Option<Duration> {
    let unit = s.chars().last()?;
    let digits = &s[..s.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u64 = digits.parse().ok()?;
    let secs = match unit {
        's' => n,
        'm' => n.checked_mul(60)?,
        'h' => n.checked_mul(3600)?,
        'd' => n.checked_mul(86_400)?,
        'w' => n.checked_mul(7 * 86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// 解析配置中的时长字符串，例如 `100ms`、`30s`、`1h30m`、`7d`。
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let err = || VlogsError::ConfigError(format!("invalid duration: {input}"));
    if s.is_empty() {
        return Err(err());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        if num_len == 0 {
            return Err(err());
        }
        let n: u64 = rest[..num_len].parse().map_err(|_| err())?;
        rest = &rest[num_len..];

        let unit_len = rest.bytes().take_while(|b| b.is_ascii_alphabetic()).count();
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ns" => Duration::from_nanos(n),
            "us" => Duration::from_micros(n),
            "ms" => Duration::from_millis(n),
            "s" => Duration::from_secs(n),
            "m" => Duration::from_secs(n.checked_mul(60).ok_or_else(err)?),
            "h" => Duration::from_secs(n.checked_mul(3600).ok_or_else(err)?),
            "d" => Duration::from_secs(n.checked_mul(86_400).ok_or_else(err)?),
            "w" => Duration::from_secs(n.checked_mul(7 * 86_400).ok_or_else(err)?),
            _ => return Err(err()),
        };
        total = total.checked_add(part).ok_or_else(err)?;
    }
    Ok(total)
}
