//! `TimeSpec` grammar for `--since`/`--until` (§6): an absolute ISO
//! datetime, a bare `<float>` of unix seconds, one of the named anchors
//! `now`/`min`/`max` optionally offset by a signed duration, or a bare
//! signed duration (read as an offset from `now`).

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    Now,
    Min,
    Max,
    Absolute(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpec {
    anchor: Anchor,
    delta_ns: i64,
}

impl TimeSpec {
    /// Resolves this spec to unix nanoseconds, given the current time.
    pub fn resolve(&self, now_ns: i64) -> i64 {
        let base = match self.anchor {
            Anchor::Now => now_ns,
            Anchor::Min => i64::MIN / 2,
            Anchor::Max => i64::MAX / 2,
            Anchor::Absolute(ts) => ts,
        };
        base.saturating_add(self.delta_ns)
    }

    pub fn parse(input: &str) -> Result<TimeSpec> {
        let s = input.trim();
        if let Some(rest) = strip_anchor(s, "now") {
            return Ok(TimeSpec {
                anchor: Anchor::Now,
                delta_ns: parse_optional_delta(rest)?,
            });
        }
        if let Some(rest) = strip_anchor(s, "min") {
            return Ok(TimeSpec {
                anchor: Anchor::Min,
                delta_ns: parse_optional_delta(rest)?,
            });
        }
        if let Some(rest) = strip_anchor(s, "max") {
            return Ok(TimeSpec {
                anchor: Anchor::Max,
                delta_ns: parse_optional_delta(rest)?,
            });
        }
        if s.starts_with('+') || s.starts_with('-') {
            return Ok(TimeSpec {
                anchor: Anchor::Now,
                delta_ns: parse_duration_ns(s)?,
            });
        }
        if let Ok(secs) = s.parse::<f64>() {
            return Ok(TimeSpec {
                anchor: Anchor::Absolute((secs * 1_000_000_000.0).round() as i64),
                delta_ns: 0,
            });
        }
        let dt = parse_absolute_datetime(s)?;
        Ok(TimeSpec {
            anchor: Anchor::Absolute(dt.timestamp_nanos_opt().unwrap_or(0)),
            delta_ns: 0,
        })
    }
}

fn strip_anchor<'a>(s: &'a str, name: &str) -> Option<&'a str> {
    if s == name {
        Some("")
    } else {
        s.strip_prefix(name)
            .filter(|rest| rest.starts_with('+') || rest.starts_with('-'))
    }
}

fn parse_optional_delta(rest: &str) -> Result<i64> {
    if rest.is_empty() {
        Ok(0)
    } else {
        parse_duration_ns(rest)
    }
}

fn parse_absolute_datetime(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
    }
    Err(Error::BadHeader {
        inner: format!("not a recognized TimeSpec: {}", s),
    })
}

/// Parses a signed duration like `-5m`, `+200ms`, `-1500000ns`.
fn parse_duration_ns(s: &str) -> Result<i64> {
    let bad = || Error::BadHeader {
        inner: format!("not a recognized duration: {}", s),
    };
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1i64, &s[1..]),
        Some(b'-') => (-1i64, &s[1..]),
        _ => return Err(bad()),
    };
    Ok(sign * parse_duration_magnitude_ns(rest)? as i64)
}

/// Parses the `<number><suffix>` magnitude shared by signed durations
/// (`TimeSpec`'s own grammar) and the unsigned `DUR` token `--timeout`
/// takes on its own (§6 names `--timeout DUR` as distinct from the
/// `--since`/`--until` `TimeSpec` grammar, so it has no leading sign).
fn parse_duration_magnitude_ns(rest: &str) -> Result<u64> {
    let bad = || Error::BadHeader {
        inner: format!("not a recognized duration: {}", rest),
    };
    let suffix_len = ["ns", "us", "ms", "s", "m", "h"]
        .iter()
        .find(|suf| rest.ends_with(**suf))
        .map(|suf| suf.len())
        .ok_or_else(bad)?;
    let (number, suffix) = rest.split_at(rest.len() - suffix_len);
    let value: f64 = number.parse().map_err(|_| bad())?;
    let per_unit_ns: f64 = match suffix {
        "ns" => 1.0,
        "us" => 1_000.0,
        "ms" => 1_000_000.0,
        "s" => 1_000_000_000.0,
        "m" => 60_000_000_000.0,
        "h" => 3_600_000_000_000.0,
        _ => return Err(bad()),
    };
    Ok((value * per_unit_ns).round() as u64)
}

/// Parses the unsigned `DUR` token `--timeout` takes (e.g. `500ms`, `5s`),
/// distinct from the signed `TimeSpec` grammar used by `--since`/`--until`.
pub fn parse_unsigned_duration_ns(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.starts_with('+') || s.starts_with('-') {
        return Err(Error::BadHeader {
            inner: format!("--timeout takes an unsigned duration, got: {}", s),
        });
    }
    parse_duration_magnitude_ns(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_with_no_delta_resolves_to_now() {
        let spec = TimeSpec::parse("now").unwrap();
        assert_eq!(spec.resolve(1_000), 1_000);
    }

    #[test]
    fn now_minus_duration_subtracts() {
        let spec = TimeSpec::parse("now-5s").unwrap();
        assert_eq!(spec.resolve(10_000_000_000), 5_000_000_000);
    }

    #[test]
    fn bare_signed_duration_is_relative_to_now() {
        let spec = TimeSpec::parse("-500ms").unwrap();
        assert_eq!(spec.resolve(1_000_000_000), 500_000_000);
    }

    #[test]
    fn float_is_unix_seconds() {
        let spec = TimeSpec::parse("1700000000.5").unwrap();
        assert_eq!(spec.resolve(0), 1_700_000_000_500_000_000);
    }

    #[test]
    fn min_and_max_are_far_apart_regardless_of_now() {
        let min = TimeSpec::parse("min").unwrap();
        let max = TimeSpec::parse("max").unwrap();
        assert!(min.resolve(123) < max.resolve(123));
    }

    #[test]
    fn rejects_garbage() {
        assert!(TimeSpec::parse("not-a-timespec").is_err());
    }

    #[test]
    fn unsigned_duration_parses_without_a_sign() {
        assert_eq!(parse_unsigned_duration_ns("500ms").unwrap(), 500_000_000);
        assert_eq!(parse_unsigned_duration_ns("5s").unwrap(), 5_000_000_000);
    }

    #[test]
    fn unsigned_duration_rejects_a_leading_sign() {
        assert!(parse_unsigned_duration_ns("+500ms").is_err());
        assert!(parse_unsigned_duration_ns("-500ms").is_err());
    }
}
