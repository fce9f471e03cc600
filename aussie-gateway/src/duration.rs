//! ISO-8601 duration fields for configuration
//!
//! Configuration durations accept either an ISO-8601 duration string
//! (`PT30S`, `PT5M`, `PT24H`, `P1D`) or a bare integer number of seconds.
//! Serialization always emits the ISO form.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// A configuration duration with ISO-8601 serde support
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigDuration(Duration);

impl ConfigDuration {
    /// Construct from a whole number of seconds
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// The wrapped duration
    pub const fn duration(&self) -> Duration {
        self.0
    }

    /// Whole seconds
    pub const fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }
}

impl From<Duration> for ConfigDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl From<ConfigDuration> for Duration {
    fn from(d: ConfigDuration) -> Self {
        d.0
    }
}

impl fmt::Display for ConfigDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_iso8601(self.0))
    }
}

/// Parse an ISO-8601 duration of the `PnDTnHnMnS` family
///
/// Only the designators that make sense for gateway configuration are
/// accepted: days, hours, minutes, and whole seconds. Years, months,
/// weeks, fractional components, and negative durations are rejected.
pub fn parse_iso8601(input: &str) -> std::result::Result<Duration, String> {
    let s = input.trim();
    let rest = s
        .strip_prefix('P')
        .ok_or_else(|| format!("duration '{}' must start with 'P'", input))?;
    if rest.is_empty() {
        return Err(format!("duration '{}' has no components", input));
    }

    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };
    if let Some(t) = time_part {
        if t.is_empty() {
            return Err(format!("duration '{}' has an empty time part", input));
        }
    }

    let mut total: u64 = 0;
    let mut matched = false;

    let mut consume = |part: &str, designators: &[(char, u64)]| -> std::result::Result<(), String> {
        let mut digits = String::new();
        let mut allowed = designators;
        for c in part.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let pos = allowed
                .iter()
                .position(|(d, _)| *d == c)
                .ok_or_else(|| format!("unexpected designator '{}' in duration '{}'", c, input))?;
            if digits.is_empty() {
                return Err(format!("missing value before '{}' in duration '{}'", c, input));
            }
            let value: u64 = digits
                .parse()
                .map_err(|_| format!("invalid number in duration '{}'", input))?;
            let scale = allowed[pos].1;
            total = total
                .checked_add(value.checked_mul(scale).ok_or("duration overflow")?)
                .ok_or("duration overflow")?;
            digits.clear();
            matched = true;
            // Designators must appear in order, each at most once
            allowed = &allowed[pos + 1..];
        }
        if !digits.is_empty() {
            return Err(format!("trailing digits in duration '{}'", input));
        }
        Ok(())
    };

    consume(date_part, &[('D', 86_400)])?;
    if let Some(t) = time_part {
        consume(t, &[('H', 3_600), ('M', 60), ('S', 1)])?;
    }

    if !matched {
        return Err(format!("duration '{}' has no components", input));
    }
    Ok(Duration::from_secs(total))
}

/// Format a duration as an ISO-8601 string
pub fn format_iso8601(d: Duration) -> String {
    let mut secs = d.as_secs();
    if secs == 0 {
        return "PT0S".to_string();
    }

    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3_600;
    secs %= 3_600;
    let minutes = secs / 60;
    secs %= 60;

    let mut out = String::from("P");
    if days > 0 {
        out.push_str(&format!("{}D", days));
    }
    if hours > 0 || minutes > 0 || secs > 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{}H", hours));
        }
        if minutes > 0 {
            out.push_str(&format!("{}M", minutes));
        }
        if secs > 0 {
            out.push_str(&format!("{}S", secs));
        }
    }
    out
}

impl Serialize for ConfigDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_iso8601(self.0))
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = ConfigDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an ISO-8601 duration string or a number of seconds")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
                Ok(ConfigDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
                if v < 0 {
                    return Err(E::custom("duration must not be negative"));
                }
                Ok(ConfigDuration(Duration::from_secs(v as u64)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                parse_iso8601(v).map(ConfigDuration).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_designators() {
        assert_eq!(parse_iso8601("PT30S").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_iso8601("PT5M").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_iso8601("PT24H").unwrap(), Duration::from_secs(86_400));
        assert_eq!(
            parse_iso8601("PT1H30M").unwrap(),
            Duration::from_secs(5_400)
        );
    }

    #[test]
    fn test_parse_days() {
        assert_eq!(parse_iso8601("P1D").unwrap(), Duration::from_secs(86_400));
        assert_eq!(
            parse_iso8601("P1DT12H").unwrap(),
            Duration::from_secs(129_600)
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_iso8601("").is_err());
        assert!(parse_iso8601("P").is_err());
        assert!(parse_iso8601("PT").is_err());
        assert!(parse_iso8601("5M").is_err());
        assert!(parse_iso8601("PT5X").is_err());
        assert!(parse_iso8601("PTM").is_err());
        // Out-of-order designators
        assert!(parse_iso8601("PT5M1H").is_err());
    }

    #[test]
    fn test_format_round_trip() {
        for secs in [0, 1, 59, 60, 3_600, 5_400, 86_400, 129_661] {
            let formatted = format_iso8601(Duration::from_secs(secs));
            assert_eq!(
                parse_iso8601(&formatted).unwrap(),
                Duration::from_secs(secs),
                "round-trip failed for {}",
                formatted
            );
        }
        assert_eq!(format_iso8601(Duration::from_secs(300)), "PT5M");
        assert_eq!(format_iso8601(Duration::from_secs(86_400)), "P1D");
    }

    #[test]
    fn test_deserialize_from_secs_and_string() {
        #[derive(Deserialize)]
        struct Wrapper {
            ttl: ConfigDuration,
        }

        let w: Wrapper = serde_json::from_str(r#"{"ttl": 30}"#).unwrap();
        assert_eq!(w.ttl.as_secs(), 30);

        let w: Wrapper = serde_json::from_str(r#"{"ttl": "PT5M"}"#).unwrap();
        assert_eq!(w.ttl.as_secs(), 300);

        assert!(serde_json::from_str::<Wrapper>(r#"{"ttl": "5 minutes"}"#).is_err());
    }
}
