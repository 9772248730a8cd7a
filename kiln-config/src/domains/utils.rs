//! Durations in configuration files
//!
//! Timeouts are written back as whole seconds. When reading, a bare integer
//! is seconds and a string may carry an `s`, `m` or `h` suffix, so
//! `idle_timeout: 15m` and `idle_timeout: 900` mean the same.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Parse `90`, `90s`, `15m` or `1h`
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (amount, unit_seconds) = match value.char_indices().last() {
        Some((index, 's')) => (&value[..index], 1),
        Some((index, 'm')) => (&value[..index], 60),
        Some((index, 'h')) => (&value[..index], 3600),
        _ => (value, 1),
    };

    let amount: u64 = amount
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration '{}', expected seconds or a value like 90s, 15m, 1h", value))?;
    amount
        .checked_mul(unit_seconds)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{}' is too large", value))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Duration, String> {
        match self {
            RawDuration::Seconds(seconds) => Ok(Duration::from_secs(seconds)),
            RawDuration::Text(text) => parse_duration(&text),
        }
    }
}

/// `#[serde(with = ...)]` helper for required durations
pub mod serde_duration {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        RawDuration::deserialize(deserializer)?
            .into_duration()
            .map_err(<D::Error as serde::de::Error>::custom)
    }
}

/// `#[serde(with = ...)]` helper for optional durations such as `call_timeout`
pub mod serde_duration_option {
    use super::*;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<RawDuration>::deserialize(deserializer)?
            .map(RawDuration::into_duration)
            .transpose()
            .map_err(<D::Error as serde::de::Error>::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("42").unwrap(), Duration::from_secs(42));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration(" 1h ").unwrap(), Duration::from_secs(3600));

        assert!(parse_duration("ten minutes").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration(&format!("{}h", u64::MAX)).is_err());
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Timeouts {
        #[serde(with = "serde_duration")]
        idle: Duration,
        #[serde(with = "serde_duration_option", default)]
        call: Option<Duration>,
    }

    #[test]
    fn test_yaml_accepts_seconds_and_units() {
        let timeouts: Timeouts = serde_yaml::from_str("idle: 15m\ncall: 600\n").unwrap();
        assert_eq!(timeouts.idle, Duration::from_secs(900));
        assert_eq!(timeouts.call, Some(Duration::from_secs(600)));

        let timeouts: Timeouts = serde_yaml::from_str("idle: 30\n").unwrap();
        assert_eq!(timeouts.call, None);

        // Written back as plain seconds
        let yaml = serde_yaml::to_string(&Timeouts {
            idle: Duration::from_secs(900),
            call: None,
        })
        .unwrap();
        assert!(yaml.contains("idle: 900"));

        let err = serde_yaml::from_str::<Timeouts>("idle: soon\n").unwrap_err();
        assert!(err.to_string().contains("invalid duration"));
    }
}
