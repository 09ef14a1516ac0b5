//! Parsing and formatting for human duration values (e.g. "250ms", "2s", "5m").

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use std::str::FromStr;
use std::time::Duration;

use crate::{DelegError, DelegResult};

/// A duration written the way people type it in config files and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanDuration(pub Duration);

impl FromStr for HumanDuration {
    type Err = DelegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(Self)
    }
}

impl std::fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_duration(self.0))
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(self.0))
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

pub fn parse_duration(input: &str) -> DelegResult<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DelegError::InvalidArgument("empty duration".to_string()));
    }

    let (num_part, unit_part) = split_num_unit(s)?;
    let value: u64 = num_part.parse().map_err(|_| {
        DelegError::InvalidArgument(format!(
            "invalid duration number: {num_part} (from {input:?})"
        ))
    })?;

    let dur = match unit_part {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        _ => {
            return Err(DelegError::InvalidArgument(format!(
                "invalid duration unit {unit_part:?} (expected ms|s|m)"
            )));
        }
    };

    Ok(dur)
}

/// Renders the coarsest unit that represents `d` exactly.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis().min(u128::from(u64::MAX)) as u64;
    if ms != 0 && ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

fn split_num_unit(s: &str) -> DelegResult<(&str, &str)> {
    let idx = s
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    if idx == 0 {
        return Err(DelegError::InvalidArgument(format!(
            "invalid duration {s:?} (missing number)"
        )));
    }

    if idx >= s.len() {
        return Err(DelegError::InvalidArgument(format!(
            "invalid duration {s:?} (missing unit; expected ms|s|m)"
        )));
    }

    Ok((&s[..idx], &s[idx..]))
}
