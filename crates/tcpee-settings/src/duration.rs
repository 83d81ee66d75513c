//! Go-style duration strings: `150ms`, `1.5s`, `1h30m`.
//!
//! The keep-alive and timeout keys additionally accept a leading `-`,
//! which maps to [`DurationKnob::Disabled`], and treat a zero value as
//! "use the library default".

use std::time::Duration;

use thiserror::Error;

/// Resolved value of a duration configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurationKnob {
    /// Key absent or zero: the feature uses its default behaviour.
    #[default]
    Default,
    /// Negative value: the feature is switched off.
    Disabled,
    /// Positive value.
    Value(Duration),
}

/// Why a duration string failed to parse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,
    #[error("missing unit in duration")]
    MissingUnit,
    #[error("unknown unit {0:?} in duration")]
    UnknownUnit(String),
    #[error("invalid number {0:?} in duration")]
    BadNumber(String),
    #[error("duration out of range")]
    OutOfRange,
}

/// Parse a non-negative duration such as `300ms`, `1.5s` or `1h30m`.
pub(crate) fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(DurationError::Empty);
    }
    // A bare zero needs no unit.
    if rest == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(DurationError::BadNumber(rest.to_string()));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| DurationError::BadNumber(rest[..number_len].to_string()))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        let scale = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(DurationError::MissingUnit),
            other => return Err(DurationError::UnknownUnit(other.to_string())),
        };
        rest = &rest[unit_len..];

        total += Duration::try_from_secs_f64(value * scale)
            .map_err(|_| DurationError::OutOfRange)?;
    }
    Ok(total)
}

/// Parse a duration key value into its knob form.
pub(crate) fn parse_knob(input: &str) -> Result<DurationKnob, DurationError> {
    let trimmed = input.trim();
    if let Some(magnitude) = trimmed.strip_prefix('-') {
        let value = parse_duration(magnitude)?;
        // "-0s" is still zero.
        if value.is_zero() {
            return Ok(DurationKnob::Default);
        }
        return Ok(DurationKnob::Disabled);
    }
    let value = parse_duration(trimmed)?;
    if value.is_zero() {
        Ok(DurationKnob::Default)
    } else {
        Ok(DurationKnob::Value(value))
    }
}
