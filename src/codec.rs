//! StatsD line decoding.
//!
//! A line is `<key>:<value>|<modifier>[|@<rate>]`. Parse failures are
//! first-class data: every malformed shape maps to a distinct
//! [`ParseError`] variant so the listener can count and tap invalid lines
//! without ever treating them as fatal.

use nom::combinator::all_consuming;
use nom::number::complete::{double, float};
use snafu::Snafu;

use crate::metric::{Metric, MetricKind};

/// A StatsD line that could not be parsed.
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum ParseError {
    /// The line did not contain exactly one `:`.
    #[snafu(display("wrong number of colons"))]
    WrongColonCount,

    /// The key before the `:` was empty.
    #[snafu(display("empty metric key"))]
    EmptyKey,

    /// No `|` separated the value from the modifier.
    #[snafu(display("missing pipe separator"))]
    MissingPipe,

    /// The modifier was not one of `c`, `g`, `ms`.
    #[snafu(display("unsupported metric type '{modifier}'"))]
    UnsupportedType { modifier: String },

    /// The value did not parse as a float.
    #[snafu(display("invalid value '{input}'"))]
    InvalidValue { input: String },

    /// The third field was not `@<rate>` with a rate in `(0, 1]`.
    #[snafu(display("invalid sampling '{input}'"))]
    InvalidSampling { input: String },

    /// The line was not valid UTF-8.
    #[snafu(display("line is not valid UTF-8"))]
    NotUtf8,
}

/// Parses one StatsD line into a [`Metric`].
///
/// Returns `Ok(None)` for an empty line; surrounding ASCII whitespace is
/// trimmed before parsing. A missing sampling field defaults to 1.0.
pub fn parse_line(line: &[u8]) -> Result<Option<Metric>, ParseError> {
    if line.is_empty() {
        return Ok(None);
    }

    let line = std::str::from_utf8(line).map_err(|_| ParseError::NotUtf8)?;
    let line = line.trim_matches(|c: char| c.is_ascii_whitespace());

    let (key, rest) = line.split_once(':').ok_or(ParseError::WrongColonCount)?;
    if rest.contains(':') {
        return Err(ParseError::WrongColonCount);
    }
    if key.is_empty() {
        return Err(ParseError::EmptyKey);
    }

    let mut fields = rest.splitn(3, '|');
    let raw_value = fields.next().unwrap_or_default();
    let raw_modifier = fields.next().ok_or(ParseError::MissingPipe)?;

    let kind = MetricKind::from_modifier(raw_modifier).ok_or_else(|| ParseError::UnsupportedType {
        modifier: raw_modifier.to_string(),
    })?;

    let sampling = match fields.next() {
        Some(raw_sampling) => parse_sampling(raw_sampling)?,
        None => 1.0,
    };

    let value = parse_value(raw_value)?;

    Ok(Some(Metric {
        bucket: key.to_string(),
        value,
        kind,
        sampling,
    }))
}

fn parse_value(input: &str) -> Result<f64, ParseError> {
    match all_consuming(double::<_, nom::error::Error<&str>>)(input) {
        Ok((_, value)) => Ok(value),
        Err(_) => Err(ParseError::InvalidValue {
            input: input.to_string(),
        }),
    }
}

fn parse_sampling(input: &str) -> Result<f32, ParseError> {
    let invalid = || ParseError::InvalidSampling {
        input: input.to_string(),
    };

    let raw_rate = input.strip_prefix('@').ok_or_else(invalid)?;
    let rate = match all_consuming(float::<_, nom::error::Error<&str>>)(raw_rate) {
        Ok((_, rate)) => rate,
        Err(_) => return Err(invalid()),
    };
    if !(rate > 0.0 && rate <= 1.0) {
        return Err(invalid());
    }

    Ok(rate)
}
