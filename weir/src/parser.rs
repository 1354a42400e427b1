//! The StatsD line protocol parser.
//!
//! One line of text -- already separated from its datagram, no embedded
//! newline -- becomes one typed [`Update`] instruction. The format is
//! `name:value|type` with an optional `|@rate` suffix:
//!
//! ```text
//! pages.served:12|c|@0.5
//! db.query:33.9|ms
//! queue.depth:+4|g
//! users.online:fae1|s
//! ```
//!
//! The type tag is everything after the first `|`; the value is everything
//! after the *last* `:` before that `|`, so metric names may themselves
//! contain colons. Sample rates are only legal for counters and timers and
//! are folded into the instruction here: a counter line at rate 0.1 parses
//! to a delta ten times its written value.

use std::fmt;
use std::time::Duration;

/// Errors produced by [`parse`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The line has no `|` separating the value from the type tag.
    #[error("line has no '|' type separator")]
    MissingTypeSeparator,
    /// The line has no `:` before the type separator.
    #[error("line has no ':' value separator")]
    MissingValueSeparator,
    /// The type tag is not one of `c`, `ms`, `g`, `s`.
    #[error("unknown metric type tag: {0:?}")]
    UnknownType(String),
    /// A `|...` suffix was present on a gauge or set line.
    #[error("sample rate is only valid for counters and timers")]
    UnexpectedSampleRate,
    /// The `|...` suffix did not begin with `@`.
    #[error("malformed sample rate suffix: {0:?}")]
    MalformedSampleRate(String),
    /// The sample rate was outside `(0.0, 1.0]`.
    #[error("sample rate out of range (0.0, 1.0]: {0}")]
    SampleRateOutOfRange(f64),
    /// The value token was not a fully-consumed floating point number.
    #[error("invalid numeric value: {0:?}")]
    InvalidValue(String),
    /// The timer value was negative, infinite or NaN.
    #[error("timer value must be a finite, non-negative number: {0}")]
    InvalidTimerValue(f64),
}

/// One parsed metric update, sample rate already applied.
///
/// The [`fmt::Display`] impl renders the canonical protocol line for the
/// instruction, with any sample rate folded into the value.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Additive counter update. `delta` is the written value divided by the
    /// sample rate.
    Counter {
        /// Metric name.
        name: String,
        /// Rate-corrected increment.
        delta: f64,
    },
    /// One timer observation, converted from milliseconds.
    Timer {
        /// Metric name.
        name: String,
        /// Rate-corrected observation.
        sample: Duration,
    },
    /// Gauge update, either absolute or relative.
    Gauge {
        /// Metric name.
        name: String,
        /// New value, or signed delta when `relative`.
        value: f64,
        /// `true` when the value token began with `+` or `-`.
        relative: bool,
    },
    /// Set membership observation. The value token is an opaque member
    /// string, not a number.
    Set {
        /// Metric name.
        name: String,
        /// Member token.
        member: String,
    },
}

impl Update {
    /// The metric name this update applies to.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Update::Counter { name, .. }
            | Update::Timer { name, .. }
            | Update::Gauge { name, .. }
            | Update::Set { name, .. } => name,
        }
    }
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Update::Counter { name, delta } => write!(f, "{name}:{delta}|c"),
            Update::Timer { name, sample } => {
                write!(f, "{name}:{ms}|ms", ms = sample.as_secs_f64() * 1_000.0)
            }
            Update::Gauge {
                name,
                value,
                relative,
            } => {
                if *relative {
                    write!(f, "{name}:{value:+}|g")
                } else {
                    write!(f, "{name}:{value}|g")
                }
            }
            Update::Set { name, member } => write!(f, "{name}:{member}|s"),
        }
    }
}

fn parse_number(token: &str) -> Result<f64, Error> {
    token
        .parse::<f64>()
        .map_err(|_| Error::InvalidValue(token.to_string()))
}

/// Parse the optional `@<fraction>` suffix. Absent means a rate of 1.0.
fn parse_rate(extra: Option<&str>) -> Result<f64, Error> {
    let Some(extra) = extra else {
        return Ok(1.0);
    };
    let Some(fraction) = extra.strip_prefix('@') else {
        return Err(Error::MalformedSampleRate(extra.to_string()));
    };
    let rate = parse_number(fraction)?;
    if !rate.is_finite() || rate <= 0.0 || rate > 1.0 {
        return Err(Error::SampleRateOutOfRange(rate));
    }
    Ok(rate)
}

/// Parse one protocol line into an [`Update`].
///
/// Pure function: no side effects, no allocation beyond the returned
/// instruction.
///
/// # Errors
///
/// Returns a variant of [`Error`] for any malformed line. A failed parse
/// never partially applies; callers drop the line and continue.
pub fn parse(line: &str) -> Result<Update, Error> {
    let (head, rest) = line.split_once('|').ok_or(Error::MissingTypeSeparator)?;
    let (name, value) = head.rsplit_once(':').ok_or(Error::MissingValueSeparator)?;
    let (tag, extra) = match rest.split_once('|') {
        Some((tag, extra)) => (tag, Some(extra)),
        None => (rest, None),
    };

    match tag {
        "c" => {
            let rate = parse_rate(extra)?;
            let parsed = parse_number(value)?;
            Ok(Update::Counter {
                name: name.to_string(),
                delta: parsed / rate,
            })
        }
        "ms" => {
            let rate = parse_rate(extra)?;
            let ms = parse_number(value)? / rate;
            if !ms.is_finite() || ms < 0.0 {
                return Err(Error::InvalidTimerValue(ms));
            }
            Ok(Update::Timer {
                name: name.to_string(),
                sample: Duration::from_secs_f64(ms / 1_000.0),
            })
        }
        "g" => {
            if extra.is_some() {
                return Err(Error::UnexpectedSampleRate);
            }
            let parsed = parse_number(value)?;
            Ok(Update::Gauge {
                name: name.to_string(),
                value: parsed,
                relative: value.starts_with('+') || value.starts_with('-'),
            })
        }
        "s" => {
            if extra.is_some() {
                return Err(Error::UnexpectedSampleRate);
            }
            Ok(Update::Set {
                name: name.to_string(),
                member: value.to_string(),
            })
        }
        other => Err(Error::UnknownType(other.to_string())),
    }
}
