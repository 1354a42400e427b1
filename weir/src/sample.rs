//! Canonical representation of one emitted series point.
//!
//! The flush cycle produces a flat list of [`Sample`] values, one per
//! series per metric per pass. Sinks serialize these however their
//! downstream wants; the tuple itself is the whole dispatch boundary.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// The kinds of series the flush cycle emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    /// Ever-increasing integer; the consumer computes rates by differencing.
    /// A counter's primary series.
    Derive,
    /// Point-in-time count that resets every interval: a counter's
    /// differential series and a timer's event count.
    Count,
    /// Point-in-time measurement: gauges and the counter running-gauge
    /// series.
    Gauge,
    /// Duration series in seconds: a timer's averaged sub-series.
    Latency,
    /// Distinct-member cardinality of a set.
    Objects,
}

impl SampleKind {
    /// Stable lowercase tag, used by the wire sinks.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SampleKind::Derive => "derive",
            SampleKind::Count => "count",
            SampleKind::Gauge => "gauge",
            SampleKind::Latency => "latency",
            SampleKind::Objects => "objects",
        }
    }
}

/// The value carried by a [`Sample`].
///
/// NaN floats are legal and mean "no data this interval" -- deliberately
/// distinct from a real zero. JSON sinks render NaN as `null`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleValue {
    /// A signed integer, used by the monotonic derive series.
    Int(i64),
    /// A floating point, NaN permitted.
    Float(f64),
}

impl SampleValue {
    /// An f64 view of this value. Extremely large integers lose precision.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> f64 {
        match self {
            SampleValue::Int(int) => *int as f64,
            SampleValue::Float(float) => *float,
        }
    }

    /// `true` when this is a NaN placeholder.
    #[must_use]
    pub fn is_no_data(&self) -> bool {
        matches!(self, SampleValue::Float(f) if f.is_nan())
    }
}

impl Serialize for SampleValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            SampleValue::Int(int) => serializer.serialize_i64(*int),
            SampleValue::Float(float) if float.is_nan() => serializer.serialize_none(),
            SampleValue::Float(float) => serializer.serialize_f64(*float),
        }
    }
}

/// One emitted series point.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Series name. Timer sub-series carry a suffix, e.g. `db.query-upper`.
    pub name: String,
    /// What kind of series this point belongs to.
    pub kind: SampleKind,
    /// Milliseconds since the Unix epoch. All series of one metric share
    /// one timestamp per flush pass.
    pub time: u128,
    /// The point's value.
    pub value: SampleValue,
}

impl Serialize for Sample {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Sample", 4)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("kind", &self.kind)?;
        // u128 support is patchy across serde data formats; milliseconds
        // since the epoch fit u64 for the next half-billion years.
        #[allow(clippy::cast_possible_truncation)]
        state.serialize_field("time", &(self.time as u64))?;
        state.serialize_field("value", &self.value)?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_serializes_as_null() {
        let sample = Sample {
            name: "db.query-average".to_string(),
            kind: SampleKind::Latency,
            time: 1_700_000_000_000,
            value: SampleValue::Float(f64::NAN),
        };
        let json = serde_json::to_string(&sample).expect("serializable");
        assert_eq!(
            json,
            r#"{"name":"db.query-average","kind":"latency","time":1700000000000,"value":null}"#
        );
    }

    #[test]
    fn integer_values_stay_integers() {
        let sample = Sample {
            name: "requests".to_string(),
            kind: SampleKind::Derive,
            time: 0,
            value: SampleValue::Int(-3),
        };
        let json = serde_json::to_string(&sample).expect("serializable");
        assert_eq!(json, r#"{"name":"requests","kind":"derive","time":0,"value":-3}"#);
    }

    #[test]
    fn no_data_detection() {
        assert!(SampleValue::Float(f64::NAN).is_no_data());
        assert!(!SampleValue::Float(0.0).is_no_data());
        assert!(!SampleValue::Int(0).is_no_data());
    }
}
