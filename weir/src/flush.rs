//! The periodic read/flush/reset cycle.
//!
//! An external scheduler calls [`flush`] on a fixed period. One pass walks
//! the store in key order, summarizes every live metric into [`Sample`]
//! values, resets per-interval state, and removes metrics the idle-deletion
//! policy marked. The caller holds the store's exclusive lock across the
//! pass and dispatches the returned samples after releasing it, so no sink
//! I/O ever happens under the lock.

use std::time::Duration;

use metrics::counter;
use serde::Deserialize;

use crate::sample::{Sample, SampleKind, SampleValue};
use crate::store::{Metric, MetricKind, Store};

/// Errors produced by [`Config::validate`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// A percentile threshold was outside `(0, 100)` exclusive.
    #[error("timer percentile must be between 0 and 100, exclusively: {0}")]
    PercentileOutOfRange(f64),
}

fn default_interval_seconds() -> u64 {
    10
}

/// Configuration for the flush cycle: scheduling, retention, and which
/// optional series each metric type emits.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Seconds between flush passes. The scheduler boundary belongs to the
    /// embedding binary; this is its period.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Delete counters that received no updates during an interval.
    #[serde(default)]
    pub delete_counters: bool,
    /// Delete timers that received no updates during an interval.
    #[serde(default)]
    pub delete_timers: bool,
    /// Delete gauges that received no updates during an interval.
    #[serde(default)]
    pub delete_gauges: bool,
    /// Delete sets that received no updates during an interval.
    #[serde(default)]
    pub delete_sets: bool,
    /// Emit each counter's per-interval differential as a `count` series.
    #[serde(default)]
    pub counter_sum: bool,
    /// Emit each counter's pending value as a `gauge` series.
    #[serde(default)]
    pub counter_gauge: bool,
    /// Emit each timer's smallest observation.
    #[serde(default)]
    pub timer_lower: bool,
    /// Emit each timer's largest observation.
    #[serde(default)]
    pub timer_upper: bool,
    /// Emit each timer's observation sum.
    #[serde(default)]
    pub timer_sum: bool,
    /// Emit each timer's event count.
    #[serde(default)]
    pub timer_count: bool,
    /// Percentile thresholds emitted per timer, each in `(0, 100)`
    /// exclusive. Duplicates are permitted.
    #[serde(default)]
    pub timer_percentiles: Vec<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            delete_counters: false,
            delete_timers: false,
            delete_gauges: false,
            delete_sets: false,
            counter_sum: false,
            counter_gauge: false,
            timer_lower: false,
            timer_upper: false,
            timer_sum: false,
            timer_count: false,
            timer_percentiles: Vec::new(),
        }
    }
}

impl Config {
    /// Check the percentile list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PercentileOutOfRange`] for any threshold at or
    /// outside the exclusive `(0, 100)` range.
    pub fn validate(&self) -> Result<(), Error> {
        for percent in &self.timer_percentiles {
            if !(*percent > 0.0 && *percent < 100.0) {
                return Err(Error::PercentileOutOfRange(*percent));
            }
        }
        Ok(())
    }

    fn deletes(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Counter => self.delete_counters,
            MetricKind::Timer => self.delete_timers,
            MetricKind::Gauge => self.delete_gauges,
            MetricKind::Set => self.delete_sets,
        }
    }
}

fn seconds_or_nan(duration: Option<Duration>) -> f64 {
    duration.map_or(f64::NAN, |d| d.as_secs_f64())
}

/// Summarize one counter over a single pre-flush snapshot.
///
/// The differential `count`, the running `gauge`, and the cumulative
/// `derive` emissions are three independent reads of the same snapshot;
/// only afterwards does the state advance: the integral delta moves from
/// `value` into `cumulative` and the fractional residual carries forward.
fn flush_counter(name: &str, metric: &mut Metric, config: &Config, time: u128, out: &mut Vec<Sample>) {
    let value = metric.value;
    let delta = value.round_ties_even();

    if config.counter_sum {
        out.push(Sample {
            name: name.to_string(),
            kind: SampleKind::Count,
            time,
            value: SampleValue::Float(delta),
        });
    }
    if config.counter_gauge {
        out.push(Sample {
            name: name.to_string(),
            kind: SampleKind::Gauge,
            time,
            value: SampleValue::Float(value),
        });
    }

    metric.value = value - delta;
    #[allow(clippy::cast_possible_truncation)]
    {
        metric.cumulative += delta as i64;
    }
    out.push(Sample {
        name: name.to_string(),
        kind: SampleKind::Derive,
        time,
        value: SampleValue::Int(metric.cumulative),
    });
}

/// Summarize one timer. Every enabled sub-series is emitted each pass --
/// as NaN placeholders when the interval saw no updates -- so downstream
/// point cadence never has holes. All sub-series share `time`.
fn flush_timer(name: &str, metric: &mut Metric, config: &Config, time: u128, out: &mut Vec<Sample>) {
    let idle = metric.updates == 0;
    let latency = metric.latency.get_or_insert_with(Default::default);

    let push = |suffix: String, kind: SampleKind, value: f64, out: &mut Vec<Sample>| {
        out.push(Sample {
            name: format!("{name}-{suffix}"),
            kind,
            time,
            value: SampleValue::Float(value),
        });
    };

    let average = if idle { f64::NAN } else { seconds_or_nan(latency.average()) };
    push("average".to_string(), SampleKind::Latency, average, out);

    if config.timer_lower {
        let lower = if idle { f64::NAN } else { seconds_or_nan(latency.min()) };
        push("lower".to_string(), SampleKind::Latency, lower, out);
    }
    if config.timer_upper {
        let upper = if idle { f64::NAN } else { seconds_or_nan(latency.max()) };
        push("upper".to_string(), SampleKind::Latency, upper, out);
    }
    if config.timer_sum {
        let sum = if idle { f64::NAN } else { latency.sum().as_secs_f64() };
        push("sum".to_string(), SampleKind::Latency, sum, out);
    }

    let computed = if idle {
        Vec::new()
    } else {
        latency.percentiles(&config.timer_percentiles)
    };
    for (i, percent) in config.timer_percentiles.iter().enumerate() {
        let value = computed.get(i).map_or(f64::NAN, Duration::as_secs_f64);
        push(format!("percentile-{percent}"), SampleKind::Latency, value, out);
    }

    if config.timer_count {
        #[allow(clippy::cast_precision_loss)]
        let count = if idle { f64::NAN } else { latency.count() as f64 };
        push("count".to_string(), SampleKind::Count, count, out);
    }

    latency.reset();
}

/// Run one flush pass over the store.
///
/// `time` is the pass timestamp in milliseconds since the Unix epoch;
/// every emitted sample shares it. The caller must hold the store's
/// exclusive lock for the duration of this call.
pub fn flush(store: &mut Store, config: &Config, time: u128) -> Vec<Sample> {
    let mut samples = Vec::new();
    let mut deleted = Vec::new();

    for (key, metric) in store.iter_mut() {
        if metric.updates == 0 && config.deletes(key.kind()) {
            deleted.push(key.clone());
            continue;
        }

        match key.kind() {
            MetricKind::Gauge => samples.push(Sample {
                name: key.name().to_string(),
                kind: SampleKind::Gauge,
                time,
                value: SampleValue::Float(metric.value),
            }),
            MetricKind::Counter => flush_counter(key.name(), metric, config, time, &mut samples),
            MetricKind::Timer => flush_timer(key.name(), metric, config, time, &mut samples),
            MetricKind::Set => {
                #[allow(clippy::cast_precision_loss)]
                let cardinality = metric.members.as_ref().map_or(0.0, |m| m.len() as f64);
                samples.push(Sample {
                    name: key.name().to_string(),
                    kind: SampleKind::Objects,
                    time,
                    value: SampleValue::Float(cardinality),
                });
                if let Some(members) = metric.members.as_mut() {
                    members.clear();
                }
            }
        }

        metric.updates = 0;
    }

    counter!("metrics_deleted").increment(deleted.len() as u64);
    for key in &deleted {
        store.remove(key);
    }
    counter!("samples_emitted").increment(samples.len() as u64);

    samples
}
