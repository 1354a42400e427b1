//! The concurrent metric store and per-type update handlers.
//!
//! A [`Store`] maps a composite [`MetricKey`] -- metric type plus bounded
//! name -- to one [`Metric`] aggregation record. Records are created lazily
//! on first update. The store itself carries no synchronization: callers
//! wrap it in a mutex and hold the lock across each [`Store::apply`] call,
//! which is the whole lookup-or-create-plus-mutate critical section. The
//! network listener and the flush cycle are the only mutators.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;

use crate::latency::Latency;
use crate::parser::Update;

/// Longest usable metric name in bytes. Longer names are truncated on a
/// character boundary rather than rejected.
pub const MAX_NAME_LEN: usize = 62;

/// The four metric types of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetricKind {
    /// Additive, flushed as a differential plus a cumulative total.
    Counter,
    /// Latency observations with percentile summaries.
    Timer,
    /// Point-in-time value, settable or adjustable.
    Gauge,
    /// Distinct-member cardinality.
    Set,
}

/// Identity of one metric: two keys are equal iff both the type and the
/// name match exactly. A counter named `foo` and a gauge named `foo` are
/// unrelated metrics.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricKey {
    kind: MetricKind,
    name: String,
}

impl MetricKey {
    /// Build a key, truncating the name to [`MAX_NAME_LEN`] bytes.
    #[must_use]
    pub fn new(kind: MetricKind, name: &str) -> Self {
        let mut end = MAX_NAME_LEN.min(name.len());
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            kind,
            name: name[..end].to_string(),
        }
    }

    /// The metric type component.
    #[must_use]
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// The (possibly truncated) name component.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One metric's aggregation state.
///
/// `latency` is populated only for timers, `members` only for sets; the
/// other fields are shared. `updates` counts updates received since the
/// last flush and is zeroed exactly once per flush pass.
#[derive(Debug, Default)]
pub struct Metric {
    pub(crate) value: f64,
    pub(crate) cumulative: i64,
    pub(crate) latency: Option<Latency>,
    pub(crate) members: Option<FxHashSet<String>>,
    pub(crate) updates: u64,
}

impl Metric {
    /// Pending floating accumulator: the un-flushed delta for counters, the
    /// current value for gauges.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Running total of all integral deltas ever flushed from a counter.
    #[must_use]
    pub fn cumulative(&self) -> i64 {
        self.cumulative
    }

    /// Updates received since the last flush.
    #[must_use]
    pub fn updates(&self) -> u64 {
        self.updates
    }
}

/// Keyed collection of [`Metric`] records, ordered by key for
/// deterministic flush iteration.
#[derive(Debug, Default)]
pub struct Store {
    metrics: BTreeMap<MetricKey, Metric>,
}

impl Store {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one parsed update, creating the metric on first use.
    ///
    /// Callers must hold the store's exclusive lock for the duration of
    /// this call; the lookup-or-create and the mutation are one atomic
    /// read-modify-write sequence.
    pub fn apply(&mut self, update: Update) {
        match update {
            Update::Counter { name, delta } => {
                let metric = self.lookup_or_create(MetricKey::new(MetricKind::Counter, &name));
                metric.value += delta;
                metric.updates += 1;
            }
            Update::Gauge {
                name,
                value,
                relative,
            } => {
                let metric = self.lookup_or_create(MetricKey::new(MetricKind::Gauge, &name));
                if relative {
                    metric.value += value;
                } else {
                    metric.value = value;
                }
                metric.updates += 1;
            }
            Update::Timer { name, sample } => {
                let metric = self.lookup_or_create(MetricKey::new(MetricKind::Timer, &name));
                metric.latency.get_or_insert_with(Latency::default).record(sample);
                metric.updates += 1;
            }
            Update::Set { name, member } => {
                let metric = self.lookup_or_create(MetricKey::new(MetricKind::Set, &name));
                // Duplicate insertion is a no-op but still counts as an
                // update for the idle-deletion policy.
                metric
                    .members
                    .get_or_insert_with(FxHashSet::default)
                    .insert(member);
                metric.updates += 1;
            }
        }
    }

    fn lookup_or_create(&mut self, key: MetricKey) -> &mut Metric {
        self.metrics.entry(key).or_default()
    }

    /// Number of metrics currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// `true` if no metrics are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Look up a metric record.
    #[must_use]
    pub fn get(&self, key: &MetricKey) -> Option<&Metric> {
        self.metrics.get(key)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (&MetricKey, &mut Metric)> {
        self.metrics.iter_mut()
    }

    pub(crate) fn remove(&mut self, key: &MetricKey) -> Option<Metric> {
        self.metrics.remove(key)
    }

    /// Drop every metric record.
    pub fn clear(&mut self) {
        self.metrics.clear();
    }

    /// Record a timer observation directly, bypassing the parser. Test
    /// support.
    #[cfg(test)]
    pub(crate) fn record_timer(&mut self, name: &str, sample: std::time::Duration) {
        self.apply(Update::Timer {
            name: name.to_string(),
            sample,
        });
    }
}
