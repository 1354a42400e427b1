//! Per-timer observation accumulator.
//!
//! Holds every observation recorded since the last reset, enough to compute
//! minimum, maximum, sum, average and arbitrary percentiles exactly. The
//! flush cycle reads a summary once per interval and then calls [`reset`],
//! so the vector is bounded by one interval's worth of updates.
//!
//! [`reset`]: Latency::reset

use std::time::Duration;

/// Accumulated timer observations for one metric.
#[derive(Debug, Default, Clone)]
pub struct Latency {
    samples: Vec<Duration>,
    sum: Duration,
    min: Duration,
    max: Duration,
}

impl Latency {
    /// Record one observation.
    pub fn record(&mut self, sample: Duration) {
        if self.samples.is_empty() {
            self.min = sample;
            self.max = sample;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        self.sum += sample;
        self.samples.push(sample);
    }

    /// Number of observations since the last reset.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.samples.len() as u64
    }

    /// Sum of all observations since the last reset.
    #[must_use]
    pub fn sum(&self) -> Duration {
        self.sum
    }

    /// Smallest observation, `None` if there are no observations.
    #[must_use]
    pub fn min(&self) -> Option<Duration> {
        (!self.samples.is_empty()).then_some(self.min)
    }

    /// Largest observation, `None` if there are no observations.
    #[must_use]
    pub fn max(&self) -> Option<Duration> {
        (!self.samples.is_empty()).then_some(self.max)
    }

    /// Arithmetic mean of all observations, `None` if there are none.
    #[must_use]
    pub fn average(&self) -> Option<Duration> {
        let count = u32::try_from(self.samples.len()).ok()?;
        (count != 0).then(|| self.sum / count)
    }

    /// Nearest-rank percentiles over the full observation set.
    ///
    /// For each threshold `p` the result is the `ceil(p/100 * n)`-th
    /// smallest observation. Thresholds are expected in `(0, 100)`; the
    /// rank is clamped to the observation range so out-of-range inputs
    /// degrade to min/max rather than panic. Returns an empty vector when
    /// there are no observations.
    #[must_use]
    pub fn percentiles(&self, thresholds: &[f64]) -> Vec<Duration> {
        if self.samples.is_empty() {
            return Vec::new();
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        thresholds
            .iter()
            .map(|percent| {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let rank = ((percent / 100.0) * sorted.len() as f64).ceil() as usize;
                sorted[rank.clamp(1, sorted.len()) - 1]
            })
            .collect()
    }

    /// Drop all observations.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.sum = Duration::ZERO;
        self.min = Duration::ZERO;
        self.max = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_millis(values: &[u64]) -> Latency {
        let mut latency = Latency::default();
        for v in values {
            latency.record(Duration::from_millis(*v));
        }
        latency
    }

    #[test]
    fn empty_accumulator() {
        let latency = Latency::default();
        assert_eq!(latency.count(), 0);
        assert_eq!(latency.sum(), Duration::ZERO);
        assert_eq!(latency.min(), None);
        assert_eq!(latency.max(), None);
        assert_eq!(latency.average(), None);
        assert!(latency.percentiles(&[50.0]).is_empty());
    }

    #[test]
    fn running_statistics() {
        let latency = from_millis(&[30, 10, 20]);
        assert_eq!(latency.count(), 3);
        assert_eq!(latency.sum(), Duration::from_millis(60));
        assert_eq!(latency.min(), Some(Duration::from_millis(10)));
        assert_eq!(latency.max(), Some(Duration::from_millis(30)));
        assert_eq!(latency.average(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn nearest_rank_percentiles() {
        // 10 observations: p50 is the 5th smallest, p90 the 9th, p99 the
        // 10th.
        let latency = from_millis(&[10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
        let result = latency.percentiles(&[50.0, 90.0, 99.0]);
        assert_eq!(
            result,
            vec![
                Duration::from_millis(50),
                Duration::from_millis(90),
                Duration::from_millis(100),
            ]
        );
    }

    #[test]
    fn percentile_of_single_observation() {
        let latency = from_millis(&[42]);
        assert_eq!(
            latency.percentiles(&[1.0, 50.0, 99.9]),
            vec![Duration::from_millis(42); 3]
        );
    }

    #[test]
    fn duplicate_thresholds_permitted() {
        let latency = from_millis(&[10, 20, 30, 40]);
        let result = latency.percentiles(&[50.0, 50.0]);
        assert_eq!(result[0], result[1]);
        assert_eq!(result[0], Duration::from_millis(20));
    }

    #[test]
    fn reset_drops_observations() {
        let mut latency = from_millis(&[10, 20]);
        latency.reset();
        assert_eq!(latency.count(), 0);
        assert_eq!(latency.min(), None);
        assert_eq!(latency.sum(), Duration::ZERO);

        // The accumulator is reusable after a reset.
        latency.record(Duration::from_millis(7));
        assert_eq!(latency.count(), 1);
        assert_eq!(latency.min(), Some(Duration::from_millis(7)));
    }
}
