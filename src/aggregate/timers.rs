use std::collections::HashMap;

use crate::format::{write_point, Formatter};
use crate::metric::Metric;

/// A percentile with its display label.
///
/// The label is the percentile number with the decimal point removed, so
/// 0.75 becomes `75` and 0.999 becomes `999`, yielding summary stats like
/// `upper_75` and `mean_75`.
#[derive(Clone, Debug, PartialEq)]
pub struct Percentile {
    value: f64,
    label: String,
}

impl Percentile {
    pub fn new(value: f64) -> Self {
        let label = format!("{}", value * 100.0).replace('.', "");
        Self { value, label }
    }

    /// Builds the ordered percentile configuration from raw fractions.
    pub fn from_values(values: &[f64]) -> Vec<Self> {
        values.iter().copied().map(Self::new).collect()
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[derive(Clone, Debug, Default)]
struct TimerData {
    points: Vec<f64>,
    count: u64,
}

/// Observed timer samples, summarized per bucket at flush time.
#[derive(Clone, Debug)]
pub struct Timers {
    values: HashMap<String, TimerData>,
    percentiles: Vec<Percentile>,
}

impl Timers {
    pub fn new(percentiles: Vec<Percentile>) -> Self {
        Self {
            values: HashMap::new(),
            percentiles,
        }
    }

    /// Records one sample. The bucket's count accumulates the truncated
    /// reciprocal of the sampling rate, mirroring how sampled submissions
    /// are counted elsewhere.
    pub fn add(&mut self, metric: &Metric) {
        let data = self.values.entry(metric.bucket.clone()).or_default();
        data.points.push(metric.value);
        data.count += (1.0 / f64::from(metric.sampling)) as u64;
    }

    /// Summarizes every timer bucket into the buffer: per configured
    /// percentile the nearest-rank upper bound and the mean of samples at or
    /// below it, then min, max, mean, count, and count-per-second. Returns
    /// the number of points emitted.
    pub fn process(&mut self, buf: &mut Vec<u8>, now: u64, interval_secs: u64, formatter: &Formatter) -> u64 {
        let mut num_points = 0;

        for (bucket, data) in &mut self.values {
            if data.points.is_empty() {
                continue;
            }
            data.points.sort_by(f64::total_cmp);

            let n = data.points.len();
            let min = data.points[0];
            let max = data.points[n - 1];
            let sum: f64 = data.points.iter().sum();
            let mean = sum / n as f64;

            let prefix = format!("{}{}", formatter.prefix_timers, bucket);

            for percentile in &self.percentiles {
                let index = nearest_rank_index(percentile.value(), n);
                let upper = data.points[index];
                let below = &data.points[..=index];
                let mean_below = below.iter().sum::<f64>() / below.len() as f64;

                write_point(buf, &format!("{}.upper_{}", prefix, percentile.label()), upper, now);
                write_point(buf, &format!("{}.mean_{}", prefix, percentile.label()), mean_below, now);
                num_points += 2;
            }

            write_point(buf, &format!("{}.min", prefix), min, now);
            write_point(buf, &format!("{}.max", prefix), max, now);
            write_point(buf, &format!("{}.mean", prefix), mean, now);
            write_point(buf, &format!("{}.count", prefix), data.count as f64, now);
            write_point(
                buf,
                &format!("{}.count_ps", prefix),
                data.count as f64 / interval_secs as f64,
                now,
            );
            num_points += 5;
        }

        num_points
    }
}

/// The 0-indexed nearest-rank position for percentile `p` over `n` sorted
/// samples: `ceil(p * n) - 1`.
fn nearest_rank_index(p: f64, n: usize) -> usize {
    let rank = (p * n as f64).ceil() as usize;
    rank.saturating_sub(1).min(n - 1)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::metric::MetricKind;

    fn timer(bucket: &str, value: f64) -> Metric {
        Metric {
            bucket: bucket.to_string(),
            value,
            kind: MetricKind::Timer,
            sampling: 1.0,
        }
    }

    fn formatter() -> Formatter {
        Formatter {
            prefix_rates: "stats.".to_string(),
            prefix_counts: "stats_counts.".to_string(),
            prefix_gauges: "stats.gauges.".to_string(),
            prefix_timers: "stats.timers.".to_string(),
            prefix_internal: "internal.".to_string(),
        }
    }

    #[test]
    fn percentile_labels_drop_the_decimal_point() {
        assert_eq!(Percentile::new(0.9).label(), "90");
        assert_eq!(Percentile::new(0.75).label(), "75");
        assert_eq!(Percentile::new(0.99).label(), "99");
        assert_eq!(Percentile::new(0.999).label(), "999");
    }

    #[test]
    fn summary_of_four_samples_at_p75() {
        let mut timers = Timers::new(Percentile::from_values(&[0.75]));
        for value in [10.0, 20.0, 30.0, 40.0] {
            timers.add(&timer("t", value));
        }

        let mut buf = Vec::new();
        let num = timers.process(&mut buf, 1_000, 1, &formatter());
        assert_eq!(num, 7);

        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains("stats.timers.t.count 4 1000\n"));
        assert!(output.contains("stats.timers.t.count_ps 4 1000\n"));
        assert!(output.contains("stats.timers.t.min 10 1000\n"));
        assert!(output.contains("stats.timers.t.max 40 1000\n"));
        assert!(output.contains("stats.timers.t.mean 25 1000\n"));
        assert!(output.contains("stats.timers.t.upper_75 30 1000\n"));
        assert!(output.contains("stats.timers.t.mean_75 20 1000\n"));
    }

    #[test]
    fn unsorted_input_is_sorted_before_summarizing() {
        let mut timers = Timers::new(Percentile::from_values(&[0.5]));
        for value in [40.0, 10.0, 30.0, 20.0] {
            timers.add(&timer("t", value));
        }

        let mut buf = Vec::new();
        timers.process(&mut buf, 1_000, 1, &formatter());

        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains("stats.timers.t.min 10 1000\n"));
        assert!(output.contains("stats.timers.t.max 40 1000\n"));
        assert!(output.contains("stats.timers.t.upper_50 20 1000\n"));
    }

    #[test]
    fn sampled_timers_inflate_the_count() {
        let mut timers = Timers::new(Vec::new());
        let mut sampled = timer("t", 5.0);
        sampled.sampling = 0.25;
        timers.add(&sampled);
        timers.add(&timer("t", 6.0));

        let mut buf = Vec::new();
        timers.process(&mut buf, 1_000, 1, &formatter());

        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains("stats.timers.t.count 5 1000\n"));
    }

    proptest! {
        #[test]
        fn nearest_rank_matches_the_law(
            mut samples in proptest::collection::vec(0.0f64..1_000.0, 1..64),
            p in 0.01f64..0.99,
        ) {
            samples.sort_by(f64::total_cmp);
            let n = samples.len();
            let index = nearest_rank_index(p, n);

            // index = ceil(p * n) - 1, clamped into range.
            let expected = ((p * n as f64).ceil() as usize).max(1) - 1;
            prop_assert_eq!(index, expected.min(n - 1));

            // The upper bound is at least as large as every sample at or
            // below the rank.
            let upper = samples[index];
            for sample in &samples[..=index] {
                prop_assert!(*sample <= upper);
            }
        }
    }
}
