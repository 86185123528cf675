use std::collections::HashMap;

use crate::format::{write_point, Formatter};
use crate::metric::Metric;

/// Accumulated counter sums, scaled by the reciprocal of each observation's
/// sampling rate at insert time.
#[derive(Clone, Debug)]
pub struct Counters {
    values: HashMap<String, f64>,
    flush_rates: bool,
    flush_counts: bool,
}

impl Counters {
    pub fn new(flush_rates: bool, flush_counts: bool) -> Self {
        Self {
            values: HashMap::new(),
            flush_rates,
            flush_counts,
        }
    }

    /// Adds one observation: a bucket seen N times at sampling `s`
    /// accumulates `N * value / s`.
    pub fn add(&mut self, metric: &Metric) {
        let amount = metric.value / f64::from(metric.sampling);
        match self.values.get_mut(&metric.bucket) {
            Some(sum) => *sum += amount,
            None => {
                self.values.insert(metric.bucket.clone(), amount);
            }
        }
    }

    /// Gets the accumulated sum for a bucket.
    pub fn get(&self, bucket: &str) -> Option<f64> {
        self.values.get(bucket).copied()
    }

    /// Formats every counter into the buffer, as a rate line and/or a raw
    /// count line per bucket. Returns the number of points emitted.
    pub fn process(&self, buf: &mut Vec<u8>, now: u64, interval_secs: u64, formatter: &Formatter) -> u64 {
        let mut num_points = 0;
        for (bucket, &sum) in &self.values {
            if self.flush_rates {
                let path = format!("{}{}", formatter.prefix_rates, bucket);
                write_point(buf, &path, sum / interval_secs as f64, now);
                num_points += 1;
            }
            if self.flush_counts {
                let path = format!("{}{}", formatter.prefix_counts, bucket);
                write_point(buf, &path, sum, now);
                num_points += 1;
            }
        }
        num_points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricKind;

    fn counter(bucket: &str, value: f64, sampling: f32) -> Metric {
        Metric {
            bucket: bucket.to_string(),
            value,
            kind: MetricKind::Counter,
            sampling,
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
    fn sampling_inflates_the_sum() {
        let mut counters = Counters::new(true, true);
        counters.add(&counter("a", 1.0, 1.0));
        counters.add(&counter("a", 2.0, 1.0));
        counters.add(&counter("a", 1.0, 0.5));

        assert_eq!(counters.get("a"), Some(5.0));
    }

    #[test]
    fn process_emits_rate_and_count_lines() {
        let mut counters = Counters::new(true, true);
        counters.add(&counter("a", 5.0, 1.0));

        let mut buf = Vec::new();
        let num = counters.process(&mut buf, 1_000, 1, &formatter());
        assert_eq!(num, 2);

        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains("stats.a 5 1000\n"));
        assert!(output.contains("stats_counts.a 5 1000\n"));
    }

    #[test]
    fn rate_divides_by_the_flush_interval() {
        let mut counters = Counters::new(true, false);
        counters.add(&counter("a", 30.0, 1.0));

        let mut buf = Vec::new();
        let num = counters.process(&mut buf, 1_000, 10, &formatter());
        assert_eq!(num, 1);

        let output = String::from_utf8(buf).unwrap();
        assert_eq!(output, "stats.a 3 1000\n");
    }
}
