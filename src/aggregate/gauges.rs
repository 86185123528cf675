use std::collections::HashMap;

use crate::format::{write_point, Formatter};
use crate::metric::Metric;

/// Last-observed gauge values.
///
/// Within a flush interval the last write wins. Values carry forward across
/// flushes: the replacement map installed at flush hand-off is seeded with
/// the flushed values, so an untouched gauge re-emits its last known value
/// until overwritten.
#[derive(Clone, Debug, Default)]
pub struct Gauges {
    values: HashMap<String, f64>,
}

impl Gauges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a gauge map pre-seeded with carried-forward values.
    pub fn with_values(values: HashMap<String, f64>) -> Self {
        Self { values }
    }

    /// Records one observation, overwriting any prior value for the bucket.
    pub fn add(&mut self, metric: &Metric) {
        self.values.insert(metric.bucket.clone(), metric.value);
    }

    /// Gets the last-observed value for a bucket.
    pub fn get(&self, bucket: &str) -> Option<f64> {
        self.values.get(bucket).copied()
    }

    /// The full value map, used to seed the next interval's gauges.
    pub fn values(&self) -> &HashMap<String, f64> {
        &self.values
    }

    /// Formats every gauge into the buffer. Returns the number of points
    /// emitted.
    pub fn process(&self, buf: &mut Vec<u8>, now: u64, formatter: &Formatter) -> u64 {
        for (bucket, &value) in &self.values {
            let path = format!("{}{}", formatter.prefix_gauges, bucket);
            write_point(buf, &path, value, now);
        }
        self.values.len() as u64
    }
}
