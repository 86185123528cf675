use std::sync::Arc;

/// A batch of metrics parsed from a single datagram.
///
/// Batches are fanned out to both the aggregator and the stats monitor, so
/// they're reference-counted rather than cloned per consumer.
pub type MetricBatch = Arc<Vec<Metric>>;

/// A single parsed StatsD observation. Immutable after parse.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    /// The metric key namespace path (e.g. `app.requests;env=prod`).
    pub bucket: String,

    /// The observed value.
    pub value: f64,

    /// The metric type, from the wire modifier.
    pub kind: MetricKind,

    /// Client-declared subsampling factor, in `(0, 1]`. Counts are inflated
    /// by its reciprocal.
    pub sampling: f32,
}

impl Metric {
    /// Creates a counter observation at sampling rate 1, as used for the
    /// daemon's internal accounting metrics.
    pub fn internal_counter(bucket: String, value: f64) -> Self {
        Self {
            bucket,
            value,
            kind: MetricKind::Counter,
            sampling: 1.0,
        }
    }
}

/// The kinds of metrics carried by the StatsD protocol.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MetricKind {
    /// A summed value, scaled by the reciprocal of its sampling rate.
    Counter,
    /// A point-in-time value, last write wins.
    Gauge,
    /// A sampled distribution, summarized at flush time.
    Timer,
}

impl MetricKind {
    /// Maps a wire modifier (`c`, `g`, `ms`) to a kind.
    pub fn from_modifier(modifier: &str) -> Option<Self> {
        match modifier {
            "c" => Some(Self::Counter),
            "g" => Some(Self::Gauge),
            "ms" => Some(Self::Timer),
            _ => None,
        }
    }

    /// The type name used in internal metric namespacing.
    pub const fn as_statsd_type(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Timer => "timer",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifier_mapping() {
        assert_eq!(MetricKind::from_modifier("c"), Some(MetricKind::Counter));
        assert_eq!(MetricKind::from_modifier("g"), Some(MetricKind::Gauge));
        assert_eq!(MetricKind::from_modifier("ms"), Some(MetricKind::Timer));
        assert_eq!(MetricKind::from_modifier("h"), None);
        assert_eq!(MetricKind::from_modifier(""), None);
    }
}
