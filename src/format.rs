//! Graphite line-protocol formatting.
//!
//! Flushed aggregates are rendered into a single append-only buffer of
//! `<path> <value> <unix_ts>\n` lines. Each sub-formatter is instrumented:
//! its wall-time duration and emitted point count are appended to the same
//! buffer under the daemon's internal namespace.

use std::io::Write as _;
use std::time::Instant;

use crate::config::Configuration;

/// The prefix scheme applied to flushed metric paths.
#[derive(Clone, Debug)]
pub struct Formatter {
    /// Prefix for counter rate lines.
    pub prefix_rates: String,
    /// Prefix for counter count lines.
    pub prefix_counts: String,
    /// Prefix for gauge lines.
    pub prefix_gauges: String,
    /// Prefix for timer summary lines.
    pub prefix_timers: String,
    /// Namespace prefix for the daemon's own metrics.
    pub prefix_internal: String,
}

impl Formatter {
    /// Builds the formatter from the daemon configuration.
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            prefix_rates: configuration.prefix_rates.clone(),
            prefix_counts: configuration.prefix_counts.clone(),
            prefix_gauges: configuration.prefix_gauges.clone(),
            prefix_timers: configuration.prefix_timers.clone(),
            prefix_internal: configuration.prefix_internal(),
        }
    }

    /// The path of the gauge tracking how long a downstream send took.
    pub fn send_duration_path(&self) -> String {
        format!(
            "{}{}mtype_is_gauge.type_is_send.unit_is_ms",
            self.prefix_gauges, self.prefix_internal
        )
    }
}

/// Appends one Graphite line to the buffer.
pub fn write_point(buf: &mut Vec<u8>, path: &str, value: f64, timestamp: u64) {
    // Writing into a Vec<u8> cannot fail.
    let _ = writeln!(buf, "{} {} {}", path, value, timestamp);
}

/// Runs one sub-formatter and appends its instrumentation lines: a gauge for
/// the wall-time the formatting took, and a rate for the points it emitted.
pub fn instrument(
    buf: &mut Vec<u8>, formatter: &Formatter, now: u64, interval_secs: u64, name: &'static str,
    process: impl FnOnce(&mut Vec<u8>) -> u64,
) -> u64 {
    let started = Instant::now();
    let num_points = process(buf);
    let duration_ms = started.elapsed().as_secs_f64() * 1_000.0;

    let duration_path = format!(
        "{}{}statsd_type_is_{}.mtype_is_gauge.type_is_calculation.unit_is_ms",
        formatter.prefix_gauges, formatter.prefix_internal, name
    );
    write_point(buf, &duration_path, duration_ms, now);

    let rate_path = format!(
        "{}{}direction_is_out.statsd_type_is_{}.mtype_is_rate.unit_is_Metricps",
        formatter.prefix_rates, formatter.prefix_internal, name
    );
    write_point(buf, &rate_path, num_points as f64 / interval_secs as f64, now);

    num_points
}
