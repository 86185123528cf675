//! Two-window traffic accounting for the admin interface.
//!
//! The monitor owns a `(current, previous)` pair of bucket→[`Amounts`] maps
//! that swap every 10 seconds, so an answer is always backed by at least
//! 10 seconds of samples (a single map would read near-zero right after a
//! swap). `sample_rate` sums both windows for the freshest estimate;
//! `metric_stats` reads only the completed previous window.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::debug;

use crate::admin::{handle_connection, AdminContext};
use crate::metric::{Metric, MetricBatch};

const WINDOW: Duration = Duration::from_secs(10);
const WINDOW_SECS: f64 = 10.0;

/// Per-bucket packet accounting.
///
/// `submitted` estimates what clients generated before sampling (each
/// observation contributes the truncated reciprocal of its sampling rate);
/// `seen` is what actually arrived.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Amounts {
    pub submitted: u64,
    pub seen: u64,
}

/// An introspection command forwarded from an admin connection.
pub enum StatsCommand {
    /// Sampling-rate advice for one bucket.
    SampleRate(String),
    /// Per-bucket traffic counts over the previous window.
    MetricStats,
}

/// A command plus the connection to answer on. The monitor computes the
/// reply and hands the connection back to a spawned admin handler, so it is
/// never blocked on socket I/O.
pub struct StatsRequest {
    pub command: StatsCommand,
    pub conn: TcpStream,
}

/// The single task that owns the two-window counters.
pub struct StatsMonitor {
    max_timers_per_s: u64,
    amounts_rx: mpsc::Receiver<MetricBatch>,
    requests_rx: mpsc::Receiver<StatsRequest>,
}

impl StatsMonitor {
    pub fn new(
        max_timers_per_s: u64, amounts_rx: mpsc::Receiver<MetricBatch>, requests_rx: mpsc::Receiver<StatsRequest>,
    ) -> Self {
        Self {
            max_timers_per_s,
            amounts_rx,
            requests_rx,
        }
    }

    pub async fn run(mut self, admin: Arc<AdminContext>) {
        let mut swap_tick = interval_at(Instant::now() + WINDOW, WINDOW);
        let mut current: HashMap<String, Amounts> = HashMap::new();
        let mut previous: HashMap<String, Amounts> = HashMap::new();
        let mut swap_ts = Instant::now();

        debug!("Stats monitor started.");

        loop {
            select! {
                _ = swap_tick.tick() => {
                    previous = std::mem::take(&mut current);
                    swap_ts = Instant::now();
                }
                maybe_batch = self.amounts_rx.recv() => match maybe_batch {
                    Some(batch) => record_batch(&mut current, &batch),
                    None => {
                        debug!("Amounts channel closed. Stopping stats monitor.");
                        return;
                    }
                },
                maybe_request = self.requests_rx.recv() => match maybe_request {
                    Some(request) => {
                        let reply = match request.command {
                            StatsCommand::SampleRate(bucket) => {
                                let (ideal, submitted_per_s) = compute_sample_rate(
                                    &current,
                                    &previous,
                                    &bucket,
                                    swap_ts.elapsed().as_secs_f64(),
                                    self.max_timers_per_s,
                                );
                                format!("{} {:.6} {:.6}\n", bucket, ideal, submitted_per_s).into_bytes()
                            }
                            StatsCommand::MetricStats => metric_stats_reply(&previous),
                        };
                        tokio::spawn(handle_connection(request.conn, Some(reply), Arc::clone(&admin)));
                    }
                    None => {
                        debug!("Request channel closed. Stopping stats monitor.");
                        return;
                    }
                },
            }
        }
    }
}

fn record_batch(current: &mut HashMap<String, Amounts>, batch: &[Metric]) {
    for metric in batch {
        let amounts = current.entry(metric.bucket.clone()).or_default();
        amounts.seen += 1;
        amounts.submitted += (1.0 / f64::from(metric.sampling)) as u64;
    }
}

/// Computes `(ideal_sample_rate, submitted_per_s)` for a bucket.
///
/// The interval is the age of the current window plus the full previous
/// window, matching the summed submissions. The ideal rate is the fraction
/// that would bring submissions down to `max_timers_per_s`, or 1 when the
/// bucket is already under the ceiling.
pub fn compute_sample_rate(
    current: &HashMap<String, Amounts>, previous: &HashMap<String, Amounts>, bucket: &str, elapsed_secs: f64,
    max_timers_per_s: u64,
) -> (f64, f64) {
    let interval = elapsed_secs + WINDOW_SECS;
    let submitted = current.get(bucket).map_or(0, |amounts| amounts.submitted)
        + previous.get(bucket).map_or(0, |amounts| amounts.submitted);
    let submitted_per_s = submitted as f64 / interval;

    let ideal_sample_rate = if submitted_per_s as u64 > max_timers_per_s {
        max_timers_per_s as f64 / submitted_per_s
    } else {
        1.0
    };

    (ideal_sample_rate, submitted_per_s)
}

fn metric_stats_reply(previous: &HashMap<String, Amounts>) -> Vec<u8> {
    let mut buf = Vec::new();
    for (bucket, amounts) in previous {
        let _ = writeln!(
            buf,
            "{} {:.6} {:.6}",
            bucket,
            amounts.submitted as f64 / WINDOW_SECS,
            amounts.seen as f64 / WINDOW_SECS
        );
    }
    buf
}
