//! The aggregation state machine and flush pipeline.
//!
//! One task owns the `(counters, gauges, timers)` triple and is its sole
//! mutator. Incoming metric batches are applied in arrival order; an
//! aligned ticker hands the state off as a [`FlushSnapshot`] and installs
//! fresh aggregates in the same step, so no metric can be dropped or
//! double-counted across a flush boundary. A dedicated pipeline task
//! formats snapshots in strict flush order and feeds the outbound queue.

use std::collections::HashMap;
use std::time::Duration;

use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

mod counters;
pub use self::counters::Counters;

mod gauges;
pub use self::gauges::Gauges;

mod timers;
pub use self::timers::{Percentile, Timers};

use crate::bus::Topic;
use crate::config::Configuration;
use crate::format::{instrument, Formatter};
use crate::metric::{Metric, MetricBatch, MetricKind};
use crate::time::{aligned_sleep, get_unix_timestamp};

/// The event broadcast on the events topic after every flush hand-off.
pub const FLUSH_EVENT: &str = "flush";

/// The aggregate triple handed off to the flush pipeline.
///
/// Ownership transfers out of the aggregator at hand-off; the aggregator
/// installs fresh aggregates in the same step and retains no references.
pub struct FlushSnapshot {
    pub counters: Counters,
    pub gauges: Gauges,
    pub timers: Timers,

    /// Budget for formatting and enqueueing this snapshot: one flush
    /// interval past the hand-off.
    pub deadline: tokio::time::Instant,
}

/// The per-observation internal accounting counters, one per metric type.
///
/// All three are seeded at zero at every window start so they appear in the
/// flush even when no traffic of that type arrived.
pub struct InternalMetrics {
    one_counter: Metric,
    one_gauge: Metric,
    one_timer: Metric,
}

impl InternalMetrics {
    pub fn new(prefix_internal: &str) -> Self {
        let bucket = |kind: MetricKind| {
            format!(
                "{}direction_is_in.statsd_type_is_{}.mtype_is_count.unit_is_Metric",
                prefix_internal,
                kind.as_statsd_type()
            )
        };

        Self {
            one_counter: Metric::internal_counter(bucket(MetricKind::Counter), 1.0),
            one_gauge: Metric::internal_counter(bucket(MetricKind::Gauge), 1.0),
            one_timer: Metric::internal_counter(bucket(MetricKind::Timer), 1.0),
        }
    }

    fn for_kind(&self, kind: MetricKind) -> &Metric {
        match kind {
            MetricKind::Counter => &self.one_counter,
            MetricKind::Gauge => &self.one_gauge,
            MetricKind::Timer => &self.one_timer,
        }
    }

    fn seeds(&self) -> impl Iterator<Item = Metric> + '_ {
        [&self.one_counter, &self.one_gauge, &self.one_timer]
            .into_iter()
            .map(|metric| {
                let mut seed = metric.clone();
                seed.value = 0.0;
                seed
            })
    }
}

/// The mutable aggregate triple for one flush window.
pub struct AggregationState {
    pub counters: Counters,
    pub gauges: Gauges,
    pub timers: Timers,
}

impl AggregationState {
    /// Applies one metric: timers and gauges go to their aggregates,
    /// everything else to the counters, and the matching internal
    /// direction counter is incremented.
    pub fn apply(&mut self, metric: &Metric, internal: &InternalMetrics) {
        match metric.kind {
            MetricKind::Timer => self.timers.add(metric),
            MetricKind::Gauge => self.gauges.add(metric),
            MetricKind::Counter => self.counters.add(metric),
        }
        self.counters.add(internal.for_kind(metric.kind));
    }
}

/// The single task that owns the aggregation state.
pub struct Aggregator {
    flush_interval: Duration,
    flush_rates: bool,
    flush_counts: bool,
    percentiles: Vec<Percentile>,
    internal: InternalMetrics,
    metrics_rx: mpsc::Receiver<MetricBatch>,
    snapshots_tx: mpsc::Sender<FlushSnapshot>,
    events: Topic<String>,
}

impl Aggregator {
    pub fn new(
        configuration: &Configuration, metrics_rx: mpsc::Receiver<MetricBatch>,
        snapshots_tx: mpsc::Sender<FlushSnapshot>, events: Topic<String>,
    ) -> Self {
        Self {
            flush_interval: configuration.flush_interval(),
            flush_rates: configuration.flush_rates,
            flush_counts: configuration.flush_counts,
            percentiles: Percentile::from_values(&configuration.percentiles),
            internal: InternalMetrics::new(&configuration.prefix_internal()),
            metrics_rx,
            snapshots_tx,
            events,
        }
    }

    /// Builds a fresh window: empty counters and timers, gauges seeded with
    /// the carried-forward values, internal counters seeded at zero.
    fn fresh_state(&self, carried_gauges: HashMap<String, f64>) -> AggregationState {
        let mut state = AggregationState {
            counters: Counters::new(self.flush_rates, self.flush_counts),
            gauges: Gauges::with_values(carried_gauges),
            timers: Timers::new(self.percentiles.clone()),
        };
        for seed in self.internal.seeds() {
            state.counters.add(&seed);
        }
        state
    }

    async fn hand_off(&self, state: AggregationState) {
        let snapshot = FlushSnapshot {
            counters: state.counters,
            gauges: state.gauges,
            timers: state.timers,
            deadline: tokio::time::Instant::now() + self.flush_interval,
        };
        if self.snapshots_tx.send(snapshot).await.is_err() {
            error!("Flush pipeline gone. Dropping snapshot.");
        }
        self.events.publish(FLUSH_EVENT.to_string()).await;
    }

    /// Runs until the shutdown signal fires, then performs one final flush.
    pub async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut state = self.fresh_state(HashMap::new());
        let mut flush = Box::pin(aligned_sleep(self.flush_interval));

        debug!("Aggregator started.");

        loop {
            select! {
                _ = &mut flush => {
                    let carried_gauges = state.gauges.values().clone();
                    let outgoing = std::mem::replace(&mut state, self.fresh_state(carried_gauges));
                    self.hand_off(outgoing).await;
                    flush.set(aligned_sleep(self.flush_interval));
                }
                maybe_batch = self.metrics_rx.recv() => match maybe_batch {
                    Some(batch) => {
                        for metric in batch.iter() {
                            state.apply(metric, &self.internal);
                        }
                    }
                    None => {
                        debug!("Metric channel closed. Stopping aggregator.");
                        break;
                    }
                },
                _ = &mut shutdown_rx => {
                    info!("Caught termination signal. Performing final flush...");
                    break;
                }
            }
        }

        self.hand_off(state).await;
        debug!("Aggregator stopped.");
    }
}

/// Formats a snapshot into one Graphite buffer, instrumenting each
/// sub-formatter with its duration and emitted point count.
pub fn format_snapshot(snapshot: FlushSnapshot, formatter: &Formatter, now: u64, interval_secs: u64) -> Vec<u8> {
    let FlushSnapshot {
        counters,
        gauges,
        mut timers,
        ..
    } = snapshot;

    let mut buf = Vec::new();
    instrument(
        &mut buf,
        formatter,
        now,
        interval_secs,
        MetricKind::Counter.as_statsd_type(),
        |buf| counters.process(buf, now, interval_secs, formatter),
    );
    instrument(
        &mut buf,
        formatter,
        now,
        interval_secs,
        MetricKind::Gauge.as_statsd_type(),
        |buf| gauges.process(buf, now, formatter),
    );
    instrument(
        &mut buf,
        formatter,
        now,
        interval_secs,
        MetricKind::Timer.as_statsd_type(),
        |buf| timers.process(buf, now, interval_secs, formatter),
    );
    buf
}

/// Consumes snapshots in strict flush order, formats them, and feeds the
/// outbound queue.
pub async fn run_flush_pipeline(
    mut snapshots_rx: mpsc::Receiver<FlushSnapshot>, outbound_tx: mpsc::Sender<Vec<u8>>, formatter: Formatter,
    interval_secs: u64,
) {
    while let Some(snapshot) = snapshots_rx.recv().await {
        let deadline = snapshot.deadline;
        let now = get_unix_timestamp();
        let buf = format_snapshot(snapshot, &formatter, now, interval_secs);

        if tokio::time::Instant::now() > deadline {
            warn!("Flush snapshot missed its formatting deadline.");
        }
        if outbound_tx.send(buf).await.is_err() {
            debug!("Outbound queue closed. Stopping flush pipeline.");
            return;
        }
    }
}
