//! A StatsD-protocol metric aggregation daemon.
//!
//! Application clients fire single-metric UDP datagrams at the daemon,
//! which aggregates them into counters, gauges, and timer summaries over an
//! aligned flush interval and forwards the result to one of two downstream
//! sinks: a Graphite line-protocol endpoint or an HTTP metrics gateway
//! accepting snappy-compressed msgpack batches. A plain-text TCP admin
//! interface serves sampling-rate advice, per-bucket traffic counts, live
//! line taps, and flush synchronization for coordinated restarts.
//!
//! The pipeline is a chain of single-owner tasks connected by bounded
//! channels: the UDP listener parses datagrams and fans batches out to the
//! aggregator and the stats monitor; the aggregator is the sole mutator of
//! the aggregate triple and hands it off wholesale at every aligned flush
//! tick; a formatter task renders snapshots in strict flush order into the
//! outbound queue; the active writer delivers at-least-once. When the
//! pipeline can't keep up, the UDP read loop stalls and traffic drops at
//! the kernel, never silently inside the daemon.

pub mod admin;
pub mod aggregate;
pub mod bus;
pub mod codec;
pub mod config;
pub mod destinations;
pub mod format;
pub mod logging;
pub mod metric;
pub mod monitor;
pub mod time;
pub mod udp;

use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::admin::AdminContext;
use crate::aggregate::{run_flush_pipeline, Aggregator};
use crate::bus::Topic;
use crate::config::Configuration;
use crate::destinations::{GatewayWriter, GraphiteWriter};
use crate::format::Formatter;
use crate::monitor::StatsMonitor;
use crate::udp::UdpListener;

/// Flushed-but-unwritten buffers the writer may fall behind by before the
/// flush pipeline blocks.
const OUTBOUND_QUEUE_CAPACITY: usize = 1000;

/// The number of flush snapshots allowed in flight to the formatter.
const SNAPSHOT_QUEUE_CAPACITY: usize = 8;

/// The daemon.
pub struct StatsDaemon {
    configuration: Configuration,
}

impl StatsDaemon {
    pub fn new(configuration: Configuration) -> Self {
        Self { configuration }
    }

    /// Runs the daemon until SIGINT or SIGTERM, then performs a final flush
    /// and gives the writer one flush interval to drain.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let configuration = self.configuration;
        configuration.validate()?;

        info!(instance = %configuration.instance, "statsdaemon starting.");

        let formatter = Formatter::from_configuration(&configuration);

        let (metrics_tx, metrics_rx) = mpsc::channel(configuration.max_unprocessed);
        let (amounts_tx, amounts_rx) = mpsc::channel(configuration.max_unprocessed);
        let (snapshots_tx, snapshots_rx) = mpsc::channel(SNAPSHOT_QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (stats_requests_tx, stats_requests_rx) = mpsc::channel(1);

        let valid_lines = Topic::spawn("valid_lines");
        let invalid_lines = Topic::spawn("invalid_lines");
        let events = Topic::spawn("events");

        // UDP ingest.
        let listen_addr = configuration
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", configuration.listen_addr))?;
        let socket = udp::bind(listen_addr)
            .with_context(|| format!("failed to bind UDP listener on '{}'", configuration.listen_addr))?;
        let udp_listener = UdpListener::new(
            socket,
            configuration.prefix_internal(),
            metrics_tx,
            amounts_tx,
            valid_lines.clone(),
            invalid_lines.clone(),
        );
        tokio::spawn(udp_listener.run());

        // Admin interface. Failing to bind it is fatal.
        let admin_listener = TcpListener::bind(&configuration.admin_addr)
            .await
            .with_context(|| format!("failed to bind admin listener on '{}'", configuration.admin_addr))?;
        let admin_context = Arc::new(AdminContext {
            stats_requests: stats_requests_tx,
            valid_lines,
            invalid_lines,
            events: events.clone(),
        });
        tokio::spawn(admin::run_admin_listener(admin_listener, Arc::clone(&admin_context)));

        // Stats monitor, answering the admin introspection commands.
        let stats_monitor = StatsMonitor::new(configuration.max_timers_per_s, amounts_rx, stats_requests_rx);
        tokio::spawn(stats_monitor.run(admin_context));

        // Flush pipeline and the one active downstream writer.
        let flush_pipeline = tokio::spawn(run_flush_pipeline(
            snapshots_rx,
            outbound_tx,
            formatter.clone(),
            configuration.flush_interval,
        ));
        let writer = if configuration.enable_graphite {
            info!("Starting Graphite writer.");
            let graphite = GraphiteWriter::new(configuration.graphite_addr.clone(), formatter, outbound_rx);
            tokio::spawn(graphite.run())
        } else {
            info!("Starting gateway writer.");
            let gateway = GatewayWriter::new(&configuration, outbound_rx)?;
            tokio::spawn(gateway.run())
        };

        // SIGINT/SIGTERM trigger the aggregator's final flush.
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            let _ = shutdown_tx.send(());
        });

        // The aggregator owns the aggregation state and runs on this task.
        let aggregator = Aggregator::new(&configuration, metrics_rx, snapshots_tx, events);
        aggregator.run(shutdown_rx).await;

        // The final snapshot is in flight: closing the snapshot channel lets
        // the pipeline drain into the writer, which gets one flush interval
        // to deliver before the process exits.
        let drain = async {
            let _ = flush_pipeline.await;
            let _ = writer.await;
        };
        if tokio::time::timeout(configuration.flush_interval(), drain)
            .await
            .is_err()
        {
            warn!("Shutdown drain timed out before the writer finished.");
        }

        Ok(())
    }
}
