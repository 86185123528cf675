//! The Graphite TCP writer.
//!
//! Maintains at most one connection to the Graphite endpoint. The
//! connection slot is shared between the writer loop and a reconnect loop
//! that redials every two seconds whenever the slot is empty. Buffers are
//! never dropped: a failed write closes the connection and the same buffer
//! is retried once the slot is refilled, so delivery is at-least-once and
//! backpressure ripples up the bounded outbound queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt as _;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::format::{write_point, Formatter};
use crate::time::get_unix_timestamp;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);
const CONNECTION_POLL_INTERVAL: Duration = Duration::from_secs(1);

type ConnectionSlot = Arc<Mutex<Option<TcpStream>>>;

pub struct GraphiteWriter {
    graphite_addr: String,
    formatter: Formatter,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
}

impl GraphiteWriter {
    pub fn new(graphite_addr: String, formatter: Formatter, outbound_rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            graphite_addr,
            formatter,
            outbound_rx,
        }
    }

    pub async fn run(mut self) {
        let slot: ConnectionSlot = Arc::default();
        tokio::spawn(run_reconnect_loop(self.graphite_addr.clone(), Arc::clone(&slot)));

        while let Some(buf) = self.outbound_rx.recv().await {
            let (duration_ms, sent_at) = write_with_retry(&slot, &buf).await;
            debug!(len = buf.len(), "Wrote metrics payload to Graphite.");

            // Report how long the payload write took, as its own point.
            let mut line = Vec::new();
            write_point(&mut line, &self.formatter.send_duration_path(), duration_ms, sent_at);
            write_with_retry(&slot, &line).await;
        }

        debug!("Outbound queue closed. Stopping Graphite writer.");
    }
}

async fn run_reconnect_loop(graphite_addr: String, slot: ConnectionSlot) {
    let mut tick = interval(RECONNECT_INTERVAL);
    loop {
        tick.tick().await;

        let mut conn = slot.lock().await;
        if conn.is_none() {
            match TcpStream::connect(&graphite_addr).await {
                Ok(stream) => {
                    info!(%graphite_addr, "Now connected.");
                    *conn = Some(stream);
                }
                Err(e) => {
                    warn!(%graphite_addr, error = %e, "Dialing failed. Will retry.");
                }
            }
        }
    }
}

/// Writes the buffer, retrying forever: a write failure empties the
/// connection slot and the retry waits for the reconnect loop to refill it.
/// Returns the successful write's duration in milliseconds and its start
/// timestamp.
//
// TODO: a dead peer can absorb writes into socket buffers for a while before
// an error surfaces, so reconnection can lag the actual outage.
async fn write_with_retry(slot: &ConnectionSlot, buf: &[u8]) -> (f64, u64) {
    loop {
        wait_for_connection(slot).await;

        let sent_at = get_unix_timestamp();
        let started = Instant::now();

        let mut conn = slot.lock().await;
        if let Some(stream) = conn.as_mut() {
            match stream.write_all(buf).await {
                Ok(()) => {
                    return (started.elapsed().as_secs_f64() * 1_000.0, sent_at);
                }
                Err(e) => {
                    error!(error = %e, "Failed to write to Graphite. Will retry.");
                    *conn = None;
                }
            }
        }
    }
}

async fn wait_for_connection(slot: &ConnectionSlot) {
    loop {
        if slot.lock().await.is_some() {
            return;
        }
        tokio::time::sleep(CONNECTION_POLL_INTERVAL).await;
    }
}
