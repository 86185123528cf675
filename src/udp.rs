//! The UDP ingest listener.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::bus::Topic;
use crate::codec::parse_line;
use crate::metric::{Metric, MetricBatch, MetricKind};

/// The largest datagram the listener will read.
pub const MAX_UDP_PACKET_SIZE: usize = 65_535;

/// Binds a UDP socket with address-reuse semantics, so multiple daemon
/// instances can share the port.
pub fn bind(listen_addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(listen_addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&listen_addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Reads datagrams, parses their lines, and fans the resulting batches out
/// to the aggregator and the stats monitor.
///
/// Every line, valid or invalid, is published to the matching tap topic as
/// a defensive copy of the raw bytes. Invalid lines additionally synthesize
/// an internal `invalid_line` counter metric so parse failures are never
/// silently discarded.
pub struct UdpListener {
    socket: UdpSocket,
    prefix_internal: String,
    metrics_tx: mpsc::Sender<MetricBatch>,
    amounts_tx: mpsc::Sender<MetricBatch>,
    valid_lines: Topic<Bytes>,
    invalid_lines: Topic<Bytes>,
}

impl UdpListener {
    pub fn new(
        socket: UdpSocket, prefix_internal: String, metrics_tx: mpsc::Sender<MetricBatch>,
        amounts_tx: mpsc::Sender<MetricBatch>, valid_lines: Topic<Bytes>, invalid_lines: Topic<Bytes>,
    ) -> Self {
        Self {
            socket,
            prefix_internal,
            metrics_tx,
            amounts_tx,
            valid_lines,
            invalid_lines,
        }
    }

    pub async fn run(self) {
        if let Ok(local_addr) = self.socket.local_addr() {
            info!(%local_addr, "UDP listener started.");
        }

        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, _peer)) => {
                    let batch: MetricBatch = Arc::new(self.process_datagram(&buf[..len]).await);

                    // Backpressure is intentional: when either consumer's
                    // channel is full, reads stop and further traffic drops
                    // at the kernel instead of silently inside the daemon.
                    if self.metrics_tx.send(Arc::clone(&batch)).await.is_err() {
                        break;
                    }
                    if self.amounts_tx.send(batch).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to read UDP datagram.");
                }
            }
        }
    }

    async fn process_datagram(&self, data: &[u8]) -> Vec<Metric> {
        let mut metrics = Vec::new();

        for line in data.split(|&b| b == b'\n') {
            match parse_line(line) {
                Ok(maybe_metric) => {
                    self.valid_lines.publish(Bytes::copy_from_slice(line)).await;
                    if let Some(metric) = maybe_metric {
                        metrics.push(metric);
                    }
                }
                Err(_) => {
                    self.invalid_lines.publish(Bytes::copy_from_slice(line)).await;
                    metrics.push(Metric {
                        bucket: format!(
                            "{}mtype_is_count.type_is_invalid_line.unit_is_Err",
                            self.prefix_internal
                        ),
                        value: 1.0,
                        kind: MetricKind::Counter,
                        sampling: 1.0,
                    });
                }
            }
        }

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        client: UdpSocket,
        metrics_rx: mpsc::Receiver<MetricBatch>,
        amounts_rx: mpsc::Receiver<MetricBatch>,
        valid_lines: Topic<Bytes>,
        invalid_lines: Topic<Bytes>,
    }

    async fn spawn_listener() -> Harness {
        let socket = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listen_addr = socket.local_addr().unwrap();

        let (metrics_tx, metrics_rx) = mpsc::channel(16);
        let (amounts_tx, amounts_rx) = mpsc::channel(16);
        let valid_lines = Topic::spawn("valid_lines");
        let invalid_lines = Topic::spawn("invalid_lines");

        let listener = UdpListener::new(
            socket,
            "internal.".to_string(),
            metrics_tx,
            amounts_tx,
            valid_lines.clone(),
            invalid_lines.clone(),
        );
        tokio::spawn(listener.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(listen_addr).await.unwrap();

        Harness {
            client,
            metrics_rx,
            amounts_rx,
            valid_lines,
            invalid_lines,
        }
    }

    #[tokio::test]
    async fn datagram_fans_out_to_both_channels() {
        let mut harness = spawn_listener().await;

        harness.client.send(b"a:1|c\nx:9|g").await.unwrap();

        let batch = harness.metrics_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].bucket, "a");
        assert_eq!(batch[1].bucket, "x");

        let amounts_batch = harness.amounts_rx.recv().await.unwrap();
        assert_eq!(amounts_batch.len(), 2);
    }

    #[tokio::test]
    async fn invalid_lines_are_counted_and_tapped() {
        let mut harness = spawn_listener().await;
        let mut invalid_tap = harness.invalid_lines.subscribe(8).await;

        harness.client.send(b"bad_line_no_colon").await.unwrap();

        let batch = harness.metrics_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch[0].bucket,
            "internal.mtype_is_count.type_is_invalid_line.unit_is_Err"
        );
        assert_eq!(batch[0].value, 1.0);

        assert_eq!(invalid_tap.recv().await.unwrap(), Bytes::from_static(b"bad_line_no_colon"));
    }

    #[tokio::test]
    async fn valid_lines_are_tapped_verbatim() {
        let mut harness = spawn_listener().await;
        let mut valid_tap = harness.valid_lines.subscribe(8).await;

        harness.client.send(b"a:1|c").await.unwrap();

        let _ = harness.metrics_rx.recv().await.unwrap();
        assert_eq!(valid_tap.recv().await.unwrap(), Bytes::from_static(b"a:1|c"));
    }
}
