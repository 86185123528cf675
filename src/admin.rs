//! The plain-text TCP admin interface.
//!
//! A line-oriented REPL for operators: introspection commands are answered
//! by the stats monitor (which hands the connection back here so it never
//! blocks on socket I/O), `peek_*` streams a live tap of the valid or
//! invalid line topics, and `wait_flush` parks the connection until the
//! next flush for coordinated restarts.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::bus::Topic;
use crate::monitor::{StatsCommand, StatsRequest};

const PEEK_QUEUE_CAPACITY: usize = 100;
const EVENTS_QUEUE_CAPACITY: usize = 10;

const HELP: &str = "\
commands:
    help                        show this menu
    sample_rate <metric key>    for the given metric, show:
                                <key> <ideal sample rate> <Pckt/s sent (estim)>
    metric_stats                in the past 10s interval, for every metric show:
                                <key> <Pckt/s sent (estim)> <Pckt/s received>
    peek_valid                  stream all valid lines seen in real time
                                until you disconnect or can't keep up.
    peek_invalid                stream all invalid lines seen in real time
                                until you disconnect or can't keep up.
    wait_flush                  after the next flush, writes 'flush' and closes the connection.
                                this is convenient to restart statsdaemon
                                with a minimal loss of data like so:
                                nc localhost 8126 <<< wait_flush && /sbin/restart statsdaemon

";

/// Handles shared by every admin connection.
pub struct AdminContext {
    pub stats_requests: mpsc::Sender<StatsRequest>,
    pub valid_lines: Topic<Bytes>,
    pub invalid_lines: Topic<Bytes>,
    pub events: Topic<String>,
}

/// Accepts admin connections and spawns a handler per connection.
///
/// The listener is bound by the caller, so a bind failure surfaces as a
/// fatal startup error rather than here.
pub async fn run_admin_listener(listener: TcpListener, context: Arc<AdminContext>) {
    if let Ok(local_addr) = listener.local_addr() {
        info!(%local_addr, "Admin listener started.");
    }

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_connection(stream, None, Arc::clone(&context)));
            }
            Err(e) => {
                error!(error = %e, "Failed to accept admin connection.");
            }
        }
    }
}

/// Runs one admin connection's read loop.
///
/// `write_first` carries a pending reply when the stats monitor hands a
/// connection back after answering an introspection command.
pub async fn handle_connection(stream: TcpStream, write_first: Option<Vec<u8>>, context: Arc<AdminContext>) {
    let mut reader = BufReader::new(stream);

    if let Some(reply) = write_first {
        if reader.get_mut().write_all(&reply).await.is_err() {
            return;
        }
    }

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Admin connection EOF. Closing.");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Failed to read admin command. Closing.");
                return;
            }
        }

        let command: Vec<&str> = line.split_whitespace().collect();
        debug!(command = %line.trim(), "Received admin command.");

        match command.split_first() {
            Some((&"help", _)) => {
                if write(reader.get_mut(), HELP.as_bytes()).await.is_err() {
                    return;
                }
            }
            Some((&"sample_rate", args)) => {
                if args.len() != 1 {
                    if invalid_request(reader.get_mut()).await.is_err() {
                        return;
                    }
                    continue;
                }
                let stats_command = StatsCommand::SampleRate(args[0].to_string());
                forward_to_monitor(reader.into_inner(), stats_command, &context).await;
                return;
            }
            Some((&"metric_stats", args)) => {
                if !args.is_empty() {
                    if invalid_request(reader.get_mut()).await.is_err() {
                        return;
                    }
                    continue;
                }
                forward_to_monitor(reader.into_inner(), StatsCommand::MetricStats, &context).await;
                return;
            }
            Some((&"peek_valid", _)) => {
                let lines = context.valid_lines.subscribe(PEEK_QUEUE_CAPACITY).await;
                if stream_lines(reader.get_mut(), lines).await.is_err() {
                    return;
                }
            }
            Some((&"peek_invalid", _)) => {
                let lines = context.invalid_lines.subscribe(PEEK_QUEUE_CAPACITY).await;
                if stream_lines(reader.get_mut(), lines).await.is_err() {
                    return;
                }
            }
            Some((&"wait_flush", _)) => {
                let mut events = context.events.subscribe(EVENTS_QUEUE_CAPACITY).await;
                if let Some(event) = events.recv().await {
                    let stream = reader.get_mut();
                    let _ = write(stream, event.as_bytes()).await;
                    let _ = write(stream, b"\n").await;
                }
                return;
            }
            _ => {
                let stream = reader.get_mut();
                if write(stream, b"unknown command\n").await.is_err()
                    || write(stream, HELP.as_bytes()).await.is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn forward_to_monitor(conn: TcpStream, command: StatsCommand, context: &AdminContext) {
    if context
        .stats_requests
        .send(StatsRequest { command, conn })
        .await
        .is_err()
    {
        debug!("Stats monitor gone. Closing admin connection.");
    }
}

async fn invalid_request(stream: &mut TcpStream) -> io::Result<()> {
    write(stream, b"invalid request\n").await?;
    write(stream, HELP.as_bytes()).await
}

/// Streams tapped lines to the client until the client can't be written to.
/// Nagle is disabled while streaming to bound per-line latency.
async fn stream_lines(stream: &mut TcpStream, mut lines: mpsc::Receiver<Bytes>) -> io::Result<()> {
    let _ = stream.set_nodelay(true);

    let result = async {
        while let Some(line) = lines.recv().await {
            stream.write_all(&line).await?;
            stream.write_all(b"\n").await?;
        }
        Ok(())
    }
    .await;

    let _ = stream.set_nodelay(false);
    result
}

async fn write(stream: &mut TcpStream, bytes: &[u8]) -> io::Result<()> {
    stream.write_all(bytes).await
}
