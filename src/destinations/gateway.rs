//! The HTTP metrics-gateway writer.
//!
//! Consumes the same outbound queue as the Graphite writer, but re-parses
//! each formatted buffer back into structured metrics, wraps them in a
//! snappy-compressed msgpack batch, and POSTs them to the gateway with a
//! bearer token. Transport errors and non-2xx responses are retried
//! forever with jittered exponential backoff; ingestion upstream is never
//! stalled by a struggling gateway thanks to the bounded outbound queue.

use std::fmt::Write as _;
use std::io::Write as _;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use snafu::Snafu;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::backoff::ExponentialBackoff;
use crate::config::Configuration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const BACKOFF_FACTOR: f64 = 1.5;
const ERROR_BODY_LIMIT: usize = 300;

const GATEWAY_CONTENT_TYPE: &str = "rt-metric-binary-snappy";

/// One metric as the gateway ingests it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricData {
    pub id: String,
    pub org_id: i32,
    pub name: String,
    pub interval: i64,
    pub value: f64,
    pub unit: String,
    pub time: i64,
    pub mtype: String,
    pub tags: Vec<String>,
}

/// A formatted buffer that could not be re-parsed into gateway metrics.
#[derive(Debug, Snafu)]
pub enum BufferParseError {
    #[snafu(display("'{line}': need 3 fields"))]
    NeedThreeFields { line: String },

    #[snafu(display("'{line}': invalid value"))]
    InvalidValue { line: String },

    #[snafu(display("'{line}': invalid timestamp"))]
    InvalidTimestamp { line: String },
}

#[derive(Debug, Snafu)]
enum DeliveryError {
    #[snafu(display("transport error: {source}"))]
    Transport { source: reqwest::Error },

    #[snafu(display("http {status} - {body}"))]
    Http { status: StatusCode, body: String },
}

/// Re-parses a Graphite-formatted buffer into gateway metrics.
///
/// Each line is `<path> <value> <unix_ts>`; the path splits on `;` into the
/// metric name and its tags, which are sorted. A single bad line fails the
/// whole buffer so a batch is never partially sent.
pub fn parse_buffer(buf: &[u8], org_id: i32, interval_secs: u64) -> Result<Vec<MetricData>, BufferParseError> {
    let text = String::from_utf8_lossy(buf);
    let mut metrics = Vec::new();

    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(BufferParseError::NeedThreeFields {
                line: line.to_string(),
            });
        }

        let value: f64 = fields[1].parse().map_err(|_| BufferParseError::InvalidValue {
            line: line.to_string(),
        })?;
        let timestamp: u32 = fields[2].parse().map_err(|_| BufferParseError::InvalidTimestamp {
            line: line.to_string(),
        })?;

        let mut segments = fields[0].split(';');
        let name = segments.next().unwrap_or_default().to_string();
        let mut tags: Vec<String> = segments.map(str::to_string).collect();
        tags.sort_unstable();

        let interval = interval_secs as i64;
        let id = metric_id(org_id, &name, "unknown", "gauge", interval, &tags);

        metrics.push(MetricData {
            id,
            org_id,
            name,
            interval,
            value,
            unit: "unknown".to_string(),
            time: i64::from(timestamp),
            mtype: "gauge".to_string(),
            tags,
        });
    }

    Ok(metrics)
}

/// Computes the deterministic metric id: the org id, a dot, and a 128-bit
/// hex digest over the identity fields (name, unit, mtype, interval, sorted
/// tags).
fn metric_id(org_id: i32, name: &str, unit: &str, mtype: &str, interval: i64, tags: &[String]) -> String {
    let interval_str = interval.to_string();
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    for part in [unit, mtype, interval_str.as_str()] {
        hasher.update(b"\n");
        hasher.update(part.as_bytes());
    }
    for tag in tags {
        hasher.update(b"\n");
        hasher.update(tag.as_bytes());
    }
    let digest = hasher.finalize();

    let mut id = format!("{}.", org_id);
    for byte in &digest[..16] {
        let _ = write!(id, "{:02x}", byte);
    }
    id
}

/// Encodes a batch as msgpack (with field names) and snappy frame
/// compression, ready to POST.
pub fn encode_batch(metrics: &[MetricData]) -> Bytes {
    let payload = rmp_serde::to_vec_named(metrics).expect("msgpack encoding of a well-formed batch must not fail");

    let mut encoder = snap::write::FrameEncoder::new(Vec::with_capacity(payload.len() / 2));
    encoder
        .write_all(&payload)
        .expect("writing to an in-memory snappy encoder must not fail");
    Bytes::from(
        encoder
            .into_inner()
            .expect("flushing an in-memory snappy encoder must not fail"),
    )
}

pub struct GatewayWriter {
    tsdbgw_addr: String,
    api_key: String,
    org_id: i32,
    interval_secs: u64,
    client: reqwest::Client,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
}

impl GatewayWriter {
    pub fn new(configuration: &Configuration, outbound_rx: mpsc::Receiver<Vec<u8>>) -> Result<Self, anyhow::Error> {
        // TLS verification is skipped by design: operators point this at
        // gateways on infrastructure they control. HTTP/2 is disabled for
        // gateway compatibility, and a single idle connection matches the
        // single writer worker.
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .http1_only()
            .pool_max_idle_per_host(1)
            .build()
            .context("failed to build gateway HTTP client")?;

        Ok(Self {
            tsdbgw_addr: configuration.tsdbgw_addr.clone(),
            api_key: configuration.tsdbgw_api_key.clone(),
            org_id: configuration.org_id,
            interval_secs: configuration.flush_interval,
            client,
            outbound_rx,
        })
    }

    pub async fn run(mut self) {
        while let Some(buf) = self.outbound_rx.recv().await {
            let metrics = match parse_buffer(&buf, self.org_id, self.interval_secs) {
                Ok(metrics) => metrics,
                Err(e) => {
                    error!(error = %e, "Failed to re-parse flush buffer. Dropping it.");
                    continue;
                }
            };
            if metrics.is_empty() {
                continue;
            }

            let body = encode_batch(&metrics);
            self.deliver(body, metrics.len()).await;
        }

        debug!("Outbound queue closed. Stopping gateway writer.");
    }

    /// Delivers one batch, retrying forever. The encoded body is retained
    /// and reused for every attempt.
    async fn deliver(&self, body: Bytes, num_metrics: usize) {
        let backoff = ExponentialBackoff::with_jitter(MIN_BACKOFF, MAX_BACKOFF, BACKOFF_FACTOR);
        let mut error_count = 0u32;

        loop {
            let started = Instant::now();
            match self.send_once(body.clone()).await {
                Ok(()) => {
                    debug!(num_metrics, took = ?started.elapsed(), "Sent metrics batch to gateway.");
                    return;
                }
                Err(e) => {
                    let delay = backoff.get_backoff_duration(error_count);
                    error_count = error_count.saturating_add(1);
                    info!(
                        error = %e,
                        retry_in = ?delay,
                        took = ?started.elapsed(),
                        "Failed to submit batch to gateway. Will retry."
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn send_once(&self, body: Bytes) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.tsdbgw_addr)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, GATEWAY_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|source| DeliveryError::Transport { source })?;

        let status = response.status();
        if status.is_success() {
            let _ = response.bytes().await;
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let body = body.chars().take(ERROR_BODY_LIMIT).collect();
        Err(DeliveryError::Http { status, body })
    }
}
