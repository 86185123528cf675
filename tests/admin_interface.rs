//! Admin interface tests over real sockets: the TCP REPL, the stats
//! monitor's request/resume dance, live taps, and flush synchronization.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use statsdaemon::admin::{run_admin_listener, AdminContext};
use statsdaemon::bus::Topic;
use statsdaemon::codec::parse_line;
use statsdaemon::metric::{Metric, MetricBatch};
use statsdaemon::monitor::StatsMonitor;
use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    addr: SocketAddr,
    valid_lines: Topic<Bytes>,
    invalid_lines: Topic<Bytes>,
    events: Topic<String>,
    amounts_tx: mpsc::Sender<MetricBatch>,
}

async fn spawn_admin(max_timers_per_s: u64) -> Harness {
    let valid_lines = Topic::spawn("valid_lines");
    let invalid_lines = Topic::spawn("invalid_lines");
    let events = Topic::spawn("events");
    let (amounts_tx, amounts_rx) = mpsc::channel(16);
    let (stats_requests_tx, stats_requests_rx) = mpsc::channel(1);

    let context = Arc::new(AdminContext {
        stats_requests: stats_requests_tx,
        valid_lines: valid_lines.clone(),
        invalid_lines: invalid_lines.clone(),
        events: events.clone(),
    });

    tokio::spawn(StatsMonitor::new(max_timers_per_s, amounts_rx, stats_requests_rx).run(Arc::clone(&context)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_admin_listener(listener, context));

    Harness {
        addr,
        valid_lines,
        invalid_lines,
        events,
        amounts_tx,
    }
}

async fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
    BufReader::new(TcpStream::connect(addr).await.unwrap())
}

async fn send(client: &mut BufReader<TcpStream>, command: &str) {
    client.get_mut().write_all(command.as_bytes()).await.unwrap();
}

async fn read_line(client: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    timeout(IO_TIMEOUT, client.read_line(&mut line))
        .await
        .expect("timed out reading a reply line")
        .unwrap();
    line
}

/// Reads a full help menu off the connection: the `commands:` heading, then
/// everything up to the blank line that terminates it.
async fn read_help(client: &mut BufReader<TcpStream>) {
    assert_eq!(read_line(client).await, "commands:\n");
    loop {
        if read_line(client).await == "\n" {
            break;
        }
    }
}

/// Publishes a message over and over until aborted, bridging the gap
/// between a client sending a subscribe-style command and its handler
/// actually registering on the topic.
fn keep_publishing<T: Clone + Send + 'static>(topic: Topic<T>, message: T) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            topic.publish(message.clone()).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
}

#[tokio::test]
async fn help_prints_the_menu() {
    let harness = spawn_admin(1_000).await;
    let mut client = connect(harness.addr).await;

    send(&mut client, "help\n").await;
    assert_eq!(read_line(&mut client).await, "commands:\n");
}

#[tokio::test]
async fn unknown_commands_get_an_error_and_the_menu() {
    let harness = spawn_admin(1_000).await;
    let mut client = connect(harness.addr).await;

    send(&mut client, "bogus\n").await;
    assert_eq!(read_line(&mut client).await, "unknown command\n");
    assert_eq!(read_line(&mut client).await, "commands:\n");
}

#[tokio::test]
async fn wrong_arity_is_an_invalid_request() {
    let harness = spawn_admin(1_000).await;
    let mut client = connect(harness.addr).await;

    send(&mut client, "sample_rate\n").await;
    assert_eq!(read_line(&mut client).await, "invalid request\n");
    read_help(&mut client).await;

    send(&mut client, "metric_stats with extra args\n").await;
    assert_eq!(read_line(&mut client).await, "invalid request\n");
}

#[tokio::test]
async fn sample_rate_advises_and_resumes_the_connection() {
    let harness = spawn_admin(2).await;

    // Ten observations of `q` at client-side sampling 0.1: the monitor
    // books 100 submitted packets.
    let observation = parse_line(b"q:1|ms|@0.1").unwrap().unwrap();
    let batch: Vec<Metric> = (0..10).map(|_| observation.clone()).collect();
    harness.amounts_tx.send(Arc::new(batch)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = connect(harness.addr).await;
    send(&mut client, "sample_rate q\n").await;

    let reply = read_line(&mut client).await;
    let fields: Vec<&str> = reply.split_whitespace().collect();
    assert_eq!(fields[0], "q");
    let ideal: f64 = fields[1].parse().unwrap();
    let submitted_per_s: f64 = fields[2].parse().unwrap();

    // 100 submissions over (elapsed + 10)s, queried moments after ingest.
    assert!(
        submitted_per_s > 9.0 && submitted_per_s <= 10.0,
        "submitted_per_s was {submitted_per_s}"
    );
    // Over the ceiling of 2/s, so the advice is to sample down.
    assert!((ideal - 2.0 / submitted_per_s).abs() < 1e-6, "ideal was {ideal}");

    // The monitor hands the connection back: it keeps serving commands.
    send(&mut client, "help\n").await;
    assert_eq!(read_line(&mut client).await, "commands:\n");
}

#[tokio::test]
async fn metric_stats_resumes_the_connection() {
    let harness = spawn_admin(1_000).await;
    let mut client = connect(harness.addr).await;

    // The previous window is empty right after startup, so the reply is
    // empty; the connection must still come back for more commands. The
    // pause keeps the follow-up out of the hand-off to the monitor.
    send(&mut client, "metric_stats\n").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    send(&mut client, "help\n").await;
    assert_eq!(read_line(&mut client).await, "commands:\n");
}

#[tokio::test]
async fn wait_flush_writes_the_event_and_closes() {
    let harness = spawn_admin(1_000).await;
    let mut client = connect(harness.addr).await;

    send(&mut client, "wait_flush\n").await;
    let publisher = keep_publishing(harness.events.clone(), "flush".to_string());

    let mut received = String::new();
    timeout(IO_TIMEOUT, client.read_to_string(&mut received))
        .await
        .expect("timed out waiting for the flush event")
        .unwrap();
    publisher.abort();

    // Exactly one event is written, then the connection closes.
    assert_eq!(received, "flush\n");
}

#[tokio::test]
async fn peek_valid_streams_tapped_lines() {
    let harness = spawn_admin(1_000).await;
    let mut client = connect(harness.addr).await;

    send(&mut client, "peek_valid\n").await;
    let publisher = keep_publishing(harness.valid_lines.clone(), Bytes::from_static(b"a:1|c"));

    assert_eq!(read_line(&mut client).await, "a:1|c\n");
    publisher.abort();
}

#[tokio::test]
async fn peek_invalid_streams_the_raw_bad_lines() {
    let harness = spawn_admin(1_000).await;
    let mut client = connect(harness.addr).await;

    send(&mut client, "peek_invalid\n").await;
    let publisher = keep_publishing(
        harness.invalid_lines.clone(),
        Bytes::from_static(b"bad_line_no_colon"),
    );

    assert_eq!(read_line(&mut client).await, "bad_line_no_colon\n");
    publisher.abort();
}
