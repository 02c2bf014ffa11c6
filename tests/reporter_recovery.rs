//! Reporter Recovery Tests
//!
//! End-to-end behavior of the reporting supervisor against a scripted
//! server: backlog replay ordering and pacing, spooling on connection loss,
//! retry after a non-connection failure, replay-file recovery after a crash,
//! and spooling on shutdown.

mod common;

use async_trait::async_trait;
use common::{devices, expect_batch, pipe, record, FakeServer, ScriptedConnector};
use fieldlink::delivery::{Connector, DeliveryChannel, DeliveryError, DeliverySettings};
use fieldlink::reporter::{Reporter, ReporterStats, ReporterTimings};
use fieldlink::spool::DiskSpool;
use fieldlink::types::MeasurementRecord;
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const REPLAY_PACING: Duration = Duration::from_millis(30);

fn timings() -> ReporterTimings {
    ReporterTimings {
        replay_pacing: REPLAY_PACING,
        idle_poll: Duration::from_millis(10),
        reconnect_backoff: Duration::from_millis(50),
        spool_pop_wait: Duration::from_millis(10),
    }
}

struct Harness {
    live: mpsc::UnboundedSender<MeasurementRecord>,
    cancel: CancellationToken,
    handle: JoinHandle<ReporterStats>,
}

impl Harness {
    async fn stop(self) -> ReporterStats {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("reporter did not stop")
            .unwrap()
    }
}

fn settings(window_size: usize) -> DeliverySettings {
    DeliverySettings {
        window_size,
        ack_timeout: Duration::from_millis(100),
        max_frame_bytes: common::MAX_FRAME,
        max_retransmit_chain: 8,
    }
}

/// Start a reporter whose connector hands out `pipes` in order. `before_start`
/// records are queued on the live channel before the reporter runs.
fn start(
    dir: &Path,
    pipes: Vec<tokio::io::DuplexStream>,
    window_size: usize,
    before_start: &[&str],
) -> Harness {
    let (tx, rx) = mpsc::unbounded_channel();
    for device in before_start {
        tx.send(record(device)).unwrap();
    }
    let cancel = CancellationToken::new();
    let channel = DeliveryChannel::new(ScriptedConnector::new(pipes), settings(window_size));
    let spool = DiskSpool::open(dir).unwrap();
    let reporter = Reporter::new(channel, rx, spool, timings(), cancel.clone());
    Harness {
        live: tx,
        cancel,
        handle: tokio::spawn(reporter.run()),
    }
}

/// Ack every batch; report each batch's devices and arrival time.
fn acking_server(
    mut server: FakeServer,
) -> mpsc::UnboundedReceiver<(Vec<String>, Instant)> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(message) = server.recv().await {
            let (id, devices) = expect_batch(Some(message));
            server.ack(id, None).await;
            if tx.send((devices, Instant::now())).is_err() {
                break;
            }
        }
    });
    rx
}

async fn collect(
    rx: &mut mpsc::UnboundedReceiver<(Vec<String>, Instant)>,
    batches: usize,
) -> Vec<(Vec<String>, Instant)> {
    let mut received = Vec::new();
    while received.len() < batches {
        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("server did not receive enough batches")
            .expect("server closed early");
        received.push(next);
    }
    received
}

/// Pipe whose writes can be made to fail with an error that is not a
/// connection failure.
struct FlakyStream {
    inner: DuplexStream,
    fail_writes: bool,
}

impl AsyncRead for FlakyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FlakyStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail_writes {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "write refused",
            )));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

struct FlakyConnector {
    streams: Mutex<VecDeque<FlakyStream>>,
}

#[async_trait]
impl Connector for FlakyConnector {
    type Stream = FlakyStream;

    async fn connect(&self) -> Result<FlakyStream, DeliveryError> {
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| DeliveryError::ConnectionRefused("no server listening".into()))
    }

    fn endpoint(&self) -> String {
        "flaky".to_string()
    }
}

// ============================================================================
// Replay
// ============================================================================

#[tokio::test]
async fn spooled_backlog_replays_before_live_records() {
    let tmp = tempfile::tempdir().unwrap();
    DiskSpool::open(tmp.path())
        .unwrap()
        .append(&[record("s1"), record("s2"), record("s3")])
        .unwrap();

    let (client, server) = pipe();
    let mut received = acking_server(server);
    let harness = start(tmp.path(), vec![client], 1, &["l1", "l2"]);

    let batches = collect(&mut received, 5).await;
    let order: Vec<String> = batches.iter().flat_map(|(d, _)| d.clone()).collect();
    assert_eq!(order, vec!["s1", "s2", "s3", "l1", "l2"]);

    // Replayed records are paced
    for pair in batches[..3].windows(2) {
        let gap = pair[1].1.duration_since(pair[0].1);
        assert!(gap >= REPLAY_PACING / 2, "replay gap too short: {:?}", gap);
    }

    let stats = harness.stop().await;
    assert_eq!(stats.replayed, 3);
    assert_eq!(stats.live_sent, 2);
    assert_eq!(stats.sessions, 1);

    let spool = DiskSpool::open(tmp.path()).unwrap();
    assert_eq!(spool.pending_count().unwrap(), 0);
    assert!(!spool.has_claimed(), "Replay file released once every batch is acked");
}

#[tokio::test]
async fn replay_file_survives_crash_and_is_recovered() {
    let tmp = tempfile::tempdir().unwrap();
    {
        // Previous run claimed its backlog, then died before delivering it
        let spool = DiskSpool::open(tmp.path()).unwrap();
        spool.append(&[record("c1"), record("c2")]).unwrap();
        assert_eq!(devices(&spool.claim().unwrap()), vec!["c1", "c2"]);
        spool.append(&[record("a1")]).unwrap();
    }
    let spool = DiskSpool::open(tmp.path()).unwrap();
    assert!(spool.has_claimed());
    assert_eq!(spool.pending_count().unwrap(), 1);

    let (client, server) = pipe();
    let mut received = acking_server(server);
    let harness = start(tmp.path(), vec![client], 1, &[]);

    let batches = collect(&mut received, 3).await;
    let order: Vec<String> = batches.iter().flat_map(|(d, _)| d.clone()).collect();
    assert_eq!(order, vec!["c1", "c2", "a1"]);

    let stats = harness.stop().await;
    assert_eq!(stats.replayed, 3);
    assert!(!spool.has_claimed());
    assert_eq!(spool.pending_count().unwrap(), 0);
}

// ============================================================================
// Failure and Shutdown
// ============================================================================

#[tokio::test]
async fn connection_loss_spools_in_flight_and_live_records() {
    let tmp = tempfile::tempdir().unwrap();
    let (client, mut server) = pipe();

    // Read the first window, then vanish without acknowledging it
    let server_task = tokio::spawn(async move {
        let batch = expect_batch(server.recv().await);
        drop(server);
        batch
    });

    let harness = start(tmp.path(), vec![client], 3, &["r1", "r2", "r3", "r4"]);
    let (id, sent) = server_task.await.unwrap();
    assert_eq!((id, sent), (1, vec!["r1".into(), "r2".into(), "r3".into()]));

    harness.live.send(record("r5")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = harness.stop().await;

    assert_eq!(stats.sessions, 1);
    assert!(stats.connection_failures >= 1);

    let spool = DiskSpool::open(tmp.path()).unwrap();
    assert_eq!(
        devices(&spool.claim().unwrap()),
        vec!["r1", "r2", "r3", "r4", "r5"]
    );
}

#[tokio::test]
async fn shutdown_spools_pending_and_partial_window() {
    let tmp = tempfile::tempdir().unwrap();
    let (client, mut server) = pipe();

    // Accept batches but never acknowledge them
    let server_task = tokio::spawn(async move { server.drain().await });

    let harness = start(tmp.path(), vec![client], 2, &["p1", "p2", "p3"]);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = harness.stop().await;

    let seen = server_task.await.unwrap();
    assert_eq!(seen.len(), 1, "one full window was sent");
    assert_eq!(stats.channel.ack_timeouts, 1);
    assert!(!stats.channel.connected);

    let spool = DiskSpool::open(tmp.path()).unwrap();
    assert_eq!(devices(&spool.claim().unwrap()), vec!["p1", "p2", "p3"]);
}

#[tokio::test]
async fn unreachable_server_keeps_backlog_on_disk() {
    let tmp = tempfile::tempdir().unwrap();
    DiskSpool::open(tmp.path())
        .unwrap()
        .append(&[record("old")])
        .unwrap();

    let harness = start(tmp.path(), Vec::new(), 1, &["new"]);
    tokio::time::sleep(Duration::from_millis(150)).await;
    let stats = harness.stop().await;

    assert_eq!(stats.sessions, 0);
    assert!(stats.connection_failures >= 2, "retries after each backoff");

    let spool = DiskSpool::open(tmp.path()).unwrap();
    assert!(!spool.has_claimed());
    assert_eq!(devices(&spool.claim().unwrap()), vec!["old", "new"]);
}

#[tokio::test]
async fn unexpected_failure_resends_in_flight_records_first() {
    let tmp = tempfile::tempdir().unwrap();
    let (refusing, _refusing_peer) = tokio::io::duplex(common::MAX_FRAME);
    let (client, mut server) = pipe();
    let connector = FlakyConnector {
        streams: Mutex::new(VecDeque::from([
            FlakyStream {
                inner: refusing,
                fail_writes: true,
            },
            FlakyStream {
                inner: client,
                fail_writes: false,
            },
        ])),
    };

    let server_task = tokio::spawn(async move {
        let mut batches = Vec::new();
        while batches.len() < 2 {
            let batch = expect_batch(server.recv().await);
            server.ack(batch.0, None).await;
            batches.push(batch);
        }
        batches
    });

    let (tx, rx) = mpsc::unbounded_channel();
    for device in ["r1", "r2", "r3", "r4"] {
        tx.send(record(device)).unwrap();
    }
    let cancel = CancellationToken::new();
    let reporter = Reporter::new(
        DeliveryChannel::new(connector, settings(2)),
        rx,
        DiskSpool::open(tmp.path()).unwrap(),
        timings(),
        cancel.clone(),
    );
    let harness = Harness {
        live: tx,
        cancel,
        handle: tokio::spawn(reporter.run()),
    };

    let batches = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server did not receive both batches")
        .unwrap();
    // Id 1 went to the failed write; its records lead the next session
    assert_eq!(
        batches,
        vec![
            (2, vec!["r1".to_string(), "r2".to_string()]),
            (3, vec!["r3".to_string(), "r4".to_string()]),
        ]
    );

    let stats = harness.stop().await;
    assert_eq!(stats.unexpected_failures, 1);
    assert_eq!(stats.connection_failures, 0);
    assert_eq!(stats.sessions, 2);
    assert_eq!(stats.spooled, 0, "Unexpected failures never spool");

    let spool = DiskSpool::open(tmp.path()).unwrap();
    assert_eq!(spool.pending_count().unwrap(), 0);
    assert!(!spool.has_claimed());
}
