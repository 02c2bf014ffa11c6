//! Reporting supervisor: feeds the delivery channel and owns reconnection
//!
//! One task, one network operation at a time. Each session:
//!
//! 1. connect the delivery channel
//! 2. claim the spool into the replay queue
//! 3. send replay records (paced), then live records, idling when both are empty
//!
//! A connection failure spools every unconfirmed record plus live arrivals
//! for the backoff window and starts a new session. Any other failure puts
//! the in-flight records back at the front of the replay queue and retries
//! after the same backoff. Cancellation spools whatever is undelivered so the
//! next start resumes it.

use crate::config::ReporterConfig;
use crate::delivery::{ChannelStats, Connector, DeliveryChannel, DeliveryError};
use crate::spool::{DiskSpool, SpoolWriter};
use crate::types::MeasurementRecord;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pacing and backoff durations
#[derive(Debug, Clone)]
pub struct ReporterTimings {
    pub replay_pacing: Duration,
    pub idle_poll: Duration,
    pub reconnect_backoff: Duration,
    pub spool_pop_wait: Duration,
}

impl From<&ReporterConfig> for ReporterTimings {
    fn from(config: &ReporterConfig) -> Self {
        Self {
            replay_pacing: Duration::from_millis(config.replay_pacing_ms),
            idle_poll: Duration::from_millis(config.idle_poll_ms),
            reconnect_backoff: Duration::from_secs(config.reconnect_backoff_secs),
            spool_pop_wait: Duration::from_millis(config.spool_pop_wait_ms),
        }
    }
}

impl Default for ReporterTimings {
    fn default() -> Self {
        Self::from(&ReporterConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ReporterStats {
    pub sessions: u64,
    pub connection_failures: u64,
    pub unexpected_failures: u64,
    pub replayed: u64,
    pub live_sent: u64,
    pub spooled: u64,
    pub spool_write_failures: u64,
    pub channel: ChannelStats,
}

pub struct Reporter<C: Connector> {
    channel: DeliveryChannel<C>,
    live: UnboundedReceiver<MeasurementRecord>,
    spool: DiskSpool,
    replay: VecDeque<MeasurementRecord>,
    timings: ReporterTimings,
    cancel: CancellationToken,
    /// Batch id that carries the last claimed record, once the replay queue is empty
    replay_fence: Option<u64>,
    stats: ReporterStats,
}

impl<C: Connector> Reporter<C> {
    pub fn new(
        channel: DeliveryChannel<C>,
        live: UnboundedReceiver<MeasurementRecord>,
        spool: DiskSpool,
        timings: ReporterTimings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            live,
            spool,
            replay: VecDeque::new(),
            timings,
            cancel,
            replay_fence: None,
            stats: ReporterStats::default(),
        }
    }

    /// Recover the replay file, report until cancelled, then spool what is
    /// left and close the channel.
    pub async fn run(mut self) -> ReporterStats {
        match self.spool.recover_claimed() {
            Ok(records) => self.replay.extend(records),
            Err(e) => error!(error = %e, "Failed to read replay file, its records stay on disk"),
        }

        self.report().await;
        self.disconnect().await;

        let stats = self.stats();
        info!(
            sessions = stats.sessions,
            replayed = stats.replayed,
            live_sent = stats.live_sent,
            spooled = stats.spooled,
            "Reporter stopped"
        );
        stats
    }

    /// Session loop. Returns only on cancellation.
    pub async fn report(&mut self) {
        while !self.cancel.is_cancelled() {
            match self.session().await {
                Ok(()) => {}
                Err(e) if e.is_connection_failure() => {
                    self.stats.connection_failures += 1;
                    warn!(
                        error = %e,
                        backoff_secs = self.timings.reconnect_backoff.as_secs_f64(),
                        "Collection server unreachable, spooling"
                    );
                    self.channel.disconnect().await;
                    self.replay_fence = None;
                    let carried = self.channel.take_unacknowledged();
                    self.write_to_file(self.timings.reconnect_backoff, carried)
                        .await;
                }
                Err(e) => {
                    self.stats.unexpected_failures += 1;
                    error!(
                        error = %e,
                        backoff_secs = self.timings.reconnect_backoff.as_secs_f64(),
                        "Unexpected delivery failure, retrying after backoff"
                    );
                    self.channel.disconnect().await;
                    self.replay_fence = None;
                    let carried = self.channel.take_unacknowledged();
                    for record in carried.into_iter().rev() {
                        self.replay.push_front(record);
                    }
                    pause(&self.cancel, self.timings.reconnect_backoff).await;
                }
            }
        }
    }

    async fn session(&mut self) -> Result<(), DeliveryError> {
        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            result = self.channel.connect() => {
                result?;
                true
            }
        };
        if !connected {
            return Ok(());
        }
        self.stats.sessions += 1;

        self.load_backlog();
        info!(replay = self.replay.len(), "Reporting session started");

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            if let Some(record) = self.replay.pop_front() {
                if !self.deliver(record).await? {
                    return Ok(());
                }
                self.stats.replayed += 1;
                self.note_replay_progress();
                self.release_if_confirmed();
                pause(&self.cancel, self.timings.replay_pacing).await;
                continue;
            }

            match self.live.try_recv() {
                Ok(record) => {
                    if !self.deliver(record).await? {
                        return Ok(());
                    }
                    self.stats.live_sent += 1;
                    self.release_if_confirmed();
                    continue;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }

            self.release_if_confirmed();
            pause(&self.cancel, self.timings.idle_poll).await;
        }
    }

    /// `Ok(false)` when cancelled mid-send; the record is already in the
    /// channel and comes back through `take_unacknowledged`.
    async fn deliver(&mut self, record: MeasurementRecord) -> Result<bool, DeliveryError> {
        tokio::select! {
            biased;
            result = self.channel.send(record) => result.map(|()| true),
            _ = self.cancel.cancelled() => Ok(false),
        }
    }

    /// Claim the spool into the replay queue, behind anything still queued.
    fn load_backlog(&mut self) {
        match self.spool.claim() {
            Ok(records) if records.is_empty() => {}
            Ok(records) => {
                info!(
                    claimed = records.len(),
                    queued = self.replay.len(),
                    "Loaded spooled records for replay"
                );
                self.replay.extend(records);
                self.replay_fence = None;
            }
            Err(e) => warn!(error = %e, "Failed to claim spool, retrying next session"),
        }
        self.note_replay_progress();
    }

    fn note_replay_progress(&mut self) {
        if self.replay_fence.is_some() || !self.replay.is_empty() || !self.spool.has_claimed() {
            return;
        }
        let counter = self.channel.message_counter();
        let fence = if self.channel.outgoing_len() > 0 {
            counter + 1
        } else {
            counter
        };
        debug!(fence, "Replay queue drained");
        self.replay_fence = Some(fence);
    }

    /// Drop the replay file once the batch holding the last claimed record
    /// and every batch before it are acknowledged.
    fn release_if_confirmed(&mut self) {
        let Some(fence) = self.replay_fence else {
            return;
        };
        if self.channel.message_counter() < fence {
            return;
        }
        if matches!(self.channel.pending().oldest_id(), Some(id) if id <= fence) {
            return;
        }
        match self.spool.release_claimed() {
            Ok(()) => {
                info!(fence, "All replayed records confirmed");
                self.replay_fence = None;
            }
            Err(e) => warn!(error = %e, "Failed to remove replay file"),
        }
    }

    /// Spool `carried`, then every live record that arrives within `duration`.
    /// Records that cannot be written stay in the replay queue.
    pub async fn write_to_file(
        &mut self,
        duration: Duration,
        carried: Vec<MeasurementRecord>,
    ) -> usize {
        let deadline = Instant::now() + duration;
        let mut writer = match self.spool.appender() {
            Ok(writer) => Some(writer),
            Err(e) => {
                error!(error = %e, "Cannot open spool, keeping records in memory");
                None
            }
        };

        let mut written = 0usize;
        for record in carried {
            written += self.spool_one(&mut writer, record);
        }

        let mut live_open = true;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if !live_open {
                pause(&self.cancel, deadline - now).await;
                break;
            }

            let wait = self.timings.spool_pop_wait.min(deadline - now);
            let popped = tokio::select! {
                _ = self.cancel.cancelled() => break,
                popped = tokio::time::timeout(wait, self.live.recv()) => popped,
            };
            match popped {
                Ok(Some(record)) => written += self.spool_one(&mut writer, record),
                Ok(None) => live_open = false,
                Err(_) => {}
            }
        }

        if written > 0 {
            info!(written, pending = self.spool.pending_count().unwrap_or(0), "Records spooled");
        }
        written
    }

    fn spool_one(&mut self, writer: &mut Option<SpoolWriter>, record: MeasurementRecord) -> usize {
        if let Some(w) = writer.as_mut() {
            match w.write(&record) {
                Ok(()) => {
                    self.stats.spooled += 1;
                    return 1;
                }
                Err(e) => warn!(error = %e, id = %record.id(), "Spool write failed, keeping record in memory"),
            }
        }
        self.stats.spool_write_failures += 1;
        self.replay.push_back(record);
        0
    }

    /// Close the channel and spool in-flight, replay and queued live records.
    pub async fn disconnect(&mut self) {
        self.channel.disconnect().await;

        let mut records = self.channel.take_unacknowledged();
        records.extend(self.replay.drain(..));
        while let Ok(record) = self.live.try_recv() {
            records.push(record);
        }
        if records.is_empty() {
            if let Err(e) = self.spool.release_claimed() {
                warn!(error = %e, "Failed to remove replay file");
            }
            return;
        }

        let total = records.len();
        match self.spool.append(&records) {
            Ok(written) => {
                self.stats.spooled += written as u64;
                // Everything unconfirmed is now in the active spool
                if let Err(e) = self.spool.release_claimed() {
                    warn!(error = %e, "Failed to remove replay file");
                }
                self.replay_fence = None;
                info!(spooled = written, "Undelivered records spooled for next start");
            }
            Err(e) => {
                error!(error = %e, records = total, "Failed to spool undelivered records on shutdown");
            }
        }
    }

    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    pub fn stats(&self) -> ReporterStats {
        ReporterStats {
            channel: self.channel.stats(),
            ..self.stats
        }
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliverySettings;
    use crate::types::PlugMeasurement;
    use async_trait::async_trait;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    /// Server that never answers.
    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        type Stream = DuplexStream;

        async fn connect(&self) -> Result<DuplexStream, DeliveryError> {
            Err(DeliveryError::ConnectionRefused("test".into()))
        }

        fn endpoint(&self) -> String {
            "unreachable".to_string()
        }
    }

    fn record(device: &str) -> MeasurementRecord {
        MeasurementRecord::Plug(PlugMeasurement::new(device, chrono::Utc::now()))
    }

    fn timings() -> ReporterTimings {
        ReporterTimings {
            replay_pacing: Duration::from_millis(5),
            idle_poll: Duration::from_millis(5),
            reconnect_backoff: Duration::from_millis(60),
            spool_pop_wait: Duration::from_millis(10),
        }
    }

    fn reporter(
        dir: &std::path::Path,
    ) -> (
        Reporter<Unreachable>,
        mpsc::UnboundedSender<MeasurementRecord>,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let channel = DeliveryChannel::new(Unreachable, DeliverySettings::default());
        let spool = DiskSpool::open(dir).unwrap();
        (
            Reporter::new(channel, rx, spool, timings(), cancel.clone()),
            tx,
            cancel,
        )
    }

    #[tokio::test]
    async fn test_write_to_file_spools_carried_then_live() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut reporter, tx, _cancel) = reporter(tmp.path());

        tx.send(record("live-1")).unwrap();
        tx.send(record("live-2")).unwrap();
        let written = reporter
            .write_to_file(Duration::from_millis(50), vec![record("carried")])
            .await;

        assert_eq!(written, 3);
        let spool = DiskSpool::open(tmp.path()).unwrap();
        let devices: Vec<String> = spool
            .claim()
            .unwrap()
            .iter()
            .map(|r| r.device_id().to_string())
            .collect();
        assert_eq!(devices, vec!["carried", "live-1", "live-2"]);
    }

    #[tokio::test]
    async fn test_write_to_file_stops_on_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut reporter, _tx, cancel) = reporter(tmp.path());

        cancel.cancel();
        let started = Instant::now();
        reporter.write_to_file(Duration::from_secs(30), Vec::new()).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unreachable_server_spools_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let (reporter, tx, cancel) = reporter(tmp.path());

        for i in 0..4 {
            tx.send(record(&format!("r{}", i))).unwrap();
        }
        let handle = tokio::spawn(reporter.run());
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        let stats = handle.await.unwrap();

        assert!(stats.connection_failures >= 1);
        assert_eq!(stats.sessions, 0);
        let spool = DiskSpool::open(tmp.path()).unwrap();
        assert_eq!(spool.pending_count().unwrap(), 4);
        assert!(!spool.has_claimed());
    }
}
