//! Windowed delivery channel
//!
//! Records accumulate in an outgoing buffer until a full window is present;
//! the window then goes out as one batch under the next message id. After
//! each batch the channel waits up to the ack timeout for one server
//! message and dispatches it:
//!
//! - **ack**: drop the acknowledged batch from the pending table; if the ack
//!   names a `wanted_id`, retransmit that batch (or send a no-data marker
//!   when it is no longer held) and handle the next response the same way.
//! - **request**: answer `GET_MSG_COUNTER` with the current counter.
//! - anything else, malformed or unknown: log and drop.
//!
//! A batch enters the pending table before its bytes are written, so a
//! failure mid-write still leaves it recoverable via
//! [`DeliveryChannel::take_unacknowledged`].

use super::{Connector, DeliveryError, MeasurementBatch, PendingAckTable};
use crate::config::{defaults, DeliveryConfig};
use crate::protocol::{
    self, write_frame, AckMessage, FrameError, FrameReader, RequestMessage, WireMessage,
    GET_MSG_COUNTER,
};
use crate::types::MeasurementRecord;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

/// Protocol parameters for one channel
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub window_size: usize,
    pub ack_timeout: Duration,
    pub max_frame_bytes: usize,
    /// Retransmissions answered back-to-back before further `wanted_id`s are ignored
    pub max_retransmit_chain: usize,
}

impl From<&DeliveryConfig> for DeliverySettings {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            window_size: config.window_size,
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            max_frame_bytes: config.max_frame_bytes,
            max_retransmit_chain: defaults::MAX_RETRANSMIT_CHAIN,
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

/// Channel health counters
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ChannelStats {
    pub connected: bool,
    pub connections: u64,
    pub batches_sent: u64,
    pub acks_received: u64,
    pub unknown_acks: u64,
    pub retransmissions: u64,
    pub no_data_sent: u64,
    pub ack_timeouts: u64,
    pub requests_answered: u64,
    /// Windows split because they did not fit in one frame
    pub oversized_splits: u64,
    /// Records larger than a frame on their own
    pub oversized_dropped: u64,
    /// Malformed, oversized or unexpected inbound messages
    pub dropped_messages: u64,
}

struct Connection<S> {
    stream: S,
    reader: FrameReader,
}

pub struct DeliveryChannel<C: Connector> {
    connector: C,
    conn: Option<Connection<C::Stream>>,
    settings: DeliverySettings,
    outgoing: Vec<MeasurementRecord>,
    pending: PendingAckTable,
    /// Last message id assigned. Survives reconnects.
    msg_counter: u64,
    stats: ChannelStats,
}

impl<C: Connector> DeliveryChannel<C> {
    pub fn new(connector: C, settings: DeliverySettings) -> Self {
        let outgoing = Vec::with_capacity(settings.window_size);
        Self {
            connector,
            conn: None,
            settings,
            outgoing,
            pending: PendingAckTable::new(),
            msg_counter: 0,
            stats: ChannelStats::default(),
        }
    }

    /// Open the stream. A no-op when already connected.
    pub async fn connect(&mut self) -> Result<(), DeliveryError> {
        if self.conn.is_some() {
            return Ok(());
        }

        let endpoint = self.connector.endpoint();
        tracing::info!(endpoint = %endpoint, "Connecting to collection server");

        let stream = self.connector.connect().await?;
        self.conn = Some(Connection {
            stream,
            reader: FrameReader::new(self.settings.max_frame_bytes),
        });
        self.stats.connections += 1;

        tracing::info!(
            endpoint = %endpoint,
            pending = self.pending.len(),
            msg_counter = self.msg_counter,
            "Collection server connection established"
        );
        Ok(())
    }

    /// Close the stream. Safe to call repeatedly; only the first call
    /// after a connect does anything.
    pub async fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.stream.shutdown().await;
            tracing::info!("Collection server connection closed");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Buffer one record; transmit a batch once the window is full.
    pub async fn send(&mut self, record: MeasurementRecord) -> Result<(), DeliveryError> {
        self.outgoing.push(record);
        if self.outgoing.len() < self.settings.window_size {
            tracing::trace!(buffered = self.outgoing.len(), "Record buffered");
            return Ok(());
        }

        let records: Vec<MeasurementRecord> =
            self.outgoing.drain(..self.settings.window_size).collect();
        self.transmit(records).await
    }

    /// Send a window as one batch, or as several smaller ones when it does
    /// not fit in a frame. Ids are only assigned to batches that fit.
    async fn transmit(&mut self, records: Vec<MeasurementRecord>) -> Result<(), DeliveryError> {
        let mut queue = VecDeque::from([records]);

        while let Some(mut records) = queue.pop_front() {
            let id = self.msg_counter + 1;
            let body = protocol::encode_batch(id, &records)?;
            let max = self.settings.max_frame_bytes;

            if body.len() > max {
                if records.len() > 1 {
                    let tail = records.split_off(records.len() / 2);
                    self.stats.oversized_splits += 1;
                    tracing::warn!(
                        len = body.len(),
                        max,
                        records = records.len() + tail.len(),
                        "Batch exceeds frame limit, splitting"
                    );
                    queue.push_front(tail);
                    queue.push_front(records);
                } else {
                    self.stats.oversized_dropped += 1;
                    tracing::error!(
                        len = body.len(),
                        max,
                        device = records.first().map(|r| r.device_id()).unwrap_or_default(),
                        "Single record exceeds frame limit, dropping it"
                    );
                }
                continue;
            }

            self.msg_counter = id;
            let count = records.len();
            self.pending.insert(MeasurementBatch { id, records });
            self.write_body(&body).await?;
            self.stats.batches_sent += 1;
            tracing::debug!(id, records = count, pending = self.pending.len(), "Batch sent");

            if let Some(response) = self.receive_response(id).await? {
                self.handle_response(response).await?;
            }
        }
        Ok(())
    }

    /// Write one batch frame.
    pub async fn send_batch(
        &mut self,
        id: u64,
        records: &[MeasurementRecord],
    ) -> Result<(), DeliveryError> {
        let body = protocol::encode_batch(id, records)?;
        self.write_body(&body).await?;
        self.stats.batches_sent += 1;
        tracing::debug!(id, records = records.len(), pending = self.pending.len(), "Batch sent");
        Ok(())
    }

    /// Wait up to the ack timeout for one server frame.
    ///
    /// `Ok(None)` on timeout; the batch stays pending.
    pub async fn receive_response(&mut self, id: u64) -> Result<Option<Vec<u8>>, DeliveryError> {
        let timeout = self.settings.ack_timeout;
        let deadline = Instant::now() + timeout;
        let conn = self.conn.as_mut().ok_or(DeliveryError::NotConnected)?;

        loop {
            match tokio::time::timeout_at(deadline, conn.reader.read_frame(&mut conn.stream)).await {
                Ok(Ok(body)) => return Ok(Some(body)),
                Ok(Err(FrameError::TooLarge { len, max })) => {
                    self.stats.dropped_messages += 1;
                    tracing::warn!(id, len, max, "Oversized frame from server, skipping");
                }
                Ok(Err(e)) => {
                    let err = DeliveryError::from(e);
                    if err.is_connection_failure() {
                        self.conn = None;
                        tracing::warn!(id, error = %err, "Connection lost while awaiting response");
                    }
                    return Err(err);
                }
                Err(_) => {
                    self.stats.ack_timeouts += 1;
                    tracing::warn!(
                        id,
                        timeout_ms = timeout.as_millis() as u64,
                        pending = self.pending.len(),
                        "No response from server within ack timeout"
                    );
                    return Ok(None);
                }
            }
        }
    }

    /// Dispatch a server response and any responses to retransmissions it
    /// triggers. The chain runs as a loop and is capped at
    /// `max_retransmit_chain`; past the cap acks are still applied but
    /// retransmission requests are ignored.
    pub async fn handle_response(&mut self, body: Vec<u8>) -> Result<(), DeliveryError> {
        let mut body = body;
        let mut depth = 0usize;

        loop {
            let allow_retransmit = depth < self.settings.max_retransmit_chain;
            match self.dispatch(&body, allow_retransmit).await? {
                Some(next) => {
                    body = next;
                    depth += 1;
                }
                None => return Ok(()),
            }
        }
    }

    /// Returns the follow-up response when a retransmission was sent.
    async fn dispatch(
        &mut self,
        body: &[u8],
        allow_retransmit: bool,
    ) -> Result<Option<Vec<u8>>, DeliveryError> {
        let message = match protocol::decode(body) {
            Ok(message) => message,
            Err(e) => {
                self.stats.dropped_messages += 1;
                tracing::warn!(error = %e, bytes = body.len(), "Dropping malformed server message");
                return Ok(None);
            }
        };

        match message {
            WireMessage::Ack(ack) => self.handle_ack(ack, allow_retransmit).await,
            WireMessage::Request(request) => {
                self.handle_request(request).await?;
                Ok(None)
            }
            other => {
                self.stats.dropped_messages += 1;
                tracing::warn!(kind = other.kind(), "Unexpected message from server, dropping");
                Ok(None)
            }
        }
    }

    /// Apply an ack, then serve its `wanted_id` if any.
    pub async fn handle_ack(
        &mut self,
        ack: AckMessage,
        allow_retransmit: bool,
    ) -> Result<Option<Vec<u8>>, DeliveryError> {
        if self.pending.remove(ack.acknowledged_id).is_some() {
            self.stats.acks_received += 1;
            tracing::debug!(
                id = ack.acknowledged_id,
                pending = self.pending.len(),
                "Batch acknowledged"
            );
        } else {
            self.stats.unknown_acks += 1;
            tracing::warn!(id = ack.acknowledged_id, "Ack for unknown message id, ignoring");
        }

        let Some(wanted) = ack.wanted_id else {
            return Ok(None);
        };

        if !allow_retransmit {
            tracing::warn!(
                wanted,
                limit = self.settings.max_retransmit_chain,
                "Retransmission chain limit reached, ignoring request"
            );
            return Ok(None);
        }

        let records = match self.pending.get(wanted) {
            Some(batch) => batch.records.clone(),
            None => {
                tracing::warn!(wanted, "Server wants a batch no longer held, sending no-data marker");
                self.write_message(&WireMessage::NoData { id: wanted }).await?;
                self.stats.no_data_sent += 1;
                return Ok(None);
            }
        };

        tracing::info!(wanted, records = records.len(), "Retransmitting batch on server request");
        self.send_batch(wanted, &records).await?;
        self.stats.retransmissions += 1;
        self.receive_response(wanted).await
    }

    /// Answer a server query. Unsupported kinds are logged and dropped.
    pub async fn handle_request(&mut self, mut request: RequestMessage) -> Result<(), DeliveryError> {
        if request.request_kind != GET_MSG_COUNTER {
            self.stats.dropped_messages += 1;
            tracing::warn!(kind = %request.request_kind, "Unsupported server request, dropping");
            return Ok(());
        }

        request.response = Some(serde_json::Value::from(self.msg_counter));
        self.write_message(&WireMessage::Request(request)).await?;
        self.stats.requests_answered += 1;
        tracing::debug!(msg_counter = self.msg_counter, "Answered message counter request");
        Ok(())
    }

    /// Hand back every record the server has not confirmed: pending batches
    /// in id order, then the partial outgoing window. Both are left empty.
    pub fn take_unacknowledged(&mut self) -> Vec<MeasurementRecord> {
        let mut records = self.pending.drain_records();
        records.append(&mut self.outgoing);
        records
    }

    /// Nothing sent is awaiting an ack.
    pub fn all_acknowledged(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> &PendingAckTable {
        &self.pending
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    pub fn message_counter(&self) -> u64 {
        self.msg_counter
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            connected: self.conn.is_some(),
            ..self.stats
        }
    }

    async fn write_message(&mut self, message: &WireMessage) -> Result<(), DeliveryError> {
        let body = protocol::encode(message)?;
        self.write_body(&body).await
    }

    /// Write a frame; a connection failure returns the channel to disconnected.
    async fn write_body(&mut self, body: &[u8]) -> Result<(), DeliveryError> {
        let conn = self.conn.as_mut().ok_or(DeliveryError::NotConnected)?;
        if let Err(e) = write_frame(&mut conn.stream, body, self.settings.max_frame_bytes).await {
            let err = DeliveryError::from(e);
            if err.is_connection_failure() {
                self.conn = None;
                tracing::warn!(error = %err, "Connection lost while writing");
            }
            return Err(err);
        }
        Ok(())
    }
}
