//! Shared fixtures: in-memory pipes standing in for the TLS stream, and a
//! scripted collection server on the far end.

#![allow(dead_code)]

use async_trait::async_trait;
use fieldlink::delivery::{Connector, DeliveryError};
use fieldlink::protocol::{self, write_frame, AckMessage, FrameError, FrameReader, WireMessage};
use fieldlink::types::{MeasurementRecord, PlugMeasurement};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::io::DuplexStream;

pub const MAX_FRAME: usize = 64 * 1024;

/// Hands out one queued pipe per connect, then refuses.
pub struct ScriptedConnector {
    pipes: Mutex<VecDeque<DuplexStream>>,
}

impl ScriptedConnector {
    pub fn new(pipes: Vec<DuplexStream>) -> Self {
        Self {
            pipes: Mutex::new(pipes.into()),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> Result<DuplexStream, DeliveryError> {
        self.pipes
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| DeliveryError::ConnectionRefused("no server listening".into()))
    }

    fn endpoint(&self) -> String {
        "scripted".to_string()
    }
}

/// Client end for the connector, server end for [`FakeServer`].
pub fn pipe() -> (DuplexStream, FakeServer) {
    let (client, server) = tokio::io::duplex(MAX_FRAME * 4);
    (client, FakeServer::new(server))
}

pub struct FakeServer {
    stream: DuplexStream,
    reader: FrameReader,
}

impl FakeServer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            reader: FrameReader::new(MAX_FRAME),
        }
    }

    /// Next client message, or `None` once the client has hung up.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        match self.reader.read_frame(&mut self.stream).await {
            Ok(body) => Some(protocol::decode(&body).unwrap()),
            Err(FrameError::Closed) => None,
            Err(e) => panic!("fake server read failed: {e}"),
        }
    }

    pub async fn send(&mut self, message: WireMessage) {
        let body = protocol::encode(&message).unwrap();
        self.send_raw(&body).await;
    }

    pub async fn send_raw(&mut self, body: &[u8]) {
        write_frame(&mut self.stream, body, MAX_FRAME).await.unwrap();
    }

    pub async fn ack(&mut self, acknowledged_id: u64, wanted_id: Option<u64>) {
        self.send(ack(acknowledged_id, wanted_id)).await;
    }

    /// Read until the client closes, returning everything received.
    pub async fn drain(&mut self) -> Vec<WireMessage> {
        let mut messages = Vec::new();
        while let Some(message) = self.recv().await {
            messages.push(message);
        }
        messages
    }
}

pub fn ack(acknowledged_id: u64, wanted_id: Option<u64>) -> WireMessage {
    WireMessage::Ack(AckMessage {
        acknowledged_id,
        wanted_id,
    })
}

pub fn record(device: &str) -> MeasurementRecord {
    MeasurementRecord::Plug(PlugMeasurement::new(device, chrono::Utc::now()))
}

pub fn devices(records: &[MeasurementRecord]) -> Vec<String> {
    records.iter().map(|r| r.device_id().to_string()).collect()
}

/// Batch id and device ids, panicking on any other message kind.
pub fn expect_batch(message: Option<WireMessage>) -> (u64, Vec<String>) {
    match message {
        Some(WireMessage::Batch { id, records }) => (id, devices(&records)),
        other => panic!("expected batch, got {:?}", other),
    }
}
