//! Pending-ack table
//!
//! Holds every batch sent but not yet acknowledged, keyed by message id.
//! Entries leave only through a matching ack or an explicit hand-back to the
//! supervisor after a connection failure.

use crate::types::MeasurementRecord;
use std::collections::BTreeMap;

/// Records sent together under one message id
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementBatch {
    pub id: u64,
    pub records: Vec<MeasurementRecord>,
}

#[derive(Debug, Default)]
pub struct PendingAckTable {
    batches: BTreeMap<u64, MeasurementBatch>,
}

impl PendingAckTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch as in flight. A batch re-inserted under the same id
    /// replaces the earlier entry.
    pub fn insert(&mut self, batch: MeasurementBatch) {
        self.batches.insert(batch.id, batch);
    }

    pub fn get(&self, id: u64) -> Option<&MeasurementBatch> {
        self.batches.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.batches.contains_key(&id)
    }

    /// Remove on acknowledgment.
    pub fn remove(&mut self, id: u64) -> Option<MeasurementBatch> {
        self.batches.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Lowest id still awaiting an ack
    pub fn oldest_id(&self) -> Option<u64> {
        self.batches.keys().next().copied()
    }

    /// Ids in ascending order
    pub fn ids(&self) -> Vec<u64> {
        self.batches.keys().copied().collect()
    }

    /// Empty the table, returning all records in message-id order.
    pub fn drain_records(&mut self) -> Vec<MeasurementRecord> {
        std::mem::take(&mut self.batches)
            .into_values()
            .flat_map(|batch| batch.records)
            .collect()
    }
}
