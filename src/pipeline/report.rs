use serde::Serialize;

use crate::db::UpsertOutcome;
use crate::error::{ErrorKind, SyncError};
use crate::sink::SinkOutcome;

/// A message that could not be fetched or decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub id: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ItemFailure {
    pub fn from_error(id: &str, error: &SyncError) -> Self {
        Self {
            id: id.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Counters for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub pages: usize,
    pub listed: usize,
    /// Deliveries taken off the channel, successful or not.
    pub received: usize,
    pub fetched: usize,
    pub fetch_failures: usize,
    pub decode_failures: usize,
    pub displayed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub cancelled_tasks: usize,
    pub cancelled: bool,
    pub failures: Vec<ItemFailure>,
}

impl RunReport {
    pub fn stored(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }

    pub fn has_item_failures(&self) -> bool {
        self.fetch_failures > 0 || self.decode_failures > 0
    }

    pub(crate) fn merge_consumer(&mut self, consumer: ConsumerReport) {
        self.received = consumer.received;
        self.fetched = consumer.fetched;
        self.fetch_failures = consumer.fetch_failures;
        self.decode_failures = consumer.decode_failures;
        self.displayed = consumer.displayed;
        self.inserted = consumer.inserted;
        self.updated = consumer.updated;
        self.unchanged = consumer.unchanged;
        self.failures = consumer.failures;
    }
}

/// What the consumer task hands back when the channel is drained.
#[derive(Debug, Default)]
pub(crate) struct ConsumerReport {
    pub received: usize,
    pub fetched: usize,
    pub fetch_failures: usize,
    pub decode_failures: usize,
    pub displayed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failures: Vec<ItemFailure>,
    /// Set when the sink failed fatally; the consumer stopped reading.
    pub fatal: Option<SyncError>,
}

impl ConsumerReport {
    pub fn record_failure(&mut self, id: &str, error: &SyncError) {
        match error.kind() {
            ErrorKind::Fetch => self.fetch_failures += 1,
            ErrorKind::Decode => self.decode_failures += 1,
            _ => {}
        }
        self.failures.push(ItemFailure::from_error(id, error));
    }

    pub fn record_outcome(&mut self, outcome: SinkOutcome) {
        if outcome.displayed {
            self.displayed += 1;
        }
        match outcome.stored {
            Some(UpsertOutcome::Inserted) => self.inserted += 1,
            Some(UpsertOutcome::Updated) => self.updated += 1,
            Some(UpsertOutcome::Unchanged) => self.unchanged += 1,
            None => {}
        }
    }
}
