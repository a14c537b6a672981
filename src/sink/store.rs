use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::db::{Database, DbError, UpsertOutcome};
use crate::extract::ExtractedRecord;

/// Durable destination for extracted records.
///
/// The consumer task owns its store exclusively, so implementations only
/// need to be `Send`.
pub trait MessageStore: Send {
    fn upsert(&mut self, record: &ExtractedRecord) -> Result<UpsertOutcome, DbError>;
}

impl MessageStore for Database {
    fn upsert(&mut self, record: &ExtractedRecord) -> Result<UpsertOutcome, DbError> {
        self.upsert_message(record)
    }
}

/// Shared in-memory store with the same newer-wins rule as [`Database`].
/// Clones see the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<BTreeMap<String, ExtractedRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<ExtractedRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Snapshot ordered by id.
    pub fn records(&self) -> Vec<ExtractedRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

impl MessageStore for MemoryStore {
    fn upsert(&mut self, record: &ExtractedRecord) -> Result<UpsertOutcome, DbError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| DbError::Config("memory store lock poisoned".to_string()))?;

        match records.get_mut(&record.id) {
            None => {
                records.insert(record.id.clone(), record.clone());
                Ok(UpsertOutcome::Inserted)
            }
            Some(existing) if record.received_at_ms > existing.received_at_ms => {
                *existing = record.clone();
                Ok(UpsertOutcome::Updated)
            }
            Some(_) => Ok(UpsertOutcome::Unchanged),
        }
    }
}
