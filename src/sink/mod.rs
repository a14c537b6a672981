mod store;

use std::io::Write;

use tracing::{debug, warn};

use crate::db::UpsertOutcome;
use crate::error::SyncError;
use crate::extract::ExtractedRecord;
use crate::output::{self, OutputFormat};
use crate::retry::RetryPolicy;

pub use store::{MemoryStore, MessageStore};

/// What the sink did with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkOutcome {
    pub displayed: bool,
    /// `None` when storage is disabled for this run.
    pub stored: Option<UpsertOutcome>,
}

struct Display {
    format: OutputFormat,
    writer: Box<dyn Write + Send>,
}

/// Final stage of the pipeline: prints each record and, when a store is
/// attached, upserts it.
pub struct Sink {
    display: Option<Display>,
    store: Option<Box<dyn MessageStore>>,
    store_retry: RetryPolicy,
}

impl Default for Sink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink {
    /// A sink that neither displays nor stores.
    pub fn new() -> Self {
        Self {
            display: None,
            store: None,
            store_retry: RetryPolicy::default(),
        }
    }

    pub fn stdout(format: OutputFormat) -> Self {
        Self::new().with_display(format, std::io::stdout())
    }

    pub fn with_display(mut self, format: OutputFormat, writer: impl Write + Send + 'static) -> Self {
        self.display = Some(Display {
            format,
            writer: Box::new(writer),
        });
        self
    }

    pub fn with_store(mut self, store: impl MessageStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }

    pub fn stores(&self) -> bool {
        self.store.is_some()
    }

    /// Displays then stores one record. Display problems are logged and
    /// skipped; a store that keeps failing after its retries is fatal.
    pub async fn deliver(&mut self, record: &ExtractedRecord) -> Result<SinkOutcome, SyncError> {
        let displayed = self.display(record);
        let stored = match self.store.as_mut() {
            Some(store) => Some(upsert_with_retry(&mut **store, &self.store_retry, record).await?),
            None => None,
        };

        Ok(SinkOutcome { displayed, stored })
    }

    fn display(&mut self, record: &ExtractedRecord) -> bool {
        let Some(display) = self.display.as_mut() else {
            return false;
        };

        let line = match output::format_record(display.format, record) {
            Ok(line) => line,
            Err(error) => {
                warn!(id = %record.id, error = %error, "failed to format record");
                return false;
            }
        };

        match writeln!(display.writer, "{line}").and_then(|_| display.writer.flush()) {
            Ok(()) => true,
            Err(error) => {
                warn!(id = %record.id, error = %error, "failed to write record");
                false
            }
        }
    }
}

async fn upsert_with_retry(
    store: &mut dyn MessageStore,
    policy: &RetryPolicy,
    record: &ExtractedRecord,
) -> Result<UpsertOutcome, SyncError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        // rusqlite is synchronous; the consumer is the store's only caller, so
        // the write runs inline on its task.
        match store.upsert(record) {
            Ok(outcome) => {
                debug!(id = %record.id, ?outcome, "stored record");
                return Ok(outcome);
            }
            Err(error) if attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    id = %record.id,
                    error = %error,
                    attempt,
                    max_attempts,
                    "store failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(source) => {
                return Err(SyncError::Store {
                    id: record.id.clone(),
                    attempts: attempt,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    use super::{MemoryStore, MessageStore, Sink};
    use crate::db::{DbError, UpsertOutcome};
    use crate::error::ErrorKind;
    use crate::extract::ExtractedRecord;
    use crate::output::OutputFormat;
    use crate::retry::RetryPolicy;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().expect("buffer lock").clone()).expect("utf8 output")
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("buffer lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FlakyStore {
        failures_left: u32,
        inner: MemoryStore,
    }

    impl MessageStore for FlakyStore {
        fn upsert(&mut self, record: &ExtractedRecord) -> Result<UpsertOutcome, DbError> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(DbError::Config("database is locked".to_string()));
            }
            self.inner.upsert(record)
        }
    }

    fn record(id: &str) -> ExtractedRecord {
        ExtractedRecord {
            id: id.to_string(),
            from: "chef@example.com".to_string(),
            subject: "Ramen".to_string(),
            body: String::new(),
            urls: vec!["https://ramen.example".to_string()],
            received_at_ms: 1,
        }
    }

    #[tokio::test]
    async fn displays_without_storing_by_default() {
        let buffer = SharedBuffer::default();
        let mut sink = Sink::new().with_display(OutputFormat::Table, buffer.clone());

        let outcome = sink.deliver(&record("m1")).await.expect("deliver");
        assert!(outcome.displayed);
        assert_eq!(outcome.stored, None);
        assert!(!sink.stores());
        assert_eq!(buffer.contents(), "m1  Ramen\n\thttps://ramen.example\n");
    }

    #[tokio::test]
    async fn transient_store_failures_are_retried() {
        let memory = MemoryStore::new();
        let mut sink = Sink::new()
            .with_store(FlakyStore {
                failures_left: 2,
                inner: memory.clone(),
            })
            .with_store_retry(RetryPolicy::immediate(3));
        assert!(sink.stores());

        let outcome = sink.deliver(&record("m1")).await.expect("third attempt stores");
        assert_eq!(outcome.stored, Some(UpsertOutcome::Inserted));
        assert!(!outcome.displayed);
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_store_retries_are_fatal() {
        let mut sink = Sink::new()
            .with_store(FlakyStore {
                failures_left: u32::MAX,
                inner: MemoryStore::new(),
            })
            .with_store_retry(RetryPolicy::immediate(3));

        let error = sink.deliver(&record("m1")).await.expect_err("store keeps failing");
        assert_eq!(error.kind(), ErrorKind::Store);
        assert!(error.is_run_fatal());
        assert!(error.to_string().contains("after 3 attempt(s)"));
    }
}
