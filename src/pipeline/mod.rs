//! Producer/consumer pipeline.
//!
//! One consumer task is spawned before any fetch starts. Producers fetch
//! messages either inline (serial) or as tasks in a [`JoinSet`] (concurrent)
//! and push each result onto a bounded channel. Shutdown is always the same
//! sequence: join every producer, drop the last sender so the channel closes,
//! then await the consumer.

mod consumer;
mod pagination;
mod report;

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_PAGE_SIZE, DEFAULT_QUERY};
use crate::connectors::{ConnectorError, GmailMessage, MessageHandle, MessageSource};
use crate::error::SyncError;
use crate::retry::{retry_with_backoff, RetryFailure, RetryPolicy};
use crate::sink::Sink;

pub use pagination::Paginator;
pub use report::{ItemFailure, RunReport};

/// How producers fetch message bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Fetch inline on the coordinator, in listing order.
    Serial,
    /// One task per handle. `Some(n)` caps in-flight fetches at `n`.
    Concurrent { max_in_flight: Option<usize> },
}

impl FetchMode {
    /// `workers == 0` means unbounded.
    pub fn concurrent(workers: usize) -> Self {
        Self::Concurrent {
            max_in_flight: (workers > 0).then_some(workers),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub query: String,
    pub page_size: u32,
    pub mode: FetchMode,
    pub channel_capacity: usize,
    pub list_retry: RetryPolicy,
    pub fetch_retry: RetryPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            query: DEFAULT_QUERY.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            mode: FetchMode::concurrent(crate::config::DEFAULT_WORKERS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            list_retry: RetryPolicy::default(),
            fetch_retry: RetryPolicy::default(),
        }
    }
}

impl PipelineOptions {
    /// `tokio::sync::mpsc` needs room for at least one item.
    pub fn effective_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}

/// What a producer pushes onto the handoff channel.
#[derive(Debug)]
pub enum Delivery {
    Fetched(GmailMessage),
    Failed { id: String, error: SyncError },
}

#[derive(Debug)]
enum ProducerOutcome {
    Delivered,
    Cancelled,
    ConsumerGone,
    /// Credentials were rejected; nothing else can be fetched.
    Fatal(SyncError),
}

/// Runs one full sync: list every page, fetch every handle exactly once and
/// hand each result to `sink`.
///
/// Returns the report when the run finished or was cancelled through
/// `cancel`. Listing, auth and store failures are returned as errors, but only
/// after every producer has been joined and the consumer has drained.
pub async fn run_pipeline(
    source: Arc<dyn MessageSource>,
    sink: Sink,
    options: &PipelineOptions,
    cancel: CancellationToken,
) -> Result<RunReport, SyncError> {
    let (tx, rx) = mpsc::channel(options.effective_capacity());
    // Consumer first, so a serial producer never blocks on a full channel
    // with nobody reading.
    let run_token = cancel.child_token();
    let consumer = tokio::spawn(consumer::consume(rx, sink, run_token.clone()));

    let mut producers = Producers::new(Arc::clone(&source), tx, options, run_token.clone());
    let mut paginator = Paginator::new(
        source,
        options.query.clone(),
        options.page_size,
        options.list_retry.clone(),
    );
    let mut report = RunReport::default();

    let listing = produce(&mut paginator, &mut producers, &mut report, &run_token).await;

    // Producer barrier, then close, then consumer barrier.
    let task_failure = producers.join_all().await;
    report.cancelled_tasks = producers.cancelled;
    let producer_fatal = producers.fatal.take();
    drop(producers);

    let consumer_report = consumer
        .await
        .map_err(|join_error| SyncError::Task(format!("consumer task: {join_error}")))?;
    let consumer_fatal = {
        let mut consumer_report = consumer_report;
        let fatal = consumer_report.fatal.take();
        report.merge_consumer(consumer_report);
        fatal
    };
    report.pages = paginator.pages();
    report.cancelled = cancel.is_cancelled();

    info!(
        pages = report.pages,
        listed = report.listed,
        received = report.received,
        fetch_failures = report.fetch_failures,
        decode_failures = report.decode_failures,
        cancelled = report.cancelled,
        "pipeline finished"
    );

    if let Some(fatal) = consumer_fatal.or(producer_fatal) {
        return Err(fatal);
    }
    listing?;
    if let Some(task_failure) = task_failure {
        return Err(task_failure);
    }
    Ok(report)
}

async fn produce(
    paginator: &mut Paginator,
    producers: &mut Producers,
    report: &mut RunReport,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    loop {
        let page = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("run cancelled, stopping pagination");
                return Ok(());
            }
            page = paginator.next_page() => page?,
        };
        let Some(handles) = page else {
            return Ok(());
        };

        report.listed += handles.len();
        info!(page = paginator.pages(), count = handles.len(), "found messages");

        for handle in handles {
            if cancel.is_cancelled() || producers.consumer_gone {
                return Ok(());
            }
            producers.dispatch(handle).await;
        }
    }
}

/// Producer side of the pipeline: owns the sender, the task set and the
/// optional worker-pool semaphore.
struct Producers {
    source: Arc<dyn MessageSource>,
    tx: mpsc::Sender<Delivery>,
    mode: FetchMode,
    fetch_retry: RetryPolicy,
    cancel: CancellationToken,
    semaphore: Option<Arc<Semaphore>>,
    tasks: JoinSet<ProducerOutcome>,
    cancelled: usize,
    consumer_gone: bool,
    fatal: Option<SyncError>,
}

impl Producers {
    fn new(
        source: Arc<dyn MessageSource>,
        tx: mpsc::Sender<Delivery>,
        options: &PipelineOptions,
        cancel: CancellationToken,
    ) -> Self {
        let semaphore = match options.mode {
            FetchMode::Concurrent {
                max_in_flight: Some(limit),
            } => Some(Arc::new(Semaphore::new(limit.max(1)))),
            _ => None,
        };

        Self {
            source,
            tx,
            mode: options.mode,
            fetch_retry: options.fetch_retry.clone(),
            cancel,
            semaphore,
            tasks: JoinSet::new(),
            cancelled: 0,
            consumer_gone: false,
            fatal: None,
        }
    }

    async fn dispatch(&mut self, handle: MessageHandle) {
        match self.mode {
            FetchMode::Serial => {
                let outcome = fetch_and_send(
                    self.source.as_ref(),
                    handle,
                    &self.tx,
                    &self.fetch_retry,
                    &self.cancel,
                )
                .await;
                self.account(outcome);
            }
            FetchMode::Concurrent { .. } => {
                let source = Arc::clone(&self.source);
                let tx = self.tx.clone();
                let retry = self.fetch_retry.clone();
                let cancel = self.cancel.clone();
                let semaphore = self.semaphore.clone();

                self.tasks.spawn(async move {
                    let _permit = match semaphore {
                        Some(semaphore) => tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return ProducerOutcome::Cancelled,
                            permit = semaphore.acquire_owned() => match permit {
                                Ok(permit) => Some(permit),
                                Err(_) => return ProducerOutcome::Cancelled,
                            },
                        },
                        None => None,
                    };
                    fetch_and_send(source.as_ref(), handle, &tx, &retry, &cancel).await
                });
            }
        }
    }

    fn account(&mut self, outcome: ProducerOutcome) {
        match outcome {
            ProducerOutcome::Delivered => {}
            ProducerOutcome::Cancelled => self.cancelled += 1,
            ProducerOutcome::ConsumerGone => self.consumer_gone = true,
            ProducerOutcome::Fatal(error) => {
                if self.fatal.is_none() {
                    self.fatal = Some(error);
                }
            }
        }
    }

    /// Waits for every spawned producer. A panicked task is reported once all
    /// others have finished.
    async fn join_all(&mut self) -> Option<SyncError> {
        let mut failure = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(outcome) => self.account(outcome),
                Err(join_error) => {
                    warn!(error = %join_error, "producer task failed");
                    failure.get_or_insert_with(|| {
                        SyncError::Task(format!("producer task: {join_error}"))
                    });
                }
            }
        }
        failure
    }
}

async fn fetch_and_send(
    source: &dyn MessageSource,
    handle: MessageHandle,
    tx: &mpsc::Sender<Delivery>,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> ProducerOutcome {
    info!(id = %handle.id, "fetching message");

    let id = handle.id.as_str();
    let fetched = tokio::select! {
        biased;
        _ = cancel.cancelled() => return ProducerOutcome::Cancelled,
        fetched = retry_with_backoff(retry, move || source.fetch_message(id)) => fetched,
    };

    let delivery = match fetched {
        Ok(message) => Delivery::Fetched(message),
        Err(RetryFailure {
            error: error @ ConnectorError::Auth(_),
            ..
        }) => {
            error!(id = %handle.id, error = %error, "credentials rejected, stopping run");
            cancel.cancel();
            return ProducerOutcome::Fatal(SyncError::Auth(error));
        }
        Err(failure) => Delivery::Failed {
            id: handle.id.clone(),
            error: SyncError::Fetch {
                id: handle.id,
                source: failure.error,
            },
        },
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => ProducerOutcome::Cancelled,
        sent = tx.send(delivery) => match sent {
            Ok(()) => ProducerOutcome::Delivered,
            Err(_) => ProducerOutcome::ConsumerGone,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::{FetchMode, PipelineOptions};

    #[test]
    fn zero_capacity_maps_to_one() {
        let options = PipelineOptions {
            channel_capacity: 0,
            ..PipelineOptions::default()
        };
        assert_eq!(options.effective_capacity(), 1);
        assert_eq!(PipelineOptions::default().effective_capacity(), 3);
    }

    #[test]
    fn zero_workers_means_unbounded() {
        assert_eq!(
            FetchMode::concurrent(0),
            FetchMode::Concurrent {
                max_in_flight: None
            }
        );
        assert_eq!(
            FetchMode::concurrent(4),
            FetchMode::Concurrent {
                max_in_flight: Some(4)
            }
        );
    }

    #[test]
    fn defaults_follow_configuration() {
        let options = PipelineOptions::default();
        assert_eq!(options.query, "label:Recipes");
        assert_eq!(options.page_size, 25);
        assert_eq!(options.list_retry.max_attempts, 3);
    }
}
