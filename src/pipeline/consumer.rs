use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::report::ConsumerReport;
use super::Delivery;
use crate::error::SyncError;
use crate::extract::{extract_record, Extraction};
use crate::sink::Sink;

/// Drains the handoff channel one delivery at a time until every sender is
/// gone. A fatal sink error cancels the run and stops the drain.
pub(crate) async fn consume(
    mut rx: mpsc::Receiver<Delivery>,
    mut sink: Sink,
    cancel: CancellationToken,
) -> ConsumerReport {
    let mut report = ConsumerReport::default();

    while let Some(delivery) = rx.recv().await {
        report.received += 1;

        let message = match delivery {
            Delivery::Fetched(message) => message,
            Delivery::Failed { id, error } => {
                warn!(id = %id, error = %error, "message failed, continuing");
                report.record_failure(&id, &error);
                continue;
            }
        };
        report.fetched += 1;

        let Extraction {
            record,
            decode_error,
        } = extract_record(&message);
        if let Some(source) = decode_error {
            let error = SyncError::Decode {
                id: record.id.clone(),
                source,
            };
            warn!(id = %record.id, error = %error, "body could not be decoded, delivering without it");
            report.record_failure(&record.id, &error);
        }

        info!(
            id = %record.id,
            subject = %record.subject,
            urls = %url_summary(&record.urls),
            "received message"
        );

        match sink.deliver(&record).await {
            Ok(outcome) => report.record_outcome(outcome),
            Err(fatal) => {
                error!(id = %record.id, error = %fatal, "sink failed, stopping run");
                cancel.cancel();
                rx.close();
                report.fatal = Some(fatal);
                break;
            }
        }
    }

    report
}

fn url_summary(urls: &[String]) -> String {
    if urls.is_empty() {
        "N/A".to_string()
    } else {
        urls.join(", ")
    }
}
