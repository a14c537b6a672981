use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use recipe_sync::connectors::{GmailBody, GmailHeader, GmailMessage, GmailPayload, JsonArchiveSource};
use recipe_sync::db::{Database, LAST_SYNC_KEY};
use recipe_sync::pipeline::{run_pipeline, FetchMode, PipelineOptions, RunReport};
use recipe_sync::retry::RetryPolicy;
use recipe_sync::sink::Sink;

fn temp_db_path() -> PathBuf {
    std::env::temp_dir()
        .join(format!("recipe-sync-storage-{}", Uuid::new_v4()))
        .join("recipes.db")
}

fn message(id: &str, received_at_ms: i64, body: &str) -> GmailMessage {
    GmailMessage {
        id: id.to_string(),
        internal_date: Some(received_at_ms.to_string()),
        payload: GmailPayload {
            mime_type: Some("text/html".to_string()),
            headers: Some(vec![
                GmailHeader {
                    name: "Subject".to_string(),
                    value: format!("{id} at {received_at_ms}"),
                },
                GmailHeader {
                    name: "From".to_string(),
                    value: "cook@example.com".to_string(),
                },
            ]),
            body: Some(GmailBody {
                data: Some(URL_SAFE_NO_PAD.encode(body)),
                ..GmailBody::default()
            }),
            ..GmailPayload::default()
        },
        ..GmailMessage::default()
    }
}

async fn sync_into(path: &PathBuf, messages: Vec<GmailMessage>) -> RunReport {
    let db = Database::open(path).expect("open database");
    let options = PipelineOptions {
        mode: FetchMode::concurrent(2),
        list_retry: RetryPolicy::immediate(1),
        fetch_retry: RetryPolicy::immediate(1),
        ..PipelineOptions::default()
    };

    run_pipeline(
        Arc::new(JsonArchiveSource::from_messages(messages)),
        Sink::new().with_store(db),
        &options,
        CancellationToken::new(),
    )
    .await
    .expect("sync run")
}

#[tokio::test]
async fn repeated_syncs_keep_the_newest_copy_of_each_message() {
    let path = temp_db_path();

    let first = sync_into(
        &path,
        vec![
            message("pasta", 2_000, "<a href=\"https://pasta.example/v2\">v2</a>"),
            message("soup", 1_000, "no links"),
        ],
    )
    .await;
    assert_eq!(first.inserted, 2);

    let second = sync_into(
        &path,
        vec![
            message("pasta", 1_000, "<a href=\"https://pasta.example/v1\">stale</a>"),
            message("soup", 3_000, "<a href=\"https://soup.example\">fresh</a>"),
            message("bread", 500, "https://bread.example"),
        ],
    )
    .await;
    assert_eq!(second.inserted, 1);
    assert_eq!(second.updated, 1);
    assert_eq!(second.unchanged, 1);

    let db = Database::open(&path).expect("reopen database");
    let pasta = db.get_message("pasta").expect("query").expect("pasta stored");
    assert_eq!(pasta.received_at, 2_000);
    assert_eq!(pasta.url_list(), vec!["https://pasta.example/v2"]);

    let soup = db.get_message("soup").expect("query").expect("soup stored");
    assert_eq!(soup.received_at, 3_000);
    assert_eq!(soup.subject.as_deref(), Some("soup at 3000"));
    assert_eq!(soup.url_list(), vec!["https://soup.example"]);

    let stats = db.get_stats().expect("stats");
    assert_eq!(stats.total_messages, 3);
    assert_eq!(stats.newest_received_at, Some(3_000));

    std::fs::remove_dir_all(path.parent().expect("temp dir")).ok();
}

#[tokio::test]
async fn equal_timestamps_leave_the_stored_row_alone() {
    let path = temp_db_path();

    sync_into(&path, vec![message("stew", 42, "original")]).await;
    let report = sync_into(&path, vec![message("stew", 42, "replacement")]).await;
    assert_eq!(report.unchanged, 1);

    let db = Database::open(&path).expect("reopen database");
    let stew = db.get_message("stew").expect("query").expect("stew stored");
    assert_eq!(stew.body.as_deref(), Some("original"));

    db.set_sync_state(LAST_SYNC_KEY, "2026-01-01T00:00:00Z")
        .expect("write sync state");
    assert_eq!(
        db.get_stats().expect("stats").last_sync.as_deref(),
        Some("2026-01-01T00:00:00Z")
    );

    std::fs::remove_dir_all(path.parent().expect("temp dir")).ok();
}
