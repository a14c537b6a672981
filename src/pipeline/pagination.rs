use std::sync::Arc;

use tracing::debug;

use crate::connectors::{MessageHandle, MessageSource};
use crate::error::SyncError;
use crate::retry::{retry_with_backoff, RetryFailure, RetryPolicy};

/// Walks the listing one page at a time, following continuation tokens until
/// a page comes back with an empty one.
///
/// After the last page, or after an error, `next_page` returns `Ok(None)`.
pub struct Paginator {
    source: Arc<dyn MessageSource>,
    query: String,
    page_size: u32,
    retry: RetryPolicy,
    next_token: String,
    pages: usize,
    finished: bool,
}

impl Paginator {
    pub fn new(
        source: Arc<dyn MessageSource>,
        query: impl Into<String>,
        page_size: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            query: query.into(),
            page_size,
            retry,
            next_token: String::new(),
            pages: 0,
            finished: false,
        }
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<MessageHandle>>, SyncError> {
        if self.finished {
            return Ok(None);
        }

        let source = self.source.as_ref();
        let query = self.query.as_str();
        let page_size = self.page_size;
        let token = self.next_token.as_str();
        let listed = retry_with_backoff(&self.retry, move || {
            source.list_page(query, page_size, token)
        })
        .await;

        match listed {
            Ok(page) => {
                self.pages += 1;
                debug!(
                    page = self.pages,
                    count = page.handles.len(),
                    last = page.is_last(),
                    "listed page"
                );
                if page.is_last() {
                    self.finished = true;
                } else {
                    self.next_token = page.next_page_token;
                }
                Ok(Some(page.handles))
            }
            Err(RetryFailure { attempts, error }) => {
                self.finished = true;
                Err(SyncError::from_list(attempts, error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::Paginator;
    use crate::connectors::{
        ConnectorError, GmailMessage, MessageHandle, MessagePage, MessageSource,
    };
    use crate::error::ErrorKind;
    use crate::retry::RetryPolicy;

    /// Serves pre-built pages and remembers the tokens it was asked for.
    struct ScriptedSource {
        pages: Vec<MessagePage>,
        tokens_seen: Mutex<Vec<String>>,
        transient_failures: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(sizes: &[usize]) -> Self {
            let mut pages = Vec::new();
            let mut next = 0;
            for (index, &size) in sizes.iter().enumerate() {
                let handles = (next..next + size)
                    .map(|n| MessageHandle {
                        id: format!("m{n}"),
                        thread_id: String::new(),
                    })
                    .collect();
                next += size;
                let next_page_token = if index + 1 < sizes.len() {
                    format!("token-{}", index + 1)
                } else {
                    String::new()
                };
                pages.push(MessagePage {
                    handles,
                    next_page_token,
                });
            }
            Self {
                pages,
                tokens_seen: Mutex::new(Vec::new()),
                transient_failures: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn list_page(
            &self,
            _query: &str,
            _page_size: u32,
            page_token: &str,
        ) -> Result<MessagePage, ConnectorError> {
            self.tokens_seen
                .lock()
                .expect("tokens lock")
                .push(page_token.to_string());
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ConnectorError::Status {
                    operation: "messages.list".to_string(),
                    status: 503,
                    body: String::new(),
                });
            }

            let index = if page_token.is_empty() {
                0
            } else {
                page_token
                    .trim_start_matches("token-")
                    .parse::<usize>()
                    .expect("scripted token")
            };
            Ok(self.pages[index].clone())
        }

        async fn fetch_message(&self, id: &str) -> Result<GmailMessage, ConnectorError> {
            Err(ConnectorError::NotFound(id.to_string()))
        }
    }

    #[tokio::test]
    async fn visits_every_page_once_then_stays_finished() {
        let source = Arc::new(ScriptedSource::new(&[2, 2, 1]));
        let mut paginator = Paginator::new(source.clone(), "", 2, RetryPolicy::immediate(1));

        let mut ids = Vec::new();
        while let Some(handles) = paginator.next_page().await.expect("page") {
            ids.extend(handles.into_iter().map(|h| h.id));
        }

        assert_eq!(ids, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(paginator.pages(), 3);
        assert_eq!(
            *source.tokens_seen.lock().expect("tokens lock"),
            vec!["", "token-1", "token-2"]
        );
        assert!(paginator.next_page().await.expect("finished").is_none());
        assert_eq!(source.tokens_seen.lock().expect("tokens lock").len(), 3);
    }

    #[tokio::test]
    async fn transient_listing_errors_are_retried_as_whole_pages() {
        let source = Arc::new(ScriptedSource::new(&[1]));
        source.transient_failures.store(2, Ordering::SeqCst);
        let mut paginator = Paginator::new(source.clone(), "", 1, RetryPolicy::immediate(3));

        let handles = paginator.next_page().await.expect("retried page").expect("one page");
        assert_eq!(handles.len(), 1);
        assert_eq!(source.tokens_seen.lock().expect("tokens lock").len(), 3);
    }

    #[tokio::test]
    async fn exhausted_listing_is_fatal_and_final() {
        let source = Arc::new(ScriptedSource::new(&[1]));
        source.transient_failures.store(10, Ordering::SeqCst);
        let mut paginator = Paginator::new(source, "", 1, RetryPolicy::immediate(3));

        let error = paginator.next_page().await.expect_err("listing fails");
        assert_eq!(error.kind(), ErrorKind::List);
        assert!(error.to_string().contains("after 3 attempt(s)"));
        assert!(paginator.next_page().await.expect("no more pages").is_none());
    }
}
