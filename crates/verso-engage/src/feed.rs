//! Cursor-paginated feed loading with distinct initial-load and load-more
//! failure handling.
//!
//! A feed is keyed by its filter (section, content kind, sort). Replacing a
//! feed clears it; loading more appends and advances the cursor. The two
//! error slots are independent: `initial_error` blocks rendering and offers
//! a full retry, `page_error` keeps already-loaded items visible and offers
//! a next-page retry. Nothing here retries on its own: a failed fetch
//! stays failed until the caller explicitly asks again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use engage_proto::{FeedItem, FeedPageResponse};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::EngageError;

pub const DEFAULT_PAGE_LIMIT: usize = 20;

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        filter_key: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<FeedPageResponse, EngageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedPhase {
    Idle,
    Loading,
    Loaded,
}

/// Read-only view of one feed's state, consumed by the UI.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub items: Vec<FeedItem>,
    pub cursor: Option<String>,
    pub has_more: bool,
    pub phase: FeedPhase,
    pub initial_error: Option<EngageError>,
    pub page_error: Option<EngageError>,
}

#[derive(Debug)]
struct FeedState {
    items: Vec<FeedItem>,
    cursor: Option<String>,
    has_more: bool,
    phase: FeedPhase,
    initial_error: Option<EngageError>,
    page_error: Option<EngageError>,
    in_flight: bool,
}

impl Default for FeedState {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            cursor: None,
            has_more: false,
            phase: FeedPhase::Idle,
            initial_error: None,
            page_error: None,
            in_flight: false,
        }
    }
}

impl FeedState {
    fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            items: self.items.clone(),
            cursor: self.cursor.clone(),
            has_more: self.has_more,
            phase: self.phase,
            initial_error: self.initial_error.clone(),
            page_error: self.page_error.clone(),
        }
    }
}

pub struct FeedLoader {
    fetcher: Arc<dyn PageFetcher>,
    limit: usize,
    feeds: Mutex<HashMap<String, FeedState>>,
}

impl FeedLoader {
    pub fn new(fetcher: Arc<dyn PageFetcher>, limit: usize) -> Self {
        Self {
            fetcher,
            limit,
            feeds: Mutex::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self, filter_key: &str) -> Option<FeedSnapshot> {
        self.feeds.lock().get(filter_key).map(FeedState::snapshot)
    }

    /// Drop a feed once its view unmounts.
    pub fn clear(&self, filter_key: &str) {
        self.feeds.lock().remove(filter_key);
    }

    /// Load (or reload) a feed from the beginning, replacing whatever was
    /// shown. No-op while a fetch for this filter is already in flight.
    pub async fn load(&self, filter_key: &str) {
        {
            let mut feeds = self.feeds.lock();
            let state = feeds.entry(filter_key.to_string()).or_default();
            if state.in_flight {
                return;
            }
            state.items.clear();
            state.cursor = None;
            state.has_more = false;
            state.phase = FeedPhase::Loading;
            state.initial_error = None;
            state.page_error = None;
            state.in_flight = true;
        }

        let result = self.fetcher.fetch_page(filter_key, None, self.limit).await;

        let mut feeds = self.feeds.lock();
        let Some(state) = feeds.get_mut(filter_key) else {
            return;
        };
        state.in_flight = false;
        match result {
            Ok(page) => {
                debug!(filter = %filter_key, items = page.items.len(), "feed loaded");
                state.items = page.items;
                state.cursor = page.next_cursor;
                state.has_more = page.has_more;
                state.phase = FeedPhase::Loaded;
            }
            Err(err) => {
                state.phase = FeedPhase::Idle;
                state.initial_error = Some(err);
            }
        }
    }

    /// Fetch the next page and append it. No-op when the feed is exhausted,
    /// not yet loaded, or a fetch is already in flight: rapid scroll
    /// triggers collapse into one network call.
    pub async fn load_more(&self, filter_key: &str) {
        let cursor = {
            let mut feeds = self.feeds.lock();
            let Some(state) = feeds.get_mut(filter_key) else {
                return;
            };
            if state.in_flight || !state.has_more || state.phase != FeedPhase::Loaded {
                return;
            }
            state.in_flight = true;
            state.page_error = None;
            state.cursor.clone()
        };

        let result = self
            .fetcher
            .fetch_page(filter_key, cursor.as_deref(), self.limit)
            .await;

        let mut feeds = self.feeds.lock();
        let Some(state) = feeds.get_mut(filter_key) else {
            return;
        };
        state.in_flight = false;
        match result {
            Ok(page) => {
                state.items.extend(page.items);
                state.cursor = page.next_cursor;
                state.has_more = page.has_more;
            }
            Err(err) => {
                // Loaded items stay visible; only the next-page slot errors.
                state.page_error = Some(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedFetcher {
        responses: SyncMutex<VecDeque<Result<FeedPageResponse, EngageError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(responses: Vec<Result<FeedPageResponse, EngageError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: SyncMutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch_page(
            &self,
            _filter_key: &str,
            _cursor: Option<&str>,
            _limit: usize,
        ) -> Result<FeedPageResponse, EngageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| panic!("unscripted fetch"))
        }
    }

    fn page(ids: &[&str], next: Option<&str>) -> FeedPageResponse {
        FeedPageResponse {
            items: ids
                .iter()
                .map(|id| FeedItem {
                    id: id.to_string(),
                    thread_id: None,
                    payload: serde_json::Value::Null,
                })
                .collect(),
            next_cursor: next.map(String::from),
            has_more: next.is_some(),
        }
    }

    #[tokio::test]
    async fn load_then_load_more_appends_and_advances() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(page(&["p1", "p2"], Some("cur2"))),
            Ok(page(&["p3"], None)),
        ]);
        let loader = FeedLoader::new(fetcher.clone(), 2);

        loader.load("sections/music").await;
        loader.load_more("sections/music").await;

        let snap = loader.snapshot("sections/music").unwrap();
        assert_eq!(
            snap.items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            vec!["p1", "p2", "p3"]
        );
        assert!(!snap.has_more);
        assert_eq!(snap.cursor, None);

        // Exhausted: further load-more calls never hit the network.
        loader.load_more("sections/music").await;
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn initial_failure_blocks_items_and_retry_recovers() {
        let fetcher = ScriptedFetcher::new(vec![
            Err(EngageError::Transport("dns".into())),
            Ok(page(&["p1"], None)),
        ]);
        let loader = FeedLoader::new(fetcher.clone(), 2);

        loader.load("sections/books").await;
        let snap = loader.snapshot("sections/books").unwrap();
        assert!(snap.items.is_empty());
        assert_eq!(snap.phase, FeedPhase::Idle);
        assert!(snap.initial_error.is_some());

        // Explicit caller retry, never a timer.
        loader.load("sections/books").await;
        let snap = loader.snapshot("sections/books").unwrap();
        assert_eq!(snap.items.len(), 1);
        assert!(snap.initial_error.is_none());
    }

    #[tokio::test]
    async fn page_failure_keeps_items_and_initial_error_slot_untouched() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(page(&["p1", "p2"], Some("cur2"))),
            Err(EngageError::Server {
                status: 502,
                message: "bad gateway".into(),
            }),
            Ok(page(&["p3"], None)),
        ]);
        let loader = FeedLoader::new(fetcher.clone(), 2);

        loader.load("sections/recipes").await;
        loader.load_more("sections/recipes").await;

        let snap = loader.snapshot("sections/recipes").unwrap();
        assert_eq!(snap.items.len(), 2);
        assert!(snap.initial_error.is_none());
        assert!(snap.page_error.is_some());
        assert!(snap.has_more);

        // Explicit "try again" for the next page only.
        loader.load_more("sections/recipes").await;
        let snap = loader.snapshot("sections/recipes").unwrap();
        assert_eq!(snap.items.len(), 3);
        assert!(snap.page_error.is_none());
    }

    #[tokio::test]
    async fn load_more_before_initial_load_is_a_no_op() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let loader = FeedLoader::new(fetcher.clone(), 2);

        loader.load_more("sections/movies").await;
        assert_eq!(fetcher.calls(), 0);
        assert!(loader.snapshot("sections/movies").is_none());
    }
}
