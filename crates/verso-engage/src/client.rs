//! The engagement facade: typed per-action operations built on the one
//! generic action controller, plus the push-event router that reconciles
//! incoming fanout events against local optimistic state.

use std::sync::Arc;

use engage_proto::{ActionKind, AggregateDelta, EntityId, PushEvent};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::EngageApi;
use crate::config::EngageConfig;
use crate::controller::{ActionController, Reconcile};
use crate::dedup::SeenEventRegistry;
use crate::error::EngageError;
use crate::feed::FeedLoader;
use crate::push::{PushChannel, PushSettings};
use crate::store::AggregateStore;

/// Engagement log kinds and the aggregate fields they touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Watch,
    Cook,
    Read,
}

impl LogKind {
    fn action(self) -> ActionKind {
        match self {
            LogKind::Watch => ActionKind::Watch,
            LogKind::Cook => ActionKind::Cook,
            LogKind::Read => ActionKind::Read,
        }
    }

    fn count_field(self) -> &'static str {
        match self {
            LogKind::Watch => "watch_count",
            LogKind::Cook => "cook_count",
            LogKind::Read => "read_count",
        }
    }

    fn flag_field(self) -> &'static str {
        match self {
            LogKind::Watch => "viewer_watched",
            LogKind::Cook => "viewer_cooked",
            LogKind::Read => "viewer_read",
        }
    }
}

/// Result of posting a comment: the server-assigned ID plus the full
/// created entity for insertion into the thread view.
#[derive(Debug, Clone)]
pub struct CommentReceipt {
    pub id: EntityId,
    pub entity: serde_json::Value,
}

pub struct Engagement {
    api: Arc<EngageApi>,
    controller: Arc<ActionController>,
    dedup: Mutex<SeenEventRegistry>,
    feeds: Arc<FeedLoader>,
    config: EngageConfig,
}

impl Engagement {
    pub fn new(config: EngageConfig) -> Self {
        let api = Arc::new(EngageApi::new(&config.api_base));
        let controller = Arc::new(ActionController::new(AggregateStore::new(), api.clone()));
        let feeds = Arc::new(FeedLoader::new(api.clone(), config.page_limit));
        let dedup = Mutex::new(SeenEventRegistry::new(
            config.dedup_capacity,
            config.dedup_ttl,
        ));
        Self {
            api,
            controller,
            dedup,
            feeds,
            config,
        }
    }

    pub fn store(&self) -> &AggregateStore {
        self.controller.store()
    }

    pub fn controller(&self) -> &ActionController {
        &self.controller
    }

    pub fn feeds(&self) -> &FeedLoader {
        &self.feeds
    }

    /// Save an item to the watchlist, optionally into a category. Counts
    /// are reconciled from the canonical read, which also folds in saves by
    /// other sessions the optimistic patch could not know about.
    pub async fn save(&self, entity_id: &str, category: Option<&str>) -> Result<(), EngageError> {
        let mut patch = AggregateDelta::new()
            .incr("saved_count", 1)
            .flag("viewer_saved", true);
        if let Some(category) = category {
            patch = patch.insert_into("viewer_categories", category);
        }
        let api = self.api.clone();
        let id = entity_id.to_string();
        let body = category.map(|c| serde_json::json!({ "category": c }));
        let created = self
            .controller
            .perform(
                entity_id,
                ActionKind::Save,
                patch,
                move || async move { api.post_action(&id, "save", body.as_ref()).await },
                Reconcile::CanonicalRead,
            )
            .await?;
        if let Some(record) = created {
            self.mark_created(&record);
        }
        Ok(())
    }

    pub async fn unsave(&self, entity_id: &str) -> Result<(), EngageError> {
        let current = self.store().get_or_default(entity_id);
        let mut patch = AggregateDelta::new()
            .incr("saved_count", -1)
            .flag("viewer_saved", false);
        if let Some(categories) = current.viewer_sets.get("viewer_categories") {
            for category in categories {
                patch = patch.remove_from("viewer_categories", category);
            }
        }
        let api = self.api.clone();
        let id = entity_id.to_string();
        self.controller
            .perform(
                entity_id,
                ActionKind::Save,
                patch,
                move || async move { api.delete_action(&id, "save").await },
                Reconcile::CanonicalRead,
            )
            .await?;
        Ok(())
    }

    /// Log a watch, cook, or read against an item.
    pub async fn log(&self, entity_id: &str, kind: LogKind) -> Result<(), EngageError> {
        let patch = AggregateDelta::new()
            .incr(kind.count_field(), 1)
            .flag(kind.flag_field(), true);
        let api = self.api.clone();
        let id = entity_id.to_string();
        let action = kind.action().action_path();
        let created = self
            .controller
            .perform(
                entity_id,
                kind.action(),
                patch,
                move || async move { api.post_action(&id, action, None).await },
                Reconcile::CanonicalRead,
            )
            .await?;
        if let Some(record) = created {
            self.mark_created(&record);
        }
        Ok(())
    }

    /// Toggle a reaction. Returns whether the reaction is now active.
    pub async fn toggle_reaction(
        &self,
        entity_id: &str,
        reaction: &str,
    ) -> Result<bool, EngageError> {
        let current = self.store().get_or_default(entity_id);
        let active = current.set_contains("viewer_reactions", reaction);
        let api = self.api.clone();
        let id = entity_id.to_string();

        if active {
            let patch = AggregateDelta::new()
                .incr("reaction_count", -1)
                .remove_from("viewer_reactions", reaction);
            self.controller
                .perform(
                    entity_id,
                    ActionKind::React,
                    patch,
                    move || async move { api.delete_action(&id, "reaction").await },
                    Reconcile::CanonicalRead,
                )
                .await?;
            Ok(false)
        } else {
            let patch = AggregateDelta::new()
                .incr("reaction_count", 1)
                .insert_into("viewer_reactions", reaction);
            let body = serde_json::json!({ "reaction": reaction });
            let created = self
                .controller
                .perform(
                    entity_id,
                    ActionKind::React,
                    patch,
                    move || async move { api.post_action(&id, "reaction", Some(&body)).await },
                    Reconcile::CanonicalRead,
                )
                .await?;
            if let Some(record) = created {
                self.mark_created(&record);
            }
            Ok(true)
        }
    }

    /// Post a comment into a thread. The thread's comment count is bumped
    /// optimistically and stands on success; the echoed push event for the
    /// created ID is consumed by the dedup registry instead of counting
    /// again.
    pub async fn post_comment(
        &self,
        thread_id: &str,
        body: &str,
    ) -> Result<CommentReceipt, EngageError> {
        let patch = AggregateDelta::new().incr("comment_count", 1);
        let api = self.api.clone();
        let id = thread_id.to_string();
        let payload = serde_json::json!({ "body": body });
        let created = self
            .controller
            .perform(
                thread_id,
                ActionKind::Comment,
                patch,
                move || async move { api.post_action(&id, "comments", Some(&payload)).await },
                Reconcile::KeepOptimistic,
            )
            .await?;

        let entity = created.ok_or_else(|| {
            EngageError::Decode("comment response missing created entity".into())
        })?;
        let comment_id = entity
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngageError::Decode("comment response missing id".into()))?
            .to_string();
        self.mark_local(thread_id, &comment_id);
        Ok(CommentReceipt {
            id: comment_id,
            entity,
        })
    }

    /// Move saved items into another category with per-item sequential save
    /// calls. At-least-attempt: the first failure is surfaced and the store
    /// keeps whatever completed before it.
    pub async fn move_saved_items(
        &self,
        entity_ids: &[EntityId],
        from_category: &str,
        to_category: &str,
    ) -> Result<(), EngageError> {
        for entity_id in entity_ids {
            let patch = AggregateDelta::new()
                .remove_from("viewer_categories", from_category)
                .insert_into("viewer_categories", to_category);
            let api = self.api.clone();
            let id = entity_id.clone();
            let body = serde_json::json!({ "category": to_category });
            let created = self
                .controller
                .perform(
                    entity_id,
                    ActionKind::Save,
                    patch,
                    move || async move { api.post_action(&id, "save", Some(&body)).await },
                    Reconcile::CanonicalRead,
                )
                .await?;
            if let Some(record) = created {
                self.mark_created(&record);
            }
        }
        Ok(())
    }

    /// Record a locally created entity so its push echo is consumed instead
    /// of double-counted.
    pub fn mark_local(&self, thread_id: &str, entity_id: &str) {
        self.dedup.lock().mark_local(thread_id, entity_id);
    }

    /// Route one push event into local state.
    ///
    /// The first event matching a locally created ID consumes its registry
    /// entry and has its counter increments suppressed: the local path
    /// already counted it. Everything else (including later events for the
    /// same ID) applies as a normal remote update, absorbed beneath any
    /// pending optimistic patches.
    pub fn handle_event(&self, event: &PushEvent) {
        let payload = match event.decode_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(entity = %event.entity_id, error = %err, "undecodable push payload");
                return;
            }
        };

        let suppress_counts = self
            .dedup
            .lock()
            .consume_if_seen(&event.thread_id, &event.entity_id);
        if suppress_counts {
            debug!(entity = %event.entity_id, thread = %event.thread_id, "echo consumed");
        }

        let Some(delta) = payload.delta else {
            return;
        };
        let delta = if suppress_counts {
            delta.without_counts()
        } else {
            delta
        };
        if delta.is_empty() {
            return;
        }

        let target = payload
            .target
            .unwrap_or_else(|| event.thread_id.clone());
        self.controller.apply_remote(&target, &delta);
    }

    /// Open the push channel for this session and route its events through
    /// [`Engagement::handle_event`] until the channel closes.
    pub fn connect_push(self: Arc<Self>, session_id: &str, topics: Vec<String>) -> PushChannel {
        let settings = PushSettings::from_config(&self.config, session_id);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let channel = PushChannel::spawn(settings, topics, events_tx);

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                self.handle_event(&event);
            }
        });
        channel
    }

    fn mark_created(&self, record: &serde_json::Value) {
        let id = record.get("id").and_then(|v| v.as_str());
        let thread = record.get("thread_id").and_then(|v| v.as_str());
        if let (Some(id), Some(thread)) = (id, thread) {
            self.mark_local(thread, id);
        }
    }
}
