//! Shared wire definitions for the engagement core: push frames exchanged
//! with the fanout gateway, aggregate snapshots and deltas, feed pages, and
//! the uniform REST error body. Keeping this in a dedicated crate allows
//! regeneration of bindings for other runtimes without pulling in heavier
//! runtime code.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Opaque server-assigned identifier for a content item, comment, or
/// engagement record.
pub type EntityId = String;

/// Identifier of the thread (or section) an entity belongs to.
pub type ThreadId = String;

/// The engagement actions a viewer can take on a content item.
///
/// Save and unsave share one kind: they are two directions of the same
/// toggle and are serialized against each other per entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Save,
    Watch,
    Cook,
    Read,
    React,
    Comment,
}

impl ActionKind {
    /// Path segment used by the REST layer for this action.
    pub fn action_path(&self) -> &'static str {
        match self {
            ActionKind::Save => "save",
            ActionKind::Watch => "watch",
            ActionKind::Cook => "cook",
            ActionKind::Read => "read",
            ActionKind::React => "reaction",
            ActionKind::Comment => "comments",
        }
    }
}

/// Per-entity bundle of engagement counts and viewer-scoped state.
///
/// Counts are non-negative; `viewer_flags` and `viewer_sets` reflect only the
/// current session's relationship to the item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    #[serde(default)]
    pub counts: BTreeMap<String, i64>,
    #[serde(default)]
    pub viewer_flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub viewer_sets: BTreeMap<String, BTreeSet<String>>,
}

impl Aggregate {
    pub fn count(&self, name: &str) -> i64 {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.viewer_flags.get(name).copied().unwrap_or(false)
    }

    pub fn set_contains(&self, set: &str, member: &str) -> bool {
        self.viewer_sets
            .get(set)
            .map(|s| s.contains(member))
            .unwrap_or(false)
    }

    /// Apply a field-wise delta. Counts never go below zero.
    pub fn apply(&mut self, delta: &AggregateDelta) {
        for (name, amount) in &delta.counts {
            let entry = self.counts.entry(name.clone()).or_insert(0);
            *entry = (*entry + amount).max(0);
        }
        for (name, value) in &delta.flags {
            self.viewer_flags.insert(name.clone(), *value);
        }
        for (name, members) in &delta.set_insert {
            let set = self.viewer_sets.entry(name.clone()).or_default();
            set.extend(members.iter().cloned());
        }
        for (name, members) in &delta.set_remove {
            if let Some(set) = self.viewer_sets.get_mut(name) {
                for member in members {
                    set.remove(member);
                }
                if set.is_empty() {
                    self.viewer_sets.remove(name);
                }
            }
        }
    }

    pub fn applied(&self, delta: &AggregateDelta) -> Aggregate {
        let mut out = self.clone();
        out.apply(delta);
        out
    }
}

/// Field-wise change to an [`Aggregate`]: count increments (possibly
/// negative), flag assignments, and set membership edits. Used both for
/// optimistic patches and for push-driven deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateDelta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counts: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set_insert: BTreeMap<String, BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set_remove: BTreeMap<String, BTreeSet<String>>,
}

impl AggregateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(mut self, name: &str, amount: i64) -> Self {
        *self.counts.entry(name.to_string()).or_insert(0) += amount;
        self
    }

    pub fn flag(mut self, name: &str, value: bool) -> Self {
        self.flags.insert(name.to_string(), value);
        self
    }

    pub fn insert_into(mut self, set: &str, member: &str) -> Self {
        self.set_insert
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        self
    }

    pub fn remove_from(mut self, set: &str, member: &str) -> Self {
        self.set_remove
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
            && self.flags.is_empty()
            && self.set_insert.is_empty()
            && self.set_remove.is_empty()
    }

    /// Strip the count increments, keeping flag and set edits. Used when a
    /// push echo's counter effect was already applied by the local path.
    pub fn without_counts(&self) -> AggregateDelta {
        AggregateDelta {
            counts: BTreeMap::new(),
            flags: self.flags.clone(),
            set_insert: self.set_insert.clone(),
            set_remove: self.set_remove.clone(),
        }
    }
}

/// Kinds of events fanned out over the push channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PushEventKind {
    CommentCreated,
    CommentUpdated,
    ReactionChanged,
    SaveChanged,
    EngagementLogged,
}

/// A single event on the shared bus / push channel.
///
/// `entity_id` names the entity the event is about (a new comment, a save
/// record); the aggregate the payload's delta applies to is named inside the
/// payload and defaults to the thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushEvent {
    #[serde(rename = "type")]
    pub kind: PushEventKind,
    pub entity_id: EntityId,
    pub thread_id: ThreadId,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl PushEvent {
    pub fn decode_payload(&self) -> Result<EventPayload, serde_json::Error> {
        if self.payload.is_null() {
            return Ok(EventPayload::default());
        }
        serde_json::from_value(self.payload.clone())
    }
}

/// Decoded shape of a push event payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventPayload {
    /// Aggregate change carried by the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<AggregateDelta>,
    /// Entity whose aggregate the delta applies to; defaults to the thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<EntityId>,
    /// Server-assigned representation of the entity, for content merges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<serde_json::Value>,
}

/// Frames sent from the push client to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start receiving events for the given topics.
    Subscribe { topics: Vec<String> },
    /// Stop receiving events for the given topics.
    Unsubscribe { topics: Vec<String> },
    /// Heartbeat to keep the connection alive.
    Ping,
}

/// Frames sent from the gateway to the push client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Acknowledge a subscription change with the now-active topic set.
    SubscribeAck { topics: Vec<String> },
    /// An event published on a subscribed topic.
    Event { event: PushEvent },
    /// Response to ping.
    Pong,
    /// Error message.
    Error { message: String },
}

/// Bus/push topic for a thread.
pub fn thread_topic(thread_id: &str) -> String {
    format!("thread:{}", thread_id)
}

/// Bus/push topic for a section feed.
pub fn section_topic(section: &str) -> String {
    format!("section:{}", section)
}

/// One item of a cursor-paginated feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedItem {
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A page of a cursor-paginated feed. `next_cursor = None` together with
/// `has_more = false` denotes exhaustion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedPageResponse {
    pub items: Vec<FeedItem>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

/// Uniform error body returned by the REST layer and the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Body of the gateway's publish acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcceptedResponse {
    pub accepted: bool,
}

/// Generate a unique connection ID for a gateway connection.
pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_application_clamps_counts_at_zero() {
        let mut agg = Aggregate::default();
        agg.apply(&AggregateDelta::new().incr("saved_count", 2));
        assert_eq!(agg.count("saved_count"), 2);

        agg.apply(&AggregateDelta::new().incr("saved_count", -5));
        assert_eq!(agg.count("saved_count"), 0);
    }

    #[test]
    fn delta_set_edits_round_trip() {
        let mut agg = Aggregate::default();
        agg.apply(
            &AggregateDelta::new()
                .insert_into("viewer_categories", "weeknight")
                .insert_into("viewer_categories", "dessert"),
        );
        assert!(agg.set_contains("viewer_categories", "weeknight"));

        agg.apply(&AggregateDelta::new().remove_from("viewer_categories", "weeknight"));
        assert!(!agg.set_contains("viewer_categories", "weeknight"));
        assert!(agg.set_contains("viewer_categories", "dessert"));
    }

    #[test]
    fn push_event_serializes_with_snake_case_tag() {
        let event = PushEvent {
            kind: PushEventKind::CommentCreated,
            entity_id: "c1".into(),
            thread_id: "t1".into(),
            payload: serde_json::json!({
                "delta": { "counts": { "comment_count": 1 } }
            }),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"comment_created\""));

        let back: PushEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        let payload = back.decode_payload().unwrap();
        assert_eq!(
            payload.delta.unwrap().counts.get("comment_count"),
            Some(&1)
        );
    }

    #[test]
    fn client_frame_tagging_matches_wire_contract() {
        let frame = ClientFrame::Subscribe {
            topics: vec![thread_topic("t1")],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, "{\"type\":\"subscribe\",\"topics\":[\"thread:t1\"]}");
    }
}
