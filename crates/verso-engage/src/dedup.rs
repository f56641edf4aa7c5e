//! Suppresses double-application of a locally originated action's effect
//! when its push echo arrives.
//!
//! An entry is added when this session inserts an entity it just created
//! (a comment, a save record). The first matching push event consumes the
//! entry and skips the counter increment that the local path already
//! applied; any later push for the same ID is a normal remote update. The
//! registry is bounded per scope (LRU) and time (TTL) so an echo that never
//! arrives cannot leak entries: in that case no correction was needed,
//! because only the local path incremented.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use engage_proto::{EntityId, ThreadId};

pub const DEFAULT_CAPACITY: usize = 128;
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct ScopeEntries {
    order: VecDeque<EntityId>,
    marked_at: HashMap<EntityId, Instant>,
}

/// Per-thread registry of entity IDs this session originated.
#[derive(Debug)]
pub struct SeenEventRegistry {
    capacity: usize,
    ttl: Duration,
    scopes: HashMap<ThreadId, ScopeEntries>,
}

impl Default for SeenEventRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl SeenEventRegistry {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            scopes: HashMap::new(),
        }
    }

    /// Record a locally created entity, to be consumed by its push echo.
    pub fn mark_local(&mut self, thread_id: &str, entity_id: &str) {
        let scope = self.scopes.entry(thread_id.to_string()).or_default();
        expire(scope, self.ttl);
        if scope.marked_at.contains_key(entity_id) {
            return;
        }
        while scope.order.len() >= self.capacity {
            if let Some(oldest) = scope.order.pop_front() {
                scope.marked_at.remove(&oldest);
            }
        }
        scope.order.push_back(entity_id.to_string());
        scope.marked_at.insert(entity_id.to_string(), Instant::now());
    }

    /// Consume the entry for an entity if this session marked it. Returns
    /// true exactly once per mark; the caller then skips the duplicate
    /// counter increment. Consumption is a deliberate side effect, not a
    /// pure query.
    pub fn consume_if_seen(&mut self, thread_id: &str, entity_id: &str) -> bool {
        let Some(scope) = self.scopes.get_mut(thread_id) else {
            return false;
        };
        expire(scope, self.ttl);
        let hit = scope.marked_at.remove(entity_id).is_some();
        if hit {
            scope.order.retain(|id| id != entity_id);
        }
        if scope.marked_at.is_empty() {
            self.scopes.remove(thread_id);
        }
        hit
    }

    pub fn len(&self) -> usize {
        self.scopes.values().map(|s| s.marked_at.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn expire(scope: &mut ScopeEntries, ttl: Duration) {
    let now = Instant::now();
    while let Some(oldest) = scope.order.front() {
        let stale = scope
            .marked_at
            .get(oldest)
            .map(|at| now.duration_since(*at) > ttl)
            .unwrap_or(true);
        if !stale {
            break;
        }
        let oldest = scope.order.pop_front().unwrap_or_default();
        scope.marked_at.remove(&oldest);
    }
}
