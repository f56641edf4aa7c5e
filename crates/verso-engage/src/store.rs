//! Reactive container for engagement aggregates.
//!
//! One store instance backs one aggregate domain and is shared by every view
//! showing the same entity. Views only read and subscribe; mutation goes
//! through the action controller and the push router. Observer callbacks run
//! outside the store locks, after the change they describe has been applied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use engage_proto::{Aggregate, AggregateDelta, EntityId};
use parking_lot::{Mutex, RwLock};

type Observer = Arc<dyn Fn(&Aggregate) + Send + Sync>;

#[derive(Default)]
struct StoreInner {
    entries: RwLock<HashMap<EntityId, Aggregate>>,
    observers: Mutex<HashMap<EntityId, Vec<(u64, Observer)>>>,
    next_token: AtomicU64,
}

/// Observable key-value store of [`Aggregate`]s keyed by entity ID.
///
/// Aggregates are created lazily on first observation or patch, and live only
/// for the session. Changes are applied in call order; a `patch` applied
/// after a `set` cannot resurrect fields the `set` replaced, because each
/// call rewrites the stored value before any later call reads it.
#[derive(Clone, Default)]
pub struct AggregateStore {
    inner: Arc<StoreInner>,
}

impl AggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_id: &str) -> Option<Aggregate> {
        self.inner.entries.read().get(entity_id).cloned()
    }

    /// Current value, or an empty aggregate for an entity not yet observed.
    pub fn get_or_default(&self, entity_id: &str) -> Aggregate {
        self.get(entity_id).unwrap_or_default()
    }

    /// Replace the stored aggregate wholesale. Used for reconciling reads
    /// and feed loads.
    pub fn set(&self, entity_id: &str, aggregate: Aggregate) {
        self.inner
            .entries
            .write()
            .insert(entity_id.to_string(), aggregate.clone());
        self.notify(entity_id, &aggregate);
    }

    /// Merge a field-wise delta into the stored aggregate, creating it if
    /// this is the first observation. Returns the resulting value.
    pub fn patch(&self, entity_id: &str, delta: &AggregateDelta) -> Aggregate {
        let updated = {
            let mut entries = self.inner.entries.write();
            let entry = entries.entry(entity_id.to_string()).or_default();
            entry.apply(delta);
            entry.clone()
        };
        self.notify(entity_id, &updated);
        updated
    }

    /// Drop an aggregate once its last view is gone. Observers are removed
    /// by dropping their [`StoreSubscription`]s, not by eviction.
    pub fn evict(&self, entity_id: &str) {
        self.inner.entries.write().remove(entity_id);
    }

    /// Observe changes to one entity. The returned subscription unsubscribes
    /// on drop; dropping it never disturbs the aggregate itself, which other
    /// views may still be watching.
    pub fn subscribe<F>(&self, entity_id: &str, observer: F) -> StoreSubscription
    where
        F: Fn(&Aggregate) + Send + Sync + 'static,
    {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner
            .observers
            .lock()
            .entry(entity_id.to_string())
            .or_default()
            .push((token, Arc::new(observer)));
        StoreSubscription {
            inner: Arc::downgrade(&self.inner),
            entity_id: entity_id.to_string(),
            token,
        }
    }

    fn notify(&self, entity_id: &str, aggregate: &Aggregate) {
        let observers: Vec<Observer> = {
            let guard = self.inner.observers.lock();
            match guard.get(entity_id) {
                Some(list) => list.iter().map(|(_, f)| f.clone()).collect(),
                None => return,
            }
        };
        for observer in observers {
            observer(aggregate);
        }
    }
}

/// Disposer handle for a store observer.
pub struct StoreSubscription {
    inner: Weak<StoreInner>,
    entity_id: EntityId,
    token: u64,
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut observers = inner.observers.lock();
            if let Some(list) = observers.get_mut(&self.entity_id) {
                list.retain(|(token, _)| *token != self.token);
                if list.is_empty() {
                    observers.remove(&self.entity_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engage_proto::AggregateDelta;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn patch_creates_lazily_and_notifies() {
        let store = AggregateStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let _sub = store.subscribe("m1", move |agg| {
            seen_clone.store(agg.count("saved_count") as usize, Ordering::SeqCst);
        });

        assert!(store.get("m1").is_none());
        store.patch("m1", &AggregateDelta::new().incr("saved_count", 3));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(store.get("m1").unwrap().count("saved_count"), 3);
    }

    #[test]
    fn set_replaces_fields_a_later_patch_cannot_resurrect() {
        let store = AggregateStore::new();
        store.patch(
            "m1",
            &AggregateDelta::new()
                .flag("viewer_saved", true)
                .incr("saved_count", 2),
        );

        // Reconciling read clears the viewer flag entirely.
        store.set("m1", {
            let mut agg = Aggregate::default();
            agg.counts.insert("saved_count".into(), 2);
            agg
        });
        assert!(!store.get("m1").unwrap().flag("viewer_saved"));

        // A later count-only patch leaves the cleared flag alone.
        store.patch("m1", &AggregateDelta::new().incr("saved_count", 1));
        let agg = store.get("m1").unwrap();
        assert_eq!(agg.count("saved_count"), 3);
        assert!(!agg.flag("viewer_saved"));
    }

    #[test]
    fn dropping_subscription_stops_notifications() {
        let store = AggregateStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let sub = store.subscribe("m1", move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.patch("m1", &AggregateDelta::new().incr("saved_count", 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(sub);
        store.patch("m1", &AggregateDelta::new().incr("saved_count", 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn eviction_removes_the_entry_without_touching_other_entities() {
        let store = AggregateStore::new();
        store.patch("m1", &AggregateDelta::new().incr("saved_count", 1));
        store.patch("m2", &AggregateDelta::new().incr("saved_count", 5));

        store.evict("m1");
        assert!(store.get("m1").is_none());
        assert_eq!(store.get("m2").unwrap().count("saved_count"), 5);
    }
}
