//! Per-action bookkeeping of in-flight mutations and rollback snapshots.
//!
//! At most one mutation may be pending per `(entity, action kind)`. Different
//! kinds on the same entity may be in flight together; they share one base
//! snapshot and patch disjoint fields. Remote deltas that arrive while
//! anything is pending are absorbed into the base, and the optimistic patches
//! are re-derived on top, so neither side's update is lost.

use std::collections::HashMap;

use engage_proto::{ActionKind, Aggregate, AggregateDelta, EntityId};

use crate::error::EngageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    Confirmed,
    Failed,
}

/// One in-flight optimistic mutation.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub patch: AggregateDelta,
    pub status: MutationStatus,
}

#[derive(Debug)]
struct EntityPending {
    /// State before the first pending action, with any remote deltas that
    /// arrived since absorbed into it.
    base: Aggregate,
    /// Insertion order of pending kinds, for deterministic re-derivation.
    order: Vec<ActionKind>,
    muts: HashMap<ActionKind, PendingMutation>,
}

impl EntityPending {
    fn visible(&self) -> Aggregate {
        let mut out = self.base.clone();
        for kind in &self.order {
            if let Some(m) = self.muts.get(kind) {
                out.apply(&m.patch);
            }
        }
        out
    }
}

/// Result of settling one pending mutation.
#[derive(Debug)]
pub struct Settled {
    pub mutation: PendingMutation,
    /// The state the entity should show after settlement: for a failure this
    /// is the restored snapshot (plus any surviving sibling patches), for a
    /// confirmation it is unchanged from what was already displayed.
    pub visible: Aggregate,
}

/// Tracker of all pending mutations across entities. Not internally
/// synchronized; the controller holds it behind a lock.
#[derive(Debug, Default)]
pub struct PendingSet {
    entities: HashMap<EntityId, EntityPending>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self, entity_id: &str, kind: ActionKind) -> bool {
        self.entities
            .get(entity_id)
            .map(|e| e.muts.contains_key(&kind))
            .unwrap_or(false)
    }

    pub fn has_pending(&self, entity_id: &str) -> bool {
        self.entities.contains_key(entity_id)
    }

    /// Record a new pending mutation. `current` is the stored state at call
    /// time; it becomes the base snapshot only when nothing else is already
    /// pending for this entity: otherwise the existing base (which predates
    /// the sibling patches) is kept. Returns the resulting visible state.
    pub fn begin(
        &mut self,
        entity_id: &str,
        kind: ActionKind,
        current: Aggregate,
        patch: AggregateDelta,
    ) -> Result<Aggregate, EngageError> {
        let entry = self
            .entities
            .entry(entity_id.to_string())
            .or_insert_with(|| EntityPending {
                base: current,
                order: Vec::new(),
                muts: HashMap::new(),
            });
        if entry.muts.contains_key(&kind) {
            return Err(EngageError::ActionInFlight {
                entity_id: entity_id.to_string(),
                kind,
            });
        }
        entry.order.push(kind);
        entry.muts.insert(
            kind,
            PendingMutation {
                patch,
                status: MutationStatus::Pending,
            },
        );
        Ok(entry.visible())
    }

    /// Absorb a remote delta for an entity with pending mutations: the delta
    /// lands on the base snapshot and the optimistic patches are re-applied
    /// on top. Returns the new visible state, or `None` when nothing is
    /// pending and the caller should patch the store directly.
    pub fn absorb_remote(
        &mut self,
        entity_id: &str,
        delta: &AggregateDelta,
    ) -> Option<Aggregate> {
        let entry = self.entities.get_mut(entity_id)?;
        entry.base.apply(delta);
        Some(entry.visible())
    }

    /// Settle one pending mutation. Confirmation folds the patch into the
    /// base (its effect survives); failure discards the patch (the snapshot
    /// is restored). The record is destroyed either way.
    pub fn settle(&mut self, entity_id: &str, kind: ActionKind, confirmed: bool) -> Option<Settled> {
        let entry = self.entities.get_mut(entity_id)?;
        let mut mutation = entry.muts.remove(&kind)?;
        entry.order.retain(|k| *k != kind);
        mutation.status = if confirmed {
            entry.base.apply(&mutation.patch);
            MutationStatus::Confirmed
        } else {
            MutationStatus::Failed
        };
        let visible = entry.visible();
        if entry.muts.is_empty() {
            self.entities.remove(entity_id);
        }
        Some(Settled { mutation, visible })
    }

    /// Replace the base snapshot with server-canonical state and re-derive
    /// any still-pending patches on top. For an entity with nothing pending
    /// the canonical state is the visible state.
    pub fn rebase(&mut self, entity_id: &str, canonical: Aggregate) -> Aggregate {
        match self.entities.get_mut(entity_id) {
            Some(entry) => {
                entry.base = canonical;
                entry.visible()
            }
            None => canonical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_with(count: &str, value: i64) -> Aggregate {
        let mut agg = Aggregate::default();
        agg.counts.insert(count.into(), value);
        agg
    }

    #[test]
    fn second_begin_for_same_kind_is_rejected_without_corruption() {
        let mut pending = PendingSet::new();
        let patch = AggregateDelta::new().incr("saved_count", 1).flag("viewer_saved", true);
        let visible = pending
            .begin("m1", ActionKind::Save, base_with("saved_count", 2), patch.clone())
            .unwrap();
        assert_eq!(visible.count("saved_count"), 3);

        let err = pending
            .begin("m1", ActionKind::Save, visible, patch)
            .unwrap_err();
        assert!(matches!(err, EngageError::ActionInFlight { .. }));

        // The original mutation is untouched.
        let settled = pending.settle("m1", ActionKind::Save, false).unwrap();
        assert_eq!(settled.visible.count("saved_count"), 2);
    }

    #[test]
    fn different_kinds_share_one_base_snapshot() {
        let mut pending = PendingSet::new();
        pending
            .begin(
                "m1",
                ActionKind::Save,
                base_with("saved_count", 2),
                AggregateDelta::new().incr("saved_count", 1),
            )
            .unwrap();
        // Second kind: the provided "current" already contains the save
        // patch, but the base must stay pre-action.
        let visible = pending
            .begin(
                "m1",
                ActionKind::Watch,
                base_with("saved_count", 3),
                AggregateDelta::new().incr("watch_count", 1),
            )
            .unwrap();
        assert_eq!(visible.count("saved_count"), 3);
        assert_eq!(visible.count("watch_count"), 1);

        // Rolling back the save leaves the watch patch in place.
        let settled = pending.settle("m1", ActionKind::Save, false).unwrap();
        assert_eq!(settled.visible.count("saved_count"), 2);
        assert_eq!(settled.visible.count("watch_count"), 1);
    }

    #[test]
    fn absorbed_remote_delta_survives_rollback() {
        let mut pending = PendingSet::new();
        pending
            .begin(
                "m1",
                ActionKind::Save,
                base_with("saved_count", 3),
                AggregateDelta::new().incr("saved_count", 1).flag("viewer_saved", true),
            )
            .unwrap();

        // Another session's save arrives over the push channel.
        let visible = pending
            .absorb_remote("m1", &AggregateDelta::new().incr("saved_count", 1))
            .unwrap();
        assert_eq!(visible.count("saved_count"), 5);

        // Our own request fails: the other session's increment is kept.
        let settled = pending.settle("m1", ActionKind::Save, false).unwrap();
        assert_eq!(settled.mutation.status, MutationStatus::Failed);
        assert_eq!(settled.visible.count("saved_count"), 4);
        assert!(!settled.visible.flag("viewer_saved"));
    }

    #[test]
    fn rebase_rederives_surviving_patches_on_canonical_state() {
        let mut pending = PendingSet::new();
        pending
            .begin(
                "m1",
                ActionKind::Save,
                base_with("saved_count", 2),
                AggregateDelta::new().incr("saved_count", 1),
            )
            .unwrap();
        pending
            .begin(
                "m1",
                ActionKind::Watch,
                base_with("saved_count", 3),
                AggregateDelta::new().incr("watch_count", 1),
            )
            .unwrap();

        // The save confirms and its canonical read lands: server says 7
        // saves (others were saving too) and no watches yet.
        pending.settle("m1", ActionKind::Save, true).unwrap();
        let mut canonical = base_with("saved_count", 7);
        canonical.counts.insert("watch_count".into(), 0);
        let visible = pending.rebase("m1", canonical);
        assert_eq!(visible.count("saved_count"), 7);
        // The still-pending watch patch is re-applied on top.
        assert_eq!(visible.count("watch_count"), 1);
    }

    #[test]
    fn settling_the_last_mutation_destroys_the_record() {
        let mut pending = PendingSet::new();
        pending
            .begin(
                "m1",
                ActionKind::Save,
                Aggregate::default(),
                AggregateDelta::new().incr("saved_count", 1),
            )
            .unwrap();
        let settled = pending.settle("m1", ActionKind::Save, true).unwrap();
        assert_eq!(settled.mutation.status, MutationStatus::Confirmed);
        assert!(!pending.has_pending("m1"));
        assert!(pending.settle("m1", ActionKind::Save, true).is_none());
    }
}
