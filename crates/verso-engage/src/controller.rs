//! Orchestrates apply → request → reconcile/rollback for every mutation
//! kind. Built once and reused: each call site supplies its optimistic
//! patch, its request future, and its reconcile policy.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use engage_proto::{ActionKind, Aggregate, AggregateDelta};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::EngageError;
use crate::pending::PendingSet;
use crate::store::AggregateStore;

/// Source of canonical aggregate state, read after a mutating call to
/// overwrite optimistic numbers with server truth.
#[async_trait]
pub trait AggregateReader: Send + Sync {
    async fn canonical_aggregate(
        &self,
        entity_id: &str,
        kind: ActionKind,
    ) -> Result<Aggregate, EngageError>;
}

/// How to fold the server's answer back into local state after a successful
/// request.
pub enum Reconcile<T> {
    /// The optimistic patch already said everything the response would.
    KeepOptimistic,
    /// Merge a delta derived from the response on top of the confirmed state.
    Merge(Box<dyn FnOnce(&T) -> AggregateDelta + Send>),
    /// Replace the aggregate wholesale from the response.
    Replace(Box<dyn FnOnce(&T) -> Aggregate + Send>),
    /// Fetch the canonical aggregate and overwrite the optimistic numbers.
    /// Corrects for concurrent mutations by other sessions that the
    /// optimistic patch could not know about.
    CanonicalRead,
}

pub struct ActionController {
    store: AggregateStore,
    pending: Mutex<PendingSet>,
    reader: Arc<dyn AggregateReader>,
}

impl ActionController {
    pub fn new(store: AggregateStore, reader: Arc<dyn AggregateReader>) -> Self {
        Self {
            store,
            pending: Mutex::new(PendingSet::new()),
            reader,
        }
    }

    pub fn store(&self) -> &AggregateStore {
        &self.store
    }

    pub fn is_pending(&self, entity_id: &str, kind: ActionKind) -> bool {
        self.pending.lock().is_pending(entity_id, kind)
    }

    /// Run one optimistic mutation to completion.
    ///
    /// Snapshot → apply `patch` → record pending → await `request`. Success
    /// reconciles per `reconcile` and discards the pending record; failure
    /// restores the snapshot exactly (including any remote deltas absorbed
    /// while the request was in flight) and surfaces the error. A second
    /// call for the same `(entity, kind)` while one is pending returns
    /// [`EngageError::ActionInFlight`] without touching state.
    pub async fn perform<T, Req, Fut>(
        &self,
        entity_id: &str,
        kind: ActionKind,
        patch: AggregateDelta,
        request: Req,
        reconcile: Reconcile<T>,
    ) -> Result<T, EngageError>
    where
        T: Send,
        Req: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngageError>> + Send,
    {
        let visible = {
            let mut pending = self.pending.lock();
            let current = self.store.get_or_default(entity_id);
            pending.begin(entity_id, kind, current, patch)?
        };
        self.store.set(entity_id, visible);
        debug!(entity = %entity_id, ?kind, "optimistic patch applied");

        match request().await {
            Ok(value) => {
                self.reconcile_success(entity_id, kind, &value, reconcile)
                    .await;
                Ok(value)
            }
            Err(err) => {
                let restored = {
                    let mut pending = self.pending.lock();
                    pending.settle(entity_id, kind, false).map(|s| s.visible)
                };
                if let Some(visible) = restored {
                    self.store.set(entity_id, visible);
                }
                debug!(entity = %entity_id, ?kind, error = %err, "mutation rolled back");
                Err(err)
            }
        }
    }

    async fn reconcile_success<T>(
        &self,
        entity_id: &str,
        kind: ActionKind,
        value: &T,
        reconcile: Reconcile<T>,
    ) {
        match reconcile {
            Reconcile::KeepOptimistic => {
                self.pending.lock().settle(entity_id, kind, true);
            }
            Reconcile::Merge(derive) => {
                let delta = derive(value);
                self.pending.lock().settle(entity_id, kind, true);
                if !delta.is_empty() {
                    self.apply_remote(entity_id, &delta);
                }
            }
            Reconcile::Replace(derive) => {
                let canonical = derive(value);
                let visible = {
                    let mut pending = self.pending.lock();
                    pending.settle(entity_id, kind, true);
                    pending.rebase(entity_id, canonical)
                };
                self.store.set(entity_id, visible);
            }
            Reconcile::CanonicalRead => {
                self.pending.lock().settle(entity_id, kind, true);
                match self.reader.canonical_aggregate(entity_id, kind).await {
                    Ok(canonical) => {
                        let visible = {
                            let mut pending = self.pending.lock();
                            pending.rebase(entity_id, canonical)
                        };
                        self.store.set(entity_id, visible);
                    }
                    Err(err) => {
                        // The mutation itself succeeded; keep the optimistic
                        // numbers until the next read corrects them.
                        warn!(entity = %entity_id, ?kind, error = %err, "reconciling read failed");
                    }
                }
            }
        }
    }

    /// Apply a push-driven (or merge-derived) delta. For an entity with
    /// pending mutations the delta lands on the base snapshot and the
    /// optimistic patches are re-derived on top; otherwise it patches the
    /// store directly.
    pub fn apply_remote(&self, entity_id: &str, delta: &AggregateDelta) {
        let absorbed = {
            let mut pending = self.pending.lock();
            pending.absorb_remote(entity_id, delta)
        };
        match absorbed {
            Some(visible) => self.store.set(entity_id, visible),
            None => {
                self.store.patch(entity_id, delta);
            }
        }
    }
}
