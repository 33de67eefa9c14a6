//! Change Tracking
//!
//! [`ChangeTracker`] keeps the set of entities mutated since the last
//! accepted checkpoint, keyed by [`EntityId`] rather than value equality,
//! and notifies subscribers on every dirty/clean transition.
//!
//! Transitions are detected atomically by the concurrent map: only the
//! caller whose insert (or remove) actually changed membership notifies.
//! Handlers run synchronously on that caller's thread, outside any lock;
//! their errors and panics are logged and swallowed.

use crate::entity::{EntityId, EntityRef, Trackable};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Errors from tracker operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("change tracker has been disposed")]
    Disposed,
}

/// Notification payload for a dirty/clean transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityStateChange {
    /// Entity whose state changed
    pub entity: EntityRef,
    /// `true` when it became dirty, `false` when it became clean
    pub is_dirty: bool,
}

/// Handle returned by [`ChangeTracker::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Subscriber callback
pub type ChangeHandler = Arc<dyn Fn(&EntityStateChange) -> anyhow::Result<()> + Send + Sync>;

/// Identity-keyed dirty set with change notifications
pub struct ChangeTracker {
    dirty: DashMap<EntityId, EntityRef>,
    subscribers: RwLock<Vec<(SubscriptionId, ChangeHandler)>>,
    next_subscription: AtomicU64,
    disposed: AtomicBool,
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeTracker {
    /// Create an empty tracker with no subscribers
    pub fn new() -> Self {
        Self {
            dirty: DashMap::new(),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_active(&self) -> Result<(), TrackerError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(TrackerError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    // =========================================================================
    // State Transitions
    // =========================================================================

    /// Mark an entity dirty
    ///
    /// Idempotent. Returns `true` (and notifies) only on an actual
    /// clean-to-dirty transition.
    pub fn mark_dirty(&self, entity: &impl Trackable) -> Result<bool, TrackerError> {
        self.ensure_active()?;
        let entity = entity.entity_ref();
        let became_dirty = self.dirty.insert(entity.id, entity.clone()).is_none();
        if became_dirty {
            trace!(entity = %entity, "entity became dirty");
            self.notify(EntityStateChange {
                entity,
                is_dirty: true,
            });
        }
        Ok(became_dirty)
    }

    /// Mark an entity clean
    ///
    /// Returns `true` (and notifies) only on an actual dirty-to-clean
    /// transition.
    pub fn mark_clean(&self, entity: &impl Trackable) -> Result<bool, TrackerError> {
        self.ensure_active()?;
        let id = entity.entity_ref().id;
        match self.dirty.remove(&id) {
            Some((_, entity)) => {
                trace!(entity = %entity, "entity became clean");
                self.notify(EntityStateChange {
                    entity,
                    is_dirty: false,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether an entity is currently dirty
    pub fn is_dirty(&self, entity: &impl Trackable) -> Result<bool, TrackerError> {
        self.ensure_active()?;
        Ok(self.dirty.contains_key(&entity.entity_ref().id))
    }

    /// Materialized list of dirty entities, ordered by identity
    pub fn dirty_entities(&self) -> Result<Vec<EntityRef>, TrackerError> {
        self.ensure_active()?;
        let mut entities: Vec<EntityRef> =
            self.dirty.iter().map(|entry| entry.value().clone()).collect();
        entities.sort_by_key(|e| e.id);
        Ok(entities)
    }

    /// Number of dirty entities
    pub fn dirty_count(&self) -> Result<usize, TrackerError> {
        self.ensure_active()?;
        Ok(self.dirty.len())
    }

    /// Whether any entity is dirty
    pub fn has_changes(&self) -> Result<bool, TrackerError> {
        self.ensure_active()?;
        Ok(!self.dirty.is_empty())
    }

    /// Forget all dirty entities without notifying
    pub fn clear(&self) -> Result<(), TrackerError> {
        self.ensure_active()?;
        let count = self.dirty.len();
        self.dirty.clear();
        debug!(count, "change tracker cleared");
        Ok(())
    }

    /// Mark every dirty entity clean, one notification each
    ///
    /// Returns the number of entities accepted.
    pub fn accept_all_changes(&self) -> Result<usize, TrackerError> {
        self.ensure_active()?;
        let mut ids: Vec<EntityId> = self.dirty.iter().map(|entry| *entry.key()).collect();
        ids.sort();

        let mut accepted = 0;
        for id in ids {
            if let Some((_, entity)) = self.dirty.remove(&id) {
                accepted += 1;
                self.notify(EntityStateChange {
                    entity,
                    is_dirty: false,
                });
            }
        }
        debug!(accepted, "accepted pending changes");
        Ok(accepted)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register a handler for state transitions
    pub fn subscribe<F>(&self, handler: F) -> Result<SubscriptionId, TrackerError>
    where
        F: Fn(&EntityStateChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ensure_active()?;
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(handler)));
        Ok(id)
    }

    /// Remove a handler; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, TrackerError> {
        self.ensure_active()?;
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        Ok(subscribers.len() != before)
    }

    /// Release all state; every later call fails with `Disposed`
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dirty.clear();
        self.subscribers.write().clear();
        debug!("change tracker disposed");
    }

    fn notify(&self, change: EntityStateChange) {
        // Handlers may call back into the tracker
        let handlers: Vec<ChangeHandler> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&change))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(entity = %change.entity, error = %e, "change handler failed");
                }
                Err(_) => {
                    warn!(entity = %change.entity, "change handler panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, Table};
    use parking_lot::Mutex;

    fn recorder(tracker: &ChangeTracker) -> Arc<Mutex<Vec<EntityStateChange>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        tracker
            .subscribe(move |change| {
                sink.lock().push(change.clone());
                Ok(())
            })
            .unwrap();
        log
    }

    #[test]
    fn test_clean_by_default() {
        let tracker = ChangeTracker::new();
        let table = Table::new("dbo", "orders");
        assert!(!tracker.is_dirty(&table).unwrap());
        assert!(!tracker.has_changes().unwrap());
    }

    #[test]
    fn test_double_mark_notifies_once() {
        let tracker = ChangeTracker::new();
        let log = recorder(&tracker);
        let table = Table::new("dbo", "orders");

        assert!(tracker.mark_dirty(&table).unwrap());
        assert!(!tracker.mark_dirty(&table).unwrap());

        assert_eq!(tracker.dirty_count().unwrap(), 1);
        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert!(log[0].is_dirty);
        assert_eq!(log[0].entity.id, table.id());
    }

    #[test]
    fn test_identity_not_equality() {
        let tracker = ChangeTracker::new();
        let a = Table::new("dbo", "orders");
        let b = Table::new("dbo", "orders");
        tracker.mark_dirty(&a).unwrap();

        assert!(tracker.is_dirty(&a).unwrap());
        assert!(!tracker.is_dirty(&b).unwrap());
        // A clone shares identity
        assert!(tracker.is_dirty(&a.clone()).unwrap());
    }

    #[test]
    fn test_clean_after_dirty() {
        let tracker = ChangeTracker::new();
        let log = recorder(&tracker);
        let table = Table::new("dbo", "orders");

        tracker.mark_dirty(&table).unwrap();
        assert!(tracker.mark_clean(&table).unwrap());
        assert!(!tracker.mark_clean(&table).unwrap());

        assert!(!tracker.is_dirty(&table).unwrap());
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_clear_is_silent() {
        let tracker = ChangeTracker::new();
        let table = Table::new("dbo", "orders");
        tracker.mark_dirty(&table).unwrap();
        let log = recorder(&tracker);

        tracker.clear().unwrap();
        assert!(!tracker.is_dirty(&table).unwrap());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_accept_all_changes() {
        let tracker = ChangeTracker::new();
        let tables: Vec<Table> = (0..5).map(|i| Table::new("dbo", format!("t{i}"))).collect();
        for table in &tables {
            tracker.mark_dirty(table).unwrap();
        }
        let log = recorder(&tracker);

        assert_eq!(tracker.accept_all_changes().unwrap(), 5);
        assert!(!tracker.has_changes().unwrap());
        assert_eq!(tracker.dirty_count().unwrap(), 0);

        let log = log.lock();
        assert_eq!(log.len(), 5);
        assert!(log.iter().all(|c| !c.is_dirty));
    }

    #[test]
    fn test_dirty_entities_sorted() {
        let tracker = ChangeTracker::new();
        let first = Table::new("dbo", "a");
        let second = Table::new("dbo", "b");
        tracker.mark_dirty(&second).unwrap();
        tracker.mark_dirty(&first).unwrap();

        let dirty = tracker.dirty_entities().unwrap();
        let ids: Vec<EntityId> = dirty.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
    }

    #[test]
    fn test_failing_handlers_are_contained() {
        let tracker = ChangeTracker::new();
        tracker
            .subscribe(|_| Err(anyhow::anyhow!("observer offline")))
            .unwrap();
        tracker.subscribe(|_| panic!("observer bug")).unwrap();
        let log = recorder(&tracker);

        let table = Table::new("dbo", "orders");
        assert!(tracker.mark_dirty(&table).unwrap());
        assert!(tracker.is_dirty(&table).unwrap());
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let tracker = ChangeTracker::new();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let id = tracker
            .subscribe(move |_| {
                *counter.lock() += 1;
                Ok(())
            })
            .unwrap();

        tracker.mark_dirty(&Table::new("dbo", "a")).unwrap();
        assert!(tracker.unsubscribe(id).unwrap());
        assert!(!tracker.unsubscribe(id).unwrap());
        tracker.mark_dirty(&Table::new("dbo", "b")).unwrap();

        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn test_dispose() {
        let tracker = ChangeTracker::new();
        let table = Table::new("dbo", "orders");
        tracker.mark_dirty(&table).unwrap();
        tracker.dispose();

        assert!(tracker.is_disposed());
        assert_eq!(tracker.is_dirty(&table), Err(TrackerError::Disposed));
        assert_eq!(tracker.mark_dirty(&table), Err(TrackerError::Disposed));
        assert_eq!(tracker.dirty_count(), Err(TrackerError::Disposed));
        assert!(tracker.subscribe(|_| Ok(())).is_err());
    }
}
