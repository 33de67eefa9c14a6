//! Schema Model Aggregate
//!
//! [`SchemaModel`] owns the table, view and procedure collections of one
//! schema model and ties together the other pieces of the runtime layer:
//!
//! - **Eager mode**: collections are in-memory `Arc<Vec<T>>`s, filled at
//!   construction (`new`, `from_snapshot`, `hydrate`)
//! - **Lazy mode**: after [`SchemaModel::enable_lazy_loading`] each
//!   collection is a [`LazyEntityProxy`] backed by a [`ModelStore`]; the
//!   first mutation of a collection creates a model-level working copy and
//!   the proxy's collection stays immutable
//! - **Change tracking**: an attached [`ChangeTracker`] hears about every
//!   mutation made through the model
//!
//! All methods take `&self`; the model can be shared behind an `Arc`.
//! Disposal is terminal and is checked again after every suspension point.

use crate::cache::{model_cache_key, CacheError, CacheStore};
use crate::entity::{EntityId, EntityKind, EntityRef, StoredProcedure, Table, Trackable, View};
use crate::lazy::{BoxError, LazyEntityProxy, LoadState, ProxyError};
use crate::store::{ModelStore, SourceLocation, StoreError, StoredEntity};
use crate::tracking::{ChangeTracker, TrackerError};
use dashmap::DashMap;
use parking_lot::RwLock;
use schemaprysm_config::LazyLoadingConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from model operations
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model has been disposed")]
    Disposed,

    #[error("lazy loading is already enabled for this model")]
    LazyLoadingAlreadyEnabled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ModelError {
    /// Create an InvalidArgument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

/// Fully materialized, point-in-time copy of a model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub name: String,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub views: Vec<View>,
    #[serde(default)]
    pub procedures: Vec<StoredProcedure>,
    /// Unix timestamp (seconds) when the snapshot was taken
    pub captured_at: u64,
}

impl ModelSnapshot {
    /// Total number of entities across all collections
    pub fn entity_count(&self) -> usize {
        self.tables.len() + self.views.len() + self.procedures.len()
    }
}

/// Cache of model snapshots keyed by `project:model`
pub type SnapshotCache = CacheStore<ModelSnapshot>;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

// =============================================================================
// Collection Slots
// =============================================================================

enum Mode<T> {
    Eager(Arc<Vec<T>>),
    Lazy {
        proxy: Arc<LazyEntityProxy<T>>,
        /// Created on first mutation
        working: Option<Arc<Vec<T>>>,
    },
}

/// One entity collection of the model
struct CollectionSlot<T> {
    mode: RwLock<Mode<T>>,
}

impl<T: StoredEntity> CollectionSlot<T> {
    fn eager(items: Vec<T>) -> Self {
        Self {
            mode: RwLock::new(Mode::Eager(Arc::new(items))),
        }
    }

    fn make_lazy(&self, proxy: Arc<LazyEntityProxy<T>>) {
        *self.mode.write() = Mode::Lazy {
            proxy,
            working: None,
        };
    }

    async fn get(&self) -> Result<Arc<Vec<T>>, ProxyError> {
        let proxy = {
            let mode = self.mode.read();
            match &*mode {
                Mode::Eager(items) => return Ok(Arc::clone(items)),
                Mode::Lazy {
                    working: Some(items),
                    ..
                } => return Ok(Arc::clone(items)),
                Mode::Lazy { proxy, .. } => Arc::clone(proxy),
            }
        };
        proxy.get_entities().await
    }

    /// Apply `f` to the mutable collection
    ///
    /// A lazy slot without a working copy is loaded first, then copied.
    async fn mutate<R, F>(&self, f: F) -> Result<R, ProxyError>
    where
        F: FnOnce(&mut Vec<T>) -> R + Send,
    {
        let mut base: Option<Arc<Vec<T>>> = None;
        loop {
            let proxy = {
                let mut mode = self.mode.write();
                match &mut *mode {
                    Mode::Eager(items) => return Ok(f(Arc::make_mut(items))),
                    Mode::Lazy { proxy, working } => {
                        if working.is_none() {
                            *working = base.take();
                        }
                        match working {
                            Some(items) => return Ok(f(Arc::make_mut(items))),
                            None => Arc::clone(proxy),
                        }
                    }
                }
            };
            base = Some(proxy.get_entities().await?);
        }
    }

    fn load_state(&self) -> LoadState {
        match &*self.mode.read() {
            Mode::Eager(_) => LoadState::Loaded,
            Mode::Lazy {
                working: Some(_), ..
            } => LoadState::Loaded,
            Mode::Lazy { proxy, .. } => proxy.state(),
        }
    }

    /// Drop the working copy and reset the proxy
    fn refresh(&self) -> Result<bool, ProxyError> {
        let mut mode = self.mode.write();
        match &mut *mode {
            Mode::Eager(_) => Ok(false),
            Mode::Lazy { proxy, working } => {
                *working = None;
                proxy.reset()?;
                Ok(true)
            }
        }
    }

    fn dispose(&self) {
        let mut mode = self.mode.write();
        if let Mode::Lazy { proxy, .. } = &*mode {
            proxy.dispose();
        }
        *mode = Mode::Eager(Arc::new(Vec::new()));
    }
}

// =============================================================================
// Schema Model
// =============================================================================

/// Attached change tracker
struct TrackerBinding {
    tracker: Arc<ChangeTracker>,
    /// Disposed together with the model
    owned: bool,
}

/// Aggregate of tables, views and stored procedures
pub struct SchemaModel {
    id: EntityId,
    name: String,
    tables: CollectionSlot<Table>,
    views: CollectionSlot<View>,
    procedures: CollectionSlot<StoredProcedure>,
    /// Set once lazy loading is enabled
    lazy_source: RwLock<Option<SourceLocation>>,
    tracker: RwLock<Option<TrackerBinding>>,
    /// Unsaved edits made through this model: entity -> (descriptor, edit sequence)
    pending: DashMap<EntityId, (EntityRef, u64)>,
    edit_seq: AtomicU64,
    disposed: AtomicBool,
}

impl SchemaModel {
    /// Create an empty eager model
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_collections(name.into(), Vec::new(), Vec::new(), Vec::new())
    }

    /// Create an eager model from a snapshot
    pub fn from_snapshot(snapshot: ModelSnapshot) -> Self {
        Self::with_collections(
            snapshot.name,
            snapshot.tables,
            snapshot.views,
            snapshot.procedures,
        )
    }

    /// Create an eager model by loading every collection from a store
    pub async fn hydrate(
        name: impl Into<String>,
        store: &dyn ModelStore,
        source: &SourceLocation,
    ) -> Result<Self, ModelError> {
        if source.is_empty() {
            return Err(ModelError::invalid_argument("source location must not be empty"));
        }
        let name = name.into();
        let (tables, views, procedures) = futures::try_join!(
            store.load_tables(source),
            store.load_views(source),
            store.load_procedures(source),
        )?;
        info!(
            model = %name,
            source = %source,
            tables = tables.len(),
            views = views.len(),
            procedures = procedures.len(),
            "hydrated model"
        );
        Ok(Self::with_collections(name, tables, views, procedures))
    }

    /// Open a model over a store, lazily or eagerly as configured
    pub async fn open(
        name: impl Into<String>,
        store: Arc<dyn ModelStore>,
        source: SourceLocation,
        config: &LazyLoadingConfig,
    ) -> Result<Self, ModelError> {
        if config.enabled {
            let model = Self::new(name);
            model.enable_lazy_loading(source, store)?;
            Ok(model)
        } else {
            Self::hydrate(name, store.as_ref(), &source).await
        }
    }

    fn with_collections(
        name: String,
        tables: Vec<Table>,
        views: Vec<View>,
        procedures: Vec<StoredProcedure>,
    ) -> Self {
        Self {
            id: EntityId::allocate(),
            name,
            tables: CollectionSlot::eager(tables),
            views: CollectionSlot::eager(views),
            procedures: CollectionSlot::eager(procedures),
            lazy_source: RwLock::new(None),
            tracker: RwLock::new(None),
            pending: DashMap::new(),
            edit_seq: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    /// Identity of the model itself
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Model name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_active(&self) -> Result<(), ModelError> {
        if self.is_disposed() {
            Err(ModelError::Disposed)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Lazy Loading
    // =========================================================================

    /// Switch every collection to load on first access from `store`
    ///
    /// One-time and irreversible. Eager collections are discarded.
    pub fn enable_lazy_loading(
        &self,
        source: SourceLocation,
        store: Arc<dyn ModelStore>,
    ) -> Result<(), ModelError> {
        self.ensure_active()?;
        if source.is_empty() {
            return Err(ModelError::invalid_argument("source location must not be empty"));
        }

        let mut lazy_source = self.lazy_source.write();
        if lazy_source.is_some() {
            return Err(ModelError::LazyLoadingAlreadyEnabled);
        }

        self.tables.make_lazy(lazy_proxy(&source, &store));
        self.views.make_lazy(lazy_proxy(&source, &store));
        self.procedures.make_lazy(lazy_proxy(&source, &store));

        info!(model = %self.name, source = %source, "lazy loading enabled");
        *lazy_source = Some(source);
        Ok(())
    }

    /// Whether lazy loading has been enabled
    pub fn is_lazy(&self) -> bool {
        self.lazy_source.read().is_some()
    }

    /// Source location of a lazy model
    pub fn source(&self) -> Option<SourceLocation> {
        self.lazy_source.read().clone()
    }

    /// Load state of one collection
    pub fn load_state(&self, kind: EntityKind) -> Result<LoadState, ModelError> {
        self.ensure_active()?;
        match kind {
            EntityKind::Table => Ok(self.tables.load_state()),
            EntityKind::View => Ok(self.views.load_state()),
            EntityKind::Procedure => Ok(self.procedures.load_state()),
            EntityKind::Model => Err(ModelError::invalid_argument(
                "models do not have a load state",
            )),
        }
    }

    /// Discard loaded collections and working copies so the next access
    /// reloads from the store
    ///
    /// No-op for eager models. Unsaved working-copy edits are lost.
    pub fn refresh(&self) -> Result<(), ModelError> {
        self.ensure_active()?;
        let refreshed = self.tables.refresh()? | self.views.refresh()? | self.procedures.refresh()?;
        if refreshed {
            debug!(model = %self.name, "lazy collections refreshed");
        }
        Ok(())
    }

    // =========================================================================
    // Collection Access
    // =========================================================================

    /// Table collection, loaded on first access in lazy mode
    pub async fn tables(&self) -> Result<Arc<Vec<Table>>, ModelError> {
        self.collection(&self.tables).await
    }

    /// View collection, loaded on first access in lazy mode
    pub async fn views(&self) -> Result<Arc<Vec<View>>, ModelError> {
        self.collection(&self.views).await
    }

    /// Stored procedure collection, loaded on first access in lazy mode
    pub async fn procedures(&self) -> Result<Arc<Vec<StoredProcedure>>, ModelError> {
        self.collection(&self.procedures).await
    }

    async fn collection<T: StoredEntity>(
        &self,
        slot: &CollectionSlot<T>,
    ) -> Result<Arc<Vec<T>>, ModelError> {
        self.ensure_active()?;
        let result = slot.get().await;
        // Disposal during the load wins over its result
        self.ensure_active()?;
        Ok(result?)
    }

    /// Materialize every collection into a snapshot
    pub async fn snapshot(&self) -> Result<ModelSnapshot, ModelError> {
        let (tables, views, procedures) =
            futures::try_join!(self.tables(), self.views(), self.procedures())?;
        Ok(ModelSnapshot {
            name: self.name.clone(),
            tables: tables.as_ref().clone(),
            views: views.as_ref().clone(),
            procedures: procedures.as_ref().clone(),
            captured_at: unix_now(),
        })
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Add a table; returns its identity
    pub async fn add_table(&self, table: Table) -> Result<EntityId, ModelError> {
        self.add(&self.tables, table).await
    }

    /// Add a view; returns its identity
    pub async fn add_view(&self, view: View) -> Result<EntityId, ModelError> {
        self.add(&self.views, view).await
    }

    /// Add a stored procedure; returns its identity
    pub async fn add_procedure(&self, procedure: StoredProcedure) -> Result<EntityId, ModelError> {
        self.add(&self.procedures, procedure).await
    }

    /// Remove a table by identity; returns whether it was present
    pub async fn remove_table(&self, id: EntityId) -> Result<bool, ModelError> {
        self.remove(&self.tables, id).await
    }

    /// Remove a view by identity; returns whether it was present
    pub async fn remove_view(&self, id: EntityId) -> Result<bool, ModelError> {
        self.remove(&self.views, id).await
    }

    /// Remove a stored procedure by identity; returns whether it was present
    pub async fn remove_procedure(&self, id: EntityId) -> Result<bool, ModelError> {
        self.remove(&self.procedures, id).await
    }

    /// Edit a table in place; returns whether it was found
    pub async fn update_table<F>(&self, id: EntityId, f: F) -> Result<bool, ModelError>
    where
        F: FnOnce(&mut Table) + Send,
    {
        self.update(&self.tables, id, f).await
    }

    /// Edit a view in place; returns whether it was found
    pub async fn update_view<F>(&self, id: EntityId, f: F) -> Result<bool, ModelError>
    where
        F: FnOnce(&mut View) + Send,
    {
        self.update(&self.views, id, f).await
    }

    /// Edit a stored procedure in place; returns whether it was found
    pub async fn update_procedure<F>(&self, id: EntityId, f: F) -> Result<bool, ModelError>
    where
        F: FnOnce(&mut StoredProcedure) + Send,
    {
        self.update(&self.procedures, id, f).await
    }

    async fn add<T: StoredEntity>(
        &self,
        slot: &CollectionSlot<T>,
        entity: T,
    ) -> Result<EntityId, ModelError> {
        self.ensure_active()?;
        let entity_ref = entity.entity_ref();
        slot.mutate(move |items| items.push(entity)).await?;
        self.ensure_active()?;

        debug!(model = %self.name, entity = %entity_ref, "entity added");
        self.record_change(&entity_ref, true)?;
        Ok(entity_ref.id)
    }

    async fn remove<T: StoredEntity>(
        &self,
        slot: &CollectionSlot<T>,
        id: EntityId,
    ) -> Result<bool, ModelError> {
        self.ensure_active()?;
        let removed = slot
            .mutate(move |items| {
                items
                    .iter()
                    .position(|e| e.id() == id)
                    .map(|index| items.remove(index).entity_ref())
            })
            .await?;
        self.ensure_active()?;

        match removed {
            Some(entity_ref) => {
                debug!(model = %self.name, entity = %entity_ref, "entity removed");
                self.record_change(&entity_ref, true)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update<T, F>(
        &self,
        slot: &CollectionSlot<T>,
        id: EntityId,
        f: F,
    ) -> Result<bool, ModelError>
    where
        T: StoredEntity,
        F: FnOnce(&mut T) + Send,
    {
        self.ensure_active()?;
        let updated = slot
            .mutate(move |items| {
                items.iter_mut().find(|e| e.id() == id).map(|entity| {
                    f(entity);
                    entity.entity_ref()
                })
            })
            .await?;
        self.ensure_active()?;

        match updated {
            Some(entity_ref) => {
                self.record_change(&entity_ref, false)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // =========================================================================
    // Change Tracking
    // =========================================================================

    /// Attach a shared tracker (not disposed with the model)
    pub fn enable_change_tracking(&self, tracker: Arc<ChangeTracker>) -> Result<(), ModelError> {
        self.attach_tracker(tracker, false)
    }

    /// Attach a tracker owned by (and disposed with) the model
    pub fn enable_owned_change_tracking(&self) -> Result<Arc<ChangeTracker>, ModelError> {
        let tracker = Arc::new(ChangeTracker::new());
        self.attach_tracker(Arc::clone(&tracker), true)?;
        Ok(tracker)
    }

    fn attach_tracker(&self, tracker: Arc<ChangeTracker>, owned: bool) -> Result<(), ModelError> {
        self.ensure_active()?;
        if tracker.is_disposed() {
            return Err(TrackerError::Disposed.into());
        }
        let previous = self
            .tracker
            .write()
            .replace(TrackerBinding { tracker, owned });
        self.pending.clear();
        if let Some(previous) = previous {
            if previous.owned {
                previous.tracker.dispose();
            }
        }
        debug!(model = %self.name, owned, "change tracking enabled");
        Ok(())
    }

    /// Currently attached tracker
    pub fn change_tracker(&self) -> Result<Option<Arc<ChangeTracker>>, ModelError> {
        self.ensure_active()?;
        Ok(self.current_tracker())
    }

    fn current_tracker(&self) -> Option<Arc<ChangeTracker>> {
        self.tracker
            .read()
            .as_ref()
            .map(|binding| Arc::clone(&binding.tracker))
    }

    /// Report a mutation to the attached tracker
    fn record_change(&self, entity: &EntityRef, structural: bool) -> Result<(), ModelError> {
        // Handlers run outside the binding lock
        if let Some(tracker) = self.current_tracker() {
            self.note_pending(entity);
            tracker.mark_dirty(entity)?;
            if structural {
                let model = self.entity_ref();
                self.note_pending(&model);
                tracker.mark_dirty(&model)?;
            }
        }
        Ok(())
    }

    fn note_pending(&self, entity: &EntityRef) {
        let seq = self.edit_seq.fetch_add(1, Ordering::AcqRel);
        self.pending.insert(entity.id, (entity.clone(), seq));
    }

    /// Mark clean what a finished save actually wrote
    ///
    /// `checkpoint` holds the edits recorded before the collections were
    /// read; an entity edited again since keeps its dirty mark. Entities
    /// marked dirty on the tracker by someone else are accepted only if they
    /// belong to this model's saved collections.
    fn accept_saved(
        &self,
        tracker: &ChangeTracker,
        checkpoint: Vec<(EntityId, u64)>,
        dirty_before: Vec<EntityRef>,
        saved: &HashSet<EntityId>,
    ) -> Result<usize, ModelError> {
        let mut accepted = 0;
        for (id, seq) in checkpoint {
            let settled = self
                .pending
                .remove_if(&id, |_, (_, current)| *current == seq);
            if let Some((_, (entity, _))) = settled {
                if tracker.mark_clean(&entity)? {
                    accepted += 1;
                }
            }
        }

        for entity in dirty_before {
            if saved.contains(&entity.id)
                && !self.pending.contains_key(&entity.id)
                && tracker.mark_clean(&entity)?
            {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    // =========================================================================
    // Persistence & Caching
    // =========================================================================

    /// Save every collection, then mark clean the changes that were saved
    ///
    /// Only this model's entities are accepted, so a shared tracker keeps
    /// other models' changes. Edits made while the save is running stay
    /// dirty. Returns the number of changes accepted (0 without a tracker).
    pub async fn persist(
        &self,
        store: &dyn ModelStore,
        source: &SourceLocation,
    ) -> Result<usize, ModelError> {
        self.ensure_active()?;
        if source.is_empty() {
            return Err(ModelError::invalid_argument("source location must not be empty"));
        }

        // Everything recorded up to here is contained in the collections read below
        let tracker = self.current_tracker();
        let checkpoint: Vec<(EntityId, u64)> = self
            .pending
            .iter()
            .map(|entry| (*entry.key(), entry.value().1))
            .collect();
        let dirty_before = match &tracker {
            Some(tracker) => tracker.dirty_entities()?,
            None => Vec::new(),
        };

        let (tables, views, procedures) =
            futures::try_join!(self.tables(), self.views(), self.procedures())?;
        Table::save_to(store, source, &tables).await?;
        View::save_to(store, source, &views).await?;
        StoredProcedure::save_to(store, source, &procedures).await?;
        self.ensure_active()?;

        let accepted = match tracker {
            Some(tracker) => {
                let saved: HashSet<EntityId> = entity_ids(&tables)
                    .chain(entity_ids(&views))
                    .chain(entity_ids(&procedures))
                    .collect();
                self.accept_saved(&tracker, checkpoint, dirty_before, &saved)?
            }
            None => 0,
        };
        info!(
            model = %self.name,
            source = %source,
            entities = tables.len() + views.len() + procedures.len(),
            accepted,
            "model persisted"
        );
        Ok(accepted)
    }

    /// Store a snapshot of this model under `project:name`
    pub async fn cache_snapshot(
        &self,
        cache: &SnapshotCache,
        project: &str,
    ) -> Result<String, ModelError> {
        let snapshot = self.snapshot().await?;
        let key = model_cache_key(project, &self.name);
        cache.set(&key, snapshot)?;
        Ok(key)
    }

    /// Build an eager model from a cached snapshot, if one is live
    pub fn from_cache(
        cache: &SnapshotCache,
        project: &str,
        name: &str,
    ) -> Result<Option<Self>, ModelError> {
        let key = model_cache_key(project, name);
        Ok(cache
            .get(&key)?
            .map(|snapshot| Self::from_snapshot(snapshot.as_ref().clone())))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Release all collections; every later call fails with `Disposed`
    ///
    /// An owned tracker is disposed too; a shared one is only detached.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tables.dispose();
        self.views.dispose();
        self.procedures.dispose();
        self.pending.clear();

        if let Some(binding) = self.tracker.write().take() {
            if binding.owned {
                binding.tracker.dispose();
            }
        }
        info!(model = %self.name, "model disposed");
    }
}

impl Trackable for SchemaModel {
    fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.id, EntityKind::Model, self.name.clone())
    }
}

fn entity_ids<T: StoredEntity>(items: &[T]) -> impl Iterator<Item = EntityId> + '_ {
    items.iter().map(|e| e.id())
}

/// Build a lazy proxy whose loader reads one collection from `store`
fn lazy_proxy<T: StoredEntity>(
    source: &SourceLocation,
    store: &Arc<dyn ModelStore>,
) -> Arc<LazyEntityProxy<T>> {
    let label = format!("{}@{}", T::KIND.collection_name(), source);
    let source = source.clone();
    let store = Arc::clone(store);
    Arc::new(LazyEntityProxy::new(label, move || {
        let store = Arc::clone(&store);
        let source = source.clone();
        async move {
            T::load_from(store.as_ref(), &source)
                .await
                .map_err(|e| Box::new(e) as BoxError)
        }
    }))
}
