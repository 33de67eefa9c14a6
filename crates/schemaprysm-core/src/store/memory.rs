//! In-memory model store
//!
//! Collections are kept as JSON so every load decodes fresh entities with
//! fresh identities, the same as a round trip through durable storage.

use super::{ModelStore, SourceLocation, StoreError};
use crate::entity::{Entity, EntityKind, StoredProcedure, Table, View};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// Per-kind load counters
#[derive(Debug, Default)]
struct LoadCounters {
    tables: AtomicUsize,
    views: AtomicUsize,
    procedures: AtomicUsize,
}

impl LoadCounters {
    fn counter(&self, kind: EntityKind) -> Option<&AtomicUsize> {
        match kind {
            EntityKind::Table => Some(&self.tables),
            EntityKind::View => Some(&self.views),
            EntityKind::Procedure => Some(&self.procedures),
            EntityKind::Model => None,
        }
    }
}

/// Model store backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryModelStore {
    collections: DashMap<(SourceLocation, EntityKind), String>,
    loads: LoadCounters,
}

impl MemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `load_*` calls made for a kind
    pub fn load_count(&self, kind: EntityKind) -> usize {
        self.loads
            .counter(kind)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    /// Whether a collection has been saved for `source`
    pub fn contains(&self, source: &SourceLocation, kind: EntityKind) -> bool {
        self.collections.contains_key(&(source.clone(), kind))
    }

    /// Remove every collection stored for `source`
    pub fn remove_source(&self, source: &SourceLocation) -> usize {
        let before = self.collections.len();
        self.collections.retain(|(s, _), _| s != source);
        before - self.collections.len()
    }

    fn load<T: Entity>(&self, source: &SourceLocation) -> Result<Vec<T>, StoreError> {
        if let Some(counter) = self.loads.counter(T::KIND) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        let key = (source.clone(), T::KIND);
        let items: Vec<T> = match self.collections.get(&key) {
            Some(json) => serde_json::from_str(json.value())?,
            None => Vec::new(),
        };
        trace!(source = %source, kind = %T::KIND, count = items.len(), "memory store load");
        Ok(items)
    }

    fn save<T: Entity>(&self, source: &SourceLocation, items: &[T]) -> Result<(), StoreError> {
        let json = serde_json::to_string(items)?;
        self.collections.insert((source.clone(), T::KIND), json);
        trace!(source = %source, kind = %T::KIND, count = items.len(), "memory store save");
        Ok(())
    }
}

#[async_trait]
impl ModelStore for MemoryModelStore {
    async fn load_tables(&self, source: &SourceLocation) -> Result<Vec<Table>, StoreError> {
        self.load(source)
    }

    async fn load_views(&self, source: &SourceLocation) -> Result<Vec<View>, StoreError> {
        self.load(source)
    }

    async fn load_procedures(
        &self,
        source: &SourceLocation,
    ) -> Result<Vec<StoredProcedure>, StoreError> {
        self.load(source)
    }

    async fn save_tables(
        &self,
        source: &SourceLocation,
        tables: &[Table],
    ) -> Result<(), StoreError> {
        self.save(source, tables)
    }

    async fn save_views(&self, source: &SourceLocation, views: &[View]) -> Result<(), StoreError> {
        self.save(source, views)
    }

    async fn save_procedures(
        &self,
        source: &SourceLocation,
        procedures: &[StoredProcedure],
    ) -> Result<(), StoreError> {
        self.save(source, procedures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Column;

    #[tokio::test]
    async fn test_missing_collection_loads_empty() {
        let store = MemoryModelStore::new();
        let source = SourceLocation::new("nowhere");
        assert!(store.load_tables(&source).await.unwrap().is_empty());
        assert_eq!(store.load_count(EntityKind::Table), 1);
        assert_eq!(store.load_count(EntityKind::View), 0);
    }

    #[tokio::test]
    async fn test_save_then_load_allocates_fresh_identities() {
        let store = MemoryModelStore::new();
        let source = SourceLocation::new("warehouse");
        let table = Table::new("dbo", "orders").with_column(Column::new("id", "int"));
        store.save_tables(&source, &[table.clone()]).await.unwrap();

        let loaded = store.load_tables(&source).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].qualified_name(), "dbo.orders");
        assert_ne!(loaded[0].id(), table.id());
        assert!(store.contains(&source, EntityKind::Table));
    }

    #[tokio::test]
    async fn test_sources_are_isolated() {
        let store = MemoryModelStore::new();
        let a = SourceLocation::new("a");
        let b = SourceLocation::new("b");
        store.save_views(&a, &[View::new("s", "v")]).await.unwrap();

        assert_eq!(store.load_views(&a).await.unwrap().len(), 1);
        assert!(store.load_views(&b).await.unwrap().is_empty());
        assert_eq!(store.remove_source(&a), 1);
        assert!(!store.contains(&a, EntityKind::View));
    }
}
