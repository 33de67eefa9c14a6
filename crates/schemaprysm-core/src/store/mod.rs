//! Persistence Collaborators
//!
//! [`ModelStore`] is the seam between the runtime state layer and durable
//! storage. Lazy collections call its `load_*` methods on first access;
//! [`SchemaModel::persist`](crate::model::SchemaModel::persist) calls the
//! `save_*` methods.
//!
//! Two implementations ship with the crate:
//! - [`MemoryModelStore`]: JSON blobs in a concurrent map (tests, embedding)
//! - [`SqliteModelStore`]: a single SQLite database

mod memory;
mod schema;
mod sqlite;

pub use memory::MemoryModelStore;
pub use schema::STORE_SCHEMA_VERSION;
pub use sqlite::SqliteModelStore;

use crate::entity::{Entity, StoredProcedure, Table, View};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors reported by a persistence collaborator
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: String, found: String },

    #[error("Store task failed: {0}")]
    Task(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Create an Unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Where a model's collections live (database, file, connection alias)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceLocation(String);

impl SourceLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceLocation {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SourceLocation {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Reads and writes entity collections for a source location
///
/// A collection that was never saved loads as empty. Loads must be safe to
/// retry.
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn load_tables(&self, source: &SourceLocation) -> Result<Vec<Table>, StoreError>;

    async fn load_views(&self, source: &SourceLocation) -> Result<Vec<View>, StoreError>;

    async fn load_procedures(
        &self,
        source: &SourceLocation,
    ) -> Result<Vec<StoredProcedure>, StoreError>;

    /// Replace the stored table collection
    async fn save_tables(&self, source: &SourceLocation, tables: &[Table])
        -> Result<(), StoreError>;

    /// Replace the stored view collection
    async fn save_views(&self, source: &SourceLocation, views: &[View]) -> Result<(), StoreError>;

    /// Replace the stored procedure collection
    async fn save_procedures(
        &self,
        source: &SourceLocation,
        procedures: &[StoredProcedure],
    ) -> Result<(), StoreError>;
}

/// Entity types with a collection in [`ModelStore`]
///
/// Routes generic model code to the kind-specific store method.
pub trait StoredEntity: Entity {
    fn load_from<'a>(
        store: &'a dyn ModelStore,
        source: &'a SourceLocation,
    ) -> BoxFuture<'a, Result<Vec<Self>, StoreError>>;

    fn save_to<'a>(
        store: &'a dyn ModelStore,
        source: &'a SourceLocation,
        items: &'a [Self],
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

impl StoredEntity for Table {
    fn load_from<'a>(
        store: &'a dyn ModelStore,
        source: &'a SourceLocation,
    ) -> BoxFuture<'a, Result<Vec<Self>, StoreError>> {
        store.load_tables(source)
    }

    fn save_to<'a>(
        store: &'a dyn ModelStore,
        source: &'a SourceLocation,
        items: &'a [Self],
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        store.save_tables(source, items)
    }
}

impl StoredEntity for View {
    fn load_from<'a>(
        store: &'a dyn ModelStore,
        source: &'a SourceLocation,
    ) -> BoxFuture<'a, Result<Vec<Self>, StoreError>> {
        store.load_views(source)
    }

    fn save_to<'a>(
        store: &'a dyn ModelStore,
        source: &'a SourceLocation,
        items: &'a [Self],
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        store.save_views(source, items)
    }
}

impl StoredEntity for StoredProcedure {
    fn load_from<'a>(
        store: &'a dyn ModelStore,
        source: &'a SourceLocation,
    ) -> BoxFuture<'a, Result<Vec<Self>, StoreError>> {
        store.load_procedures(source)
    }

    fn save_to<'a>(
        store: &'a dyn ModelStore,
        source: &'a SourceLocation,
        items: &'a [Self],
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        store.save_procedures(source, items)
    }
}
