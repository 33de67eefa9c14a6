//! SchemaPrysm Core - Runtime state layer for database schema models
//!
//! This crate keeps schema models (tables, views, stored procedures) in memory
//! between the persistence layer and the code that reads and edits them:
//! - Snapshot cache with TTL expiry, entry/memory budgets and hit statistics
//! - Lazy entity collections that load once on first access
//! - Identity-keyed change tracking with subscriber notifications
//! - The model aggregate tying the three together
//! - Memory and SQLite persistence collaborators

pub mod cache;
pub mod entity;
pub mod lazy;
pub mod logging;
pub mod model;
pub mod store;
pub mod tracking;

// Re-exports for convenience
pub use cache::{
    model_cache_key, CacheError, CacheStatistics, CacheStore, CompactionHandle, EvictionReason,
};
pub use entity::{
    Column, Entity, EntityId, EntityKind, EntityRef, Parameter, ParameterDirection,
    StoredProcedure, Table, Trackable, View,
};
pub use lazy::{BoxError, LazyEntityProxy, LoadState, ProxyError};
pub use model::{ModelError, ModelSnapshot, SchemaModel, SnapshotCache};
pub use store::{
    MemoryModelStore, ModelStore, SourceLocation, SqliteModelStore, StoreError, StoredEntity,
};
pub use tracking::{ChangeTracker, EntityStateChange, SubscriptionId, TrackerError};

// Configuration re-exports
pub use schemaprysm_config::{CacheConfig, SchemaPrysmConfig};
