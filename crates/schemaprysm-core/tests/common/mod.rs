//! Common test utilities for integration tests.
//!
//! Provides sample schema entities and a scripted [`ModelStore`] that can
//! delay or fail loads on demand.

#![allow(dead_code)]
#![allow(unused_imports)]

use async_trait::async_trait;
use schemaprysm_core::{
    Column, EntityKind, MemoryModelStore, ModelStore, Parameter, SourceLocation, StoreError,
    StoredProcedure, Table, View,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// Sample Data
// ============================================================================

pub fn warehouse_source() -> SourceLocation {
    SourceLocation::new("warehouse/main")
}

pub fn sample_tables() -> Vec<Table> {
    vec![
        Table::new("dbo", "customers")
            .with_description("Registered customers")
            .with_column(Column::new("id", "bigint"))
            .with_column(Column::new("email", "nvarchar(255)").nullable()),
        Table::new("dbo", "orders")
            .with_column(Column::new("id", "bigint"))
            .with_column(Column::new("customer_id", "bigint")),
        Table::new("sales", "invoices").with_column(Column::new("id", "bigint")),
    ]
}

pub fn sample_views() -> Vec<View> {
    vec![View::new("dbo", "v_open_orders")
        .with_definition("SELECT * FROM dbo.orders WHERE closed_at IS NULL")
        .with_column(Column::new("id", "bigint"))]
}

pub fn sample_procedures() -> Vec<StoredProcedure> {
    vec![StoredProcedure::new("dbo", "sp_close_order")
        .with_parameter(Parameter::input("order_id", "bigint"))]
}

/// Memory store pre-filled with the sample collections under `warehouse_source()`
pub async fn seeded_memory_store() -> MemoryModelStore {
    let store = MemoryModelStore::new();
    let source = warehouse_source();
    store.save_tables(&source, &sample_tables()).await.unwrap();
    store.save_views(&source, &sample_views()).await.unwrap();
    store
        .save_procedures(&source, &sample_procedures())
        .await
        .unwrap();
    store
}

// ============================================================================
// Scripted Store
// ============================================================================

/// Store wrapper that delays every load and can fail the first N of them
pub struct ScriptedStore {
    inner: MemoryModelStore,
    delay: Duration,
    failures_remaining: AtomicUsize,
    loads: AtomicUsize,
}

impl ScriptedStore {
    pub fn new(inner: MemoryModelStore) -> Self {
        Self {
            inner,
            delay: Duration::ZERO,
            failures_remaining: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_first(self, count: usize) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Total load calls across all kinds
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Load calls that reached the inner store for a kind
    pub fn inner_loads(&self, kind: EntityKind) -> usize {
        self.inner.load_count(kind)
    }

    pub fn inner(&self) -> &MemoryModelStore {
        &self.inner
    }

    async fn gate(&self) -> Result<(), StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(StoreError::unavailable("database connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ModelStore for ScriptedStore {
    async fn load_tables(&self, source: &SourceLocation) -> Result<Vec<Table>, StoreError> {
        self.gate().await?;
        self.inner.load_tables(source).await
    }

    async fn load_views(&self, source: &SourceLocation) -> Result<Vec<View>, StoreError> {
        self.gate().await?;
        self.inner.load_views(source).await
    }

    async fn load_procedures(
        &self,
        source: &SourceLocation,
    ) -> Result<Vec<StoredProcedure>, StoreError> {
        self.gate().await?;
        self.inner.load_procedures(source).await
    }

    async fn save_tables(
        &self,
        source: &SourceLocation,
        tables: &[Table],
    ) -> Result<(), StoreError> {
        self.inner.save_tables(source, tables).await
    }

    async fn save_views(&self, source: &SourceLocation, views: &[View]) -> Result<(), StoreError> {
        self.inner.save_views(source, views).await
    }

    async fn save_procedures(
        &self,
        source: &SourceLocation,
        procedures: &[StoredProcedure],
    ) -> Result<(), StoreError> {
        self.inner.save_procedures(source, procedures).await
    }
}

/// Scripted store over the sample data, shared as a trait object
pub async fn scripted_store(delay: Duration, failures: usize) -> Arc<ScriptedStore> {
    Arc::new(
        ScriptedStore::new(seeded_memory_store().await)
            .with_delay(delay)
            .failing_first(failures),
    )
}

// ============================================================================
// Gated Store
// ============================================================================

/// Store whose `save_tables` parks until [`GatedStore::release`] is called
pub struct GatedStore {
    inner: MemoryModelStore,
    entered: Notify,
    released: Notify,
}

impl GatedStore {
    pub fn new(inner: MemoryModelStore) -> Self {
        Self {
            inner,
            entered: Notify::new(),
            released: Notify::new(),
        }
    }

    /// Wait until a `save_tables` call is parked
    pub async fn wait_for_save(&self) {
        self.entered.notified().await;
    }

    /// Let one parked (or the next) `save_tables` call proceed
    pub fn release(&self) {
        self.released.notify_one();
    }

    pub fn inner(&self) -> &MemoryModelStore {
        &self.inner
    }
}

#[async_trait]
impl ModelStore for GatedStore {
    async fn load_tables(&self, source: &SourceLocation) -> Result<Vec<Table>, StoreError> {
        self.inner.load_tables(source).await
    }

    async fn load_views(&self, source: &SourceLocation) -> Result<Vec<View>, StoreError> {
        self.inner.load_views(source).await
    }

    async fn load_procedures(
        &self,
        source: &SourceLocation,
    ) -> Result<Vec<StoredProcedure>, StoreError> {
        self.inner.load_procedures(source).await
    }

    async fn save_tables(
        &self,
        source: &SourceLocation,
        tables: &[Table],
    ) -> Result<(), StoreError> {
        self.entered.notify_one();
        self.released.notified().await;
        self.inner.save_tables(source, tables).await
    }

    async fn save_views(&self, source: &SourceLocation, views: &[View]) -> Result<(), StoreError> {
        self.inner.save_views(source, views).await
    }

    async fn save_procedures(
        &self,
        source: &SourceLocation,
        procedures: &[StoredProcedure],
    ) -> Result<(), StoreError> {
        self.inner.save_procedures(source, procedures).await
    }
}
