//! Lazy collection integration tests for schemaprysm-core.
//!
//! Exercise lazy proxies and lazy models under real concurrency:
//! - Single load per proxy across many concurrent callers
//! - Failure propagation to every joined caller, then retry
//! - Reset and disposal racing an in-flight load

mod common;

use common::{scripted_store, warehouse_source};
use pretty_assertions::assert_eq;
use schemaprysm_core::{
    BoxError, EntityKind, LazyEntityProxy, LoadState, ModelError, ModelStore, ProxyError,
    SchemaModel,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Helpers
// ============================================================================

fn slow_proxy(delay: Duration) -> (Arc<LazyEntityProxy<String>>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let proxy = LazyEntityProxy::new("names@slow", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(delay).await;
            Ok::<_, BoxError>(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        }
    });
    (Arc::new(proxy), calls)
}

// ============================================================================
// Proxy Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_access_loads_once() {
    let (proxy, calls) = slow_proxy(Duration::from_millis(50));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move { proxy.get_entities().await })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in &results {
        assert!(Arc::ptr_eq(&results[0], result));
    }
    assert_eq!(results[0].as_slice(), &["a", "b", "c"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_reaches_every_waiter_then_retries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let proxy = Arc::new(LazyEntityProxy::new("tables@broken", move || {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            if attempt == 0 {
                Err::<Vec<u32>, BoxError>("login failed".into())
            } else {
                Ok(vec![7])
            }
        }
    }));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move { proxy.get_entities().await })
        })
        .collect();

    for handle in handles {
        match handle.await.unwrap() {
            Err(ProxyError::Load { label, source }) => {
                assert_eq!(label, "tables@broken");
                assert_eq!(source.to_string(), "login failed");
            }
            other => panic!("expected load failure, got {:?}", other),
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.state(), LoadState::Unloaded);

    assert_eq!(proxy.get_entities().await.unwrap().as_slice(), &[7]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_reset_then_get_loads_exactly_once_more() {
    let (proxy, calls) = slow_proxy(Duration::from_millis(1));
    proxy.get_entities().await.unwrap();
    proxy.get_entities().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    proxy.reset().unwrap();
    proxy.get_entities().await.unwrap();
    proxy.get_entities().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Lazy Models
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lazy_model_concurrent_readers() {
    let store = scripted_store(Duration::from_millis(40), 0).await;
    let model = Arc::new(SchemaModel::new("warehouse"));
    model
        .enable_lazy_loading(warehouse_source(), Arc::clone(&store) as Arc<dyn ModelStore>)
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let model = Arc::clone(&model);
            tokio::spawn(async move { model.tables().await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().len(), 3);
    }

    assert_eq!(store.inner_loads(EntityKind::Table), 1);
    assert_eq!(store.inner_loads(EntityKind::View), 0);
    assert_eq!(
        model.load_state(EntityKind::Procedure).unwrap(),
        LoadState::Unloaded
    );
}

#[tokio::test]
async fn test_lazy_model_load_failure_is_retryable() {
    let store = scripted_store(Duration::ZERO, 1).await;
    let model = SchemaModel::new("warehouse");
    model
        .enable_lazy_loading(warehouse_source(), Arc::clone(&store) as Arc<dyn ModelStore>)
        .unwrap();

    let err = model.views().await.unwrap_err();
    match err {
        ModelError::Proxy(ProxyError::Load { label, source }) => {
            assert_eq!(label, "views@warehouse/main");
            assert!(source.to_string().contains("connection refused"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(model.views().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_dispose_while_loading_fails_with_disposed() {
    let store = scripted_store(Duration::from_millis(80), 0).await;
    let model = Arc::new(SchemaModel::new("warehouse"));
    model
        .enable_lazy_loading(warehouse_source(), Arc::clone(&store) as Arc<dyn ModelStore>)
        .unwrap();

    let pending = {
        let model = Arc::clone(&model);
        tokio::spawn(async move { model.procedures().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        model.load_state(EntityKind::Procedure).unwrap(),
        LoadState::Loading
    );
    model.dispose();

    assert!(matches!(pending.await.unwrap(), Err(ModelError::Disposed)));
    assert!(matches!(model.tables().await, Err(ModelError::Disposed)));
    assert!(matches!(model.views().await, Err(ModelError::Disposed)));
    assert!(matches!(model.procedures().await, Err(ModelError::Disposed)));
    assert!(matches!(
        model.load_state(EntityKind::Table),
        Err(ModelError::Disposed)
    ));
}

#[tokio::test]
async fn test_refresh_reloads_from_store() {
    let store = scripted_store(Duration::ZERO, 0).await;
    let model = SchemaModel::new("warehouse");
    model
        .enable_lazy_loading(warehouse_source(), Arc::clone(&store) as Arc<dyn ModelStore>)
        .unwrap();
    assert_eq!(model.tables().await.unwrap().len(), 3);

    // Another writer replaces the collection behind the model's back
    store
        .inner()
        .save_tables(&warehouse_source(), &common::sample_tables()[..1])
        .await
        .unwrap();
    assert_eq!(model.tables().await.unwrap().len(), 3);

    model.refresh().unwrap();
    assert_eq!(model.tables().await.unwrap().len(), 1);
    assert_eq!(store.inner_loads(EntityKind::Table), 2);
}
