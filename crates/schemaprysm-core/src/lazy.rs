//! Lazy Entity Collections
//!
//! [`LazyEntityProxy`] stands in for an entity collection and defers the
//! underlying load until first access.
//!
//! ## Loading
//!
//! The proxy is a small state machine (`Unloaded -> Loading -> Loaded`, plus
//! terminal `Disposed`) behind a per-proxy `RwLock`. The first caller to find
//! it unloaded installs a shared load future; every concurrent caller joins
//! that same future, so the loader runs once per attempt and all callers get
//! the same `Arc`. The future publishes its own result, tagged with the
//! generation it started under, so a `reset` in the middle of a load
//! discards the stale result and joined callers retry.
//!
//! No lock is held across an `.await`.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Error type returned by collection loaders
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased collection loader
pub type EntityLoader<T> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<T>, BoxError>> + Send + Sync>;

type LoadResult<T> = Result<Arc<Vec<T>>, ProxyError>;
type SharedLoad<T> = Shared<BoxFuture<'static, LoadResult<T>>>;

/// Errors from lazy collection access
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("lazy collection has been disposed")]
    Disposed,

    #[error("failed to load {label}: {source}")]
    Load {
        label: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
}

impl ProxyError {
    /// Create a Load error
    pub fn load(label: impl Into<String>, source: BoxError) -> Self {
        Self::Load {
            label: label.into(),
            source: Arc::from(source),
        }
    }
}

/// Observable load state of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    Disposed,
}

enum State<T> {
    Unloaded,
    Loading(SharedLoad<T>),
    Loaded(Arc<Vec<T>>),
    Disposed,
}

struct Slot<T> {
    state: State<T>,
    /// Bumped by `reset` and `dispose`; stale loads never publish
    generation: u64,
}

struct Inner<T> {
    label: String,
    loader: EntityLoader<T>,
    slot: RwLock<Slot<T>>,
}

impl<T> Inner<T> {
    /// Store the outcome of a load attempt if it is still current
    fn publish(&self, generation: u64, result: &LoadResult<T>) {
        let mut slot = self.slot.write();
        if slot.generation != generation || !matches!(slot.state, State::Loading(_)) {
            trace!(label = %self.label, generation, "discarding superseded load result");
            return;
        }
        match result {
            Ok(items) => {
                slot.state = State::Loaded(Arc::clone(items));
            }
            Err(e) => {
                warn!(label = %self.label, error = %e, "lazy load failed, collection stays unloaded");
                slot.state = State::Unloaded;
            }
        }
    }
}

/// What a caller should do after inspecting the state
enum Step<T> {
    Ready(Arc<Vec<T>>),
    Wait(SharedLoad<T>, u64),
}

/// Deferred, load-once view of an entity collection
pub struct LazyEntityProxy<T> {
    inner: Arc<Inner<T>>,
}

impl<T> LazyEntityProxy<T>
where
    T: Send + Sync + 'static,
{
    /// Create an unloaded proxy
    ///
    /// `label` names the collection and its source in error messages, e.g.
    /// `tables@warehouse/main`.
    pub fn new<F, Fut>(label: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>, BoxError>> + Send + 'static,
    {
        let loader: EntityLoader<T> = Arc::new(move || loader().boxed());
        Self::from_loader(label, loader)
    }

    /// Create an unloaded proxy from an already type-erased loader
    pub fn from_loader(label: impl Into<String>, loader: EntityLoader<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                loader,
                slot: RwLock::new(Slot {
                    state: State::Unloaded,
                    generation: 0,
                }),
            }),
        }
    }

    /// Collection label used in diagnostics
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Current load state
    pub fn state(&self) -> LoadState {
        match self.inner.slot.read().state {
            State::Unloaded => LoadState::Unloaded,
            State::Loading(_) => LoadState::Loading,
            State::Loaded(_) => LoadState::Loaded,
            State::Disposed => LoadState::Disposed,
        }
    }

    /// Whether the collection has been loaded
    pub fn is_loaded(&self) -> Result<bool, ProxyError> {
        match self.inner.slot.read().state {
            State::Disposed => Err(ProxyError::Disposed),
            State::Loaded(_) => Ok(true),
            _ => Ok(false),
        }
    }

    /// Get the collection, loading it on first access
    pub async fn get_entities(&self) -> Result<Arc<Vec<T>>, ProxyError> {
        loop {
            let (load, generation) = match self.join_or_start()? {
                Step::Ready(items) => return Ok(items),
                Step::Wait(load, generation) => (load, generation),
            };

            let result = load.await;

            // Re-check: the proxy may have been reset or disposed meanwhile
            let superseded = {
                let slot = self.inner.slot.read();
                if matches!(slot.state, State::Disposed) {
                    return Err(ProxyError::Disposed);
                }
                slot.generation != generation
            };
            if !superseded {
                return result;
            }
            trace!(label = %self.inner.label, generation, "load superseded by reset, retrying");
        }
    }

    /// Ensure the collection is loaded
    pub async fn load(&self) -> Result<(), ProxyError> {
        self.get_entities().await.map(|_| ())
    }

    /// Discard the loaded collection (or in-flight load) and return to `Unloaded`
    pub fn reset(&self) -> Result<(), ProxyError> {
        let mut slot = self.inner.slot.write();
        if matches!(slot.state, State::Disposed) {
            return Err(ProxyError::Disposed);
        }
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = State::Unloaded;
        debug!(label = %self.inner.label, generation = slot.generation, "lazy collection reset");
        Ok(())
    }

    /// Release the collection permanently
    pub fn dispose(&self) {
        let mut slot = self.inner.slot.write();
        if matches!(slot.state, State::Disposed) {
            return;
        }
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = State::Disposed;
        debug!(label = %self.inner.label, "lazy collection disposed");
    }

    // =========================================================================
    // Load Coordination
    // =========================================================================

    fn join_or_start(&self) -> Result<Step<T>, ProxyError> {
        // First check: read lock only
        {
            let slot = self.inner.slot.read();
            match &slot.state {
                State::Loaded(items) => return Ok(Step::Ready(Arc::clone(items))),
                State::Disposed => return Err(ProxyError::Disposed),
                State::Loading(load) => return Ok(Step::Wait(load.clone(), slot.generation)),
                State::Unloaded => {}
            }
        }

        // Second check: another caller may have started the load
        let mut slot = self.inner.slot.write();
        match &slot.state {
            State::Loaded(items) => Ok(Step::Ready(Arc::clone(items))),
            State::Disposed => Err(ProxyError::Disposed),
            State::Loading(load) => Ok(Step::Wait(load.clone(), slot.generation)),
            State::Unloaded => {
                let generation = slot.generation;
                let load = self.start_load(generation);
                slot.state = State::Loading(load.clone());
                Ok(Step::Wait(load, generation))
            }
        }
    }

    fn start_load(&self, generation: u64) -> SharedLoad<T> {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let loader = Arc::clone(&self.inner.loader);
        let label = self.inner.label.clone();
        debug!(label = %label, generation, "starting lazy load");

        async move {
            let started = Instant::now();
            // A panicking loader must not poison the shared future
            let outcome = AssertUnwindSafe(async move { loader().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panic_error(panic.as_ref())));
            let result = match outcome {
                Ok(items) => {
                    debug!(
                        label = %label,
                        count = items.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "lazy collection loaded"
                    );
                    Ok(Arc::new(items))
                }
                Err(e) => Err(ProxyError::load(label, e)),
            };
            if let Some(inner) = weak.upgrade() {
                inner.publish(generation, &result);
            }
            result
        }
        .boxed()
        .shared()
    }
}

fn panic_error(panic: &(dyn Any + Send)) -> BoxError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("loader panicked: {}", message).into()
}

impl<T> fmt::Debug for LazyEntityProxy<T>
where
    T: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyEntityProxy")
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}
