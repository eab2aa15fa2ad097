#![forbid(unsafe_code)]

//! Instance registry: creation-or-reuse by key, per-type counts and bulk
//! teardown.
//!
//! # Design
//!
//! The registry is an explicit object (cheap to clone, `Arc` inside); there is
//! no process-global instance. Anything implementing [`Managed`] can be
//! tracked. Entries are keyed by the concrete holder type plus an optional
//! string key:
//!
//! - With a key, at most one live instance exists per `(type, key)`. Each key
//!   has its own slot lock, so racing `get_or_create` calls for the same new
//!   key run the factory once and all observe the same instance, while
//!   different keys never wait on each other.
//! - Without a key, every call creates and tracks a fresh instance.
//!
//! Tracked instances carry a dispose hook that removes them from the counts,
//! so disposing an instance directly and disposing it through
//! [`InstanceRegistry::cleanup`] leave the registry in the same state.
//!
//! # Invariants
//!
//! 1. `count_total()` and `count_by_type()` are exact immediately after any
//!    create, dispose or cleanup.
//! 2. `cleanup()` on an empty registry is a no-op.
//! 3. A disposed keyed instance is never returned; the next `get_or_create`
//!    for that key builds a fresh one.
//! 4. `cleanup()` and `remove()` never unmap a slot a creator is holding, so
//!    a factory still running during teardown cannot end up beside a second
//!    instance for the same key.
//!
//! A factory must not call back into the registry for its own key; that
//! deadlocks on the slot lock. The same holds for dispose hooks run by
//! [`InstanceRegistry::remove`].

use std::any::{Any, TypeId, type_name};
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::fault::{FaultSink, default_sink};
use crate::notifier::{DisposeHook, Notifier, NotifierConfig};

/// A holder whose lifetime the registry can manage.
///
/// Implementors are cheap handles: cloning yields another handle to the same
/// instance.
pub trait Managed: Clone + Send + Sync + 'static {
    fn dispose(&self);
    fn is_disposed(&self) -> bool;
    /// Run `hook` once on disposal (immediately if already disposed).
    fn on_dispose(&self, hook: DisposeHook);
}

impl<T: Send + Sync + 'static> Managed for Notifier<T> {
    fn dispose(&self) {
        Notifier::dispose(self);
    }

    fn is_disposed(&self) -> bool {
        Notifier::is_disposed(self)
    }

    fn on_dispose(&self, hook: DisposeHook) {
        Notifier::on_dispose(self, hook);
    }
}

/// Registry construction options.
#[derive(Clone)]
pub struct RegistryConfig {
    pub label: Arc<str>,
    /// Sink handed to notifiers created through [`InstanceRegistry::notifier`].
    pub fault_sink: Arc<dyn FaultSink>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            label: Arc::from("registry"),
            fault_sink: default_sink(),
        }
    }
}

impl RegistryConfig {
    #[must_use]
    pub fn label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = label.into();
        self
    }

    #[must_use]
    pub fn fault_sink(mut self, sink: Arc<dyn FaultSink>) -> Self {
        self.fault_sink = sink;
        self
    }
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Identifier of one tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

type SlotValue = Option<Box<dyn Any + Send + Sync>>;
type Slot = Arc<Mutex<SlotValue>>;
type SlotKey = (TypeId, String);

struct Entry {
    type_id: TypeId,
    type_name: &'static str,
    key: Option<String>,
    dispose: Box<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
struct RegistryState {
    entries: AHashMap<InstanceId, Entry>,
    slots: AHashMap<SlotKey, Slot>,
}

struct RegistryInner {
    config: RegistryConfig,
    next_id: AtomicU64,
    state: Mutex<RegistryState>,
}

impl RegistryInner {
    fn forget(&self, id: InstanceId) {
        if let Some(entry) = self.state.lock().entries.remove(&id) {
            tracing::debug!(
                message = "registry.forget",
                registry = %self.config.label,
                type_name = entry.type_name,
                key = ?entry.key,
                id = id.raw(),
            );
        }
    }
}

/// Registry of live holders. Cloning shares the same registry.
#[derive(Clone)]
pub struct InstanceRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("label", &self.inner.config.label)
            .field("count", &self.count_total())
            .finish()
    }
}

fn live_in<H: Managed>(slot: &SlotValue) -> Option<H> {
    slot.as_ref()?
        .downcast_ref::<H>()
        .filter(|h| !h.is_disposed())
        .cloned()
}

impl InstanceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                next_id: AtomicU64::new(1),
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.config.label
    }

    #[must_use]
    pub fn fault_sink(&self) -> &Arc<dyn FaultSink> {
        &self.inner.config.fault_sink
    }

    fn slot<H: Managed>(&self, key: &str) -> Slot {
        let mut state = self.inner.state.lock();
        Arc::clone(
            state
                .slots
                .entry((TypeId::of::<H>(), key.to_owned()))
                .or_default(),
        )
    }

    fn existing_slot<H: Managed>(&self, key: &str) -> Option<Slot> {
        self.inner
            .state
            .lock()
            .slots
            .get(&(TypeId::of::<H>(), key.to_owned()))
            .cloned()
    }

    /// Drop an empty slot nobody else holds. Slots are only cloned under the
    /// state lock, so a count of one there means no creator can be using it.
    fn prune_slot<H: Managed>(&self, key: &str) {
        let mut state = self.inner.state.lock();
        let slot_key = (TypeId::of::<H>(), key.to_owned());
        let idle = state
            .slots
            .get(&slot_key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1 && slot.lock().is_none());
        if idle {
            state.slots.remove(&slot_key);
        }
    }

    fn track_inner<H: Managed>(&self, instance: &H, key: Option<&str>) -> InstanceId {
        let id = InstanceId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let disposer = instance.clone();
        self.inner.state.lock().entries.insert(
            id,
            Entry {
                type_id: TypeId::of::<H>(),
                type_name: type_name::<H>(),
                key: key.map(str::to_owned),
                dispose: Box::new(move || disposer.dispose()),
            },
        );

        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        instance.on_dispose(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.forget(id);
            }
        }));

        tracing::debug!(
            message = "registry.track",
            registry = %self.inner.config.label,
            type_name = type_name::<H>(),
            key = ?key,
            id = id.raw(),
        );
        id
    }

    /// Track an instance created elsewhere, without a key.
    pub fn track<H: Managed>(&self, instance: &H) -> InstanceId {
        self.track_inner(instance, None)
    }

    /// Return the live instance for `(H, key)` or create it with `factory`.
    ///
    /// Without a key, always creates and tracks a new instance.
    pub fn get_or_create<H: Managed>(&self, key: Option<&str>, factory: impl FnOnce() -> H) -> H {
        match self.try_get_or_create(key, || Ok::<H, Infallible>(factory())) {
            Ok(instance) => instance,
            Err(never) => match never {},
        }
    }

    /// Fallible form of [`get_or_create`](Self::get_or_create). A failing
    /// factory registers nothing.
    pub fn try_get_or_create<H: Managed, E>(
        &self,
        key: Option<&str>,
        factory: impl FnOnce() -> std::result::Result<H, E>,
    ) -> std::result::Result<H, E> {
        let Some(key) = key else {
            let instance = factory()?;
            self.track_inner(&instance, None);
            return Ok(instance);
        };

        let slot = self.slot::<H>(key);
        let mut cell = slot.lock();
        if let Some(existing) = live_in::<H>(&cell) {
            tracing::debug!(
                message = "registry.reuse",
                registry = %self.inner.config.label,
                type_name = type_name::<H>(),
                key,
            );
            return Ok(existing);
        }
        let instance = factory()?;
        self.track_inner(&instance, Some(key));
        *cell = Some(Box::new(instance.clone()));
        Ok(instance)
    }

    /// Create the instance for `(H, key)`, failing if a live one exists.
    pub fn create<H: Managed>(&self, key: &str, factory: impl FnOnce() -> H) -> Result<H> {
        let slot = self.slot::<H>(key);
        let mut cell = slot.lock();
        if live_in::<H>(&cell).is_some() {
            return Err(Error::duplicate_key(type_name::<H>(), key));
        }
        let instance = factory();
        self.track_inner(&instance, Some(key));
        *cell = Some(Box::new(instance.clone()));
        Ok(instance)
    }

    /// Get or create a notifier whose faults go to this registry's sink.
    pub fn notifier<T: Send + Sync + 'static>(
        &self,
        key: Option<&str>,
        initial: impl FnOnce() -> T,
    ) -> Notifier<T> {
        self.get_or_create(key, || {
            let mut config = NotifierConfig::default().fault_sink(Arc::clone(self.fault_sink()));
            if let Some(key) = key {
                config = config.label(key);
            }
            Notifier::with_config(initial(), config)
        })
    }

    /// The live instance for `(H, key)`, if any.
    #[must_use]
    pub fn get<H: Managed>(&self, key: &str) -> Option<H> {
        let slot = self.existing_slot::<H>(key)?;
        let cell = slot.lock();
        live_in::<H>(&cell)
    }

    #[must_use]
    pub fn contains<H: Managed>(&self, key: &str) -> bool {
        self.get::<H>(key).is_some()
    }

    /// Dispose and forget the instance for `(H, key)`. Returns whether a live
    /// instance was removed.
    ///
    /// Waits for a creator currently running the factory for this key.
    pub fn remove<H: Managed>(&self, key: &str) -> bool {
        let Some(slot) = self.existing_slot::<H>(key) else {
            return false;
        };
        let removed = {
            let mut cell = slot.lock();
            let live = live_in::<H>(&cell);
            *cell = None;
            // Disposed under the slot lock so no creator can observe the key
            // empty while the old instance is still live.
            live.map(|instance| instance.dispose()).is_some()
        };
        drop(slot);
        self.prune_slot::<H>(key);
        removed
    }

    /// Keys of the live keyed instances of type `H`, sorted.
    #[must_use]
    pub fn keys<H: Managed>(&self) -> Vec<String> {
        let tid = TypeId::of::<H>();
        let state = self.inner.state.lock();
        let mut keys: Vec<String> = state
            .entries
            .values()
            .filter(|e| e.type_id == tid)
            .filter_map(|e| e.key.clone())
            .collect();
        keys.sort_unstable();
        keys
    }

    #[must_use]
    pub fn count_total(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    #[must_use]
    pub fn count_by_type<H: Managed>(&self) -> usize {
        let tid = TypeId::of::<H>();
        self.inner
            .state
            .lock()
            .entries
            .values()
            .filter(|e| e.type_id == tid)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count_total() == 0
    }

    /// Dispose and forget every tracked instance. Returns how many were
    /// disposed; calling it on an empty registry returns 0.
    pub fn cleanup(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut state = self.inner.state.lock();
            // A slot still held elsewhere may belong to a creator mid-factory;
            // it stays mapped so later lookups for its key wait on it.
            state.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        let disposed = drained.len();
        for entry in drained {
            (entry.dispose)();
        }
        if disposed > 0 {
            tracing::debug!(
                message = "registry.cleanup",
                registry = %self.inner.config.label,
                disposed,
            );
        }
        disposed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
