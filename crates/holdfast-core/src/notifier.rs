#![forbid(unsafe_code)]

//! Shared, version-tracked observable values.
//!
//! # Design
//!
//! [`Notifier<T>`] is a cheap handle (`Arc` inside) to a value slot and a
//! [`ListenerRegistry`]. Locks are only held while the value slot is read or
//! replaced; they are never held while listeners or transform functions run,
//! so both may call back into the same notifier.
//!
//! # Invariants
//!
//! 1. `set(v)` with `v == get()` stores nothing and notifies nobody.
//! 2. `transform(f)` invokes `f` exactly once and always delivers one round,
//!    even when `f` returns an equal value.
//! 3. `set_silently` and `transform_silently` always store and never notify.
//! 4. `version()` increases by one on every store.
//! 5. Inside [`batch`](Notifier::batch), rounds are deferred; at most one round
//!    is delivered when the outermost batch exits.
//!
//! # Reentrancy
//!
//! A listener may write to the notifier that is delivering to it; the nested
//! round runs to completion before the outer round continues. A transform
//! function that writes to its own notifier is overwritten by the transform's
//! result. Only [`with`](Notifier::with) holds a read lock across user code;
//! writing to the same notifier from inside `with` deadlocks.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::fault::{FaultSink, default_sink};
use crate::listener::{Listenable, Listener, ListenerId, ListenerRegistry, Subscription};

static NEXT_NOTIFIER_ID: AtomicU64 = AtomicU64::new(1);

fn next_notifier_id() -> u64 {
    NEXT_NOTIFIER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Callback run once when a holder is disposed.
pub type DisposeHook = Box<dyn FnOnce() + Send>;

/// Construction options for a [`Notifier`].
#[derive(Clone)]
pub struct NotifierConfig {
    pub label: Option<Arc<str>>,
    pub fault_sink: Arc<dyn FaultSink>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            label: None,
            fault_sink: default_sink(),
        }
    }
}

impl NotifierConfig {
    #[must_use]
    pub fn label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn fault_sink(mut self, sink: Arc<dyn FaultSink>) -> Self {
        self.fault_sink = sink;
        self
    }
}

impl fmt::Debug for NotifierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierConfig")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

struct NotifierInner<T> {
    id: u64,
    label: Arc<str>,
    value: RwLock<T>,
    version: AtomicU64,
    listeners: ListenerRegistry,
    batch_depth: AtomicUsize,
    batch_pending: AtomicBool,
    disposed: AtomicBool,
    dispose_hooks: Mutex<Vec<DisposeHook>>,
    sink: Arc<dyn FaultSink>,
}

/// A shared observable value.
///
/// Cloning a `Notifier` creates a new handle to the **same** value and
/// listener set.
pub struct Notifier<T> {
    inner: Arc<NotifierInner<T>>,
}

impl<T> Clone for Notifier<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Notifier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("label", &self.inner.label)
            .field("value", &*self.inner.value.read())
            .field("version", &self.inner.version.load(Ordering::Acquire))
            .field("listeners", &self.inner.listeners.len())
            .field("disposed", &self.inner.disposed.load(Ordering::Acquire))
            .finish()
    }
}

impl<T: Send + Sync + 'static> Notifier<T> {
    /// Create a notifier holding `value`.
    pub fn new(value: T) -> Self {
        Self::with_config(value, NotifierConfig::default())
    }

    pub fn with_config(value: T, config: NotifierConfig) -> Self {
        let id = next_notifier_id();
        let label: Arc<str> = config
            .label
            .unwrap_or_else(|| Arc::from(format!("notifier#{id}")));
        Self {
            inner: Arc::new(NotifierInner {
                id,
                listeners: ListenerRegistry::new(
                    Arc::clone(&label),
                    Arc::clone(&config.fault_sink),
                ),
                label,
                value: RwLock::new(value),
                version: AtomicU64::new(0),
                batch_depth: AtomicUsize::new(0),
                batch_pending: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                dispose_hooks: Mutex::new(Vec::new()),
                sink: config.fault_sink,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    #[must_use]
    pub fn fault_sink(&self) -> &Arc<dyn FaultSink> {
        &self.inner.sink
    }

    /// Whether both handles point at the same notifier.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Clone of the current value.
    #[must_use]
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.inner.value.read().clone()
    }

    /// Borrow the current value for the duration of `f`.
    ///
    /// `f` must not write to this notifier.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let value = self.inner.value.read();
        f(&*value)
    }

    /// Store `value` and notify, unless it equals the current value.
    ///
    /// Returns whether the value changed.
    pub fn set(&self, value: T) -> bool
    where
        T: PartialEq,
    {
        {
            let mut slot = self.inner.value.write();
            if *slot == value {
                return false;
            }
            *slot = value;
        }
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        self.notify();
        true
    }

    /// Store `value` without notifying.
    pub fn set_silently(&self, value: T) {
        *self.inner.value.write() = value;
        self.inner.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Store `f(current)` and notify, whether or not the value changed.
    pub fn transform(&self, f: impl FnOnce(T) -> T)
    where
        T: Clone,
    {
        self.transform_silently(f);
        self.notify();
    }

    /// Store `f(current)` without notifying.
    pub fn transform_silently(&self, f: impl FnOnce(T) -> T)
    where
        T: Clone,
    {
        let next = f(self.get());
        self.set_silently(next);
    }

    /// Deliver one round to the current listeners (deferred inside a batch).
    pub fn notify(&self) {
        if self.inner.batch_depth.load(Ordering::Acquire) > 0 {
            self.inner.batch_pending.store(true, Ordering::Release);
            return;
        }
        self.inner.listeners.notify_all();
    }

    /// Run `f` with notifications deferred.
    ///
    /// Values are stored immediately; a single round is delivered when the
    /// outermost batch exits, and only if something inside requested one.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        struct BatchExit<'a, T: Send + Sync + 'static>(&'a Notifier<T>);

        impl<T: Send + Sync + 'static> Drop for BatchExit<'_, T> {
            fn drop(&mut self) {
                let inner = &self.0.inner;
                if inner.batch_depth.fetch_sub(1, Ordering::AcqRel) == 1
                    && inner.batch_pending.swap(false, Ordering::AcqRel)
                {
                    inner.listeners.notify_all();
                }
            }
        }

        self.inner.batch_depth.fetch_add(1, Ordering::AcqRel);
        let _exit = BatchExit(self);
        f()
    }

    /// Number of stores since creation.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Register a change callback; it stays registered until the returned
    /// guard is dropped.
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        let id = self.inner.listeners.add(Listener::new(callback));
        self.inner.listeners.subscription(id)
    }

    /// Register a callback that receives the value current at delivery time.
    pub fn subscribe_value(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription
    where
        T: Clone,
    {
        let weak = Arc::downgrade(&self.inner);
        self.subscribe(move || {
            if let Some(inner) = weak.upgrade() {
                let value = inner.value.read().clone();
                callback(&value);
            }
        })
    }

    /// Register a listener by identity, without a guard.
    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, listener: &Listener) -> bool {
        self.inner.listeners.remove(listener)
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Close the listener set and run dispose hooks. Idempotent.
    ///
    /// The last value stays readable.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.listeners.close();
        let hooks = std::mem::take(&mut *self.inner.dispose_hooks.lock());
        tracing::debug!(
            message = "notifier.dispose",
            label = %self.inner.label,
            hooks = hooks.len(),
        );
        for hook in hooks {
            hook();
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Run `hook` when this notifier is disposed, or now if it already was.
    pub fn on_dispose(&self, hook: DisposeHook) {
        {
            let mut hooks = self.inner.dispose_hooks.lock();
            if !self.is_disposed() {
                hooks.push(hook);
                return;
            }
        }
        hook();
    }
}

impl<T> Listenable for Notifier<T> {
    fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
