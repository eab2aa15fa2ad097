#![forbid(unsafe_code)]

//! Lazy derived values that follow [`Notifier`] dependencies.
//!
//! # Design
//!
//! [`Derived<T>`] wraps a compute function and its cached result in shared,
//! reference-counted storage. Every dependency notification marks the cache
//! dirty; the next [`get()`](Derived::get) recomputes and caches the result.
//!
//! # Invariants
//!
//! 1. `get()` never returns a value computed before the latest dependency
//!    notification.
//! 2. The compute function runs at most once per dirty cycle.
//! 3. `version()` increments by exactly 1 per recomputation.
//!
//! # Failure Modes
//!
//! - **Compute function panics**: the previous cached value is kept and the
//!   dirty flag stays set, so the next `get()` retries.
//! - **Dependency dropped or disposed**: its subscription becomes inert and
//!   the cached value is kept.
//! - **Compute reads its own `Derived`**: deadlock. Derived values must not
//!   depend on themselves.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::listener::Subscription;
use crate::notifier::Notifier;

struct Cache<T> {
    value: Option<T>,
    version: u64,
}

struct DerivedInner<T> {
    compute: Box<dyn Fn() -> T + Send + Sync>,
    cache: Mutex<Cache<T>>,
    dirty: AtomicBool,
    /// Keeps dependency callbacks registered; never read.
    _subscriptions: Mutex<Vec<Subscription>>,
}

/// A lazily evaluated, memoized value derived from one or more notifiers.
///
/// Cloning a `Derived` creates a new handle to the **same** cache.
pub struct Derived<T> {
    inner: Arc<DerivedInner<T>>,
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cache = self.inner.cache.lock();
        f.debug_struct("Derived")
            .field("cached", &cache.value)
            .field("dirty", &self.inner.dirty.load(Ordering::Acquire))
            .field("version", &cache.version)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Derived<T> {
    fn build(compute: Box<dyn Fn() -> T + Send + Sync>) -> Self {
        Self {
            inner: Arc::new(DerivedInner {
                compute,
                cache: Mutex::new(Cache {
                    value: None,
                    version: 0,
                }),
                dirty: AtomicBool::new(true),
                _subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    fn watch<S: Send + Sync + 'static>(&self, source: &Notifier<S>) {
        let weak = Arc::downgrade(&self.inner);
        let sub = source.subscribe(move || {
            if let Some(inner) = weak.upgrade() {
                inner.dirty.store(true, Ordering::Release);
            }
        });
        self.inner._subscriptions.lock().push(sub);
    }

    /// Derive from a single notifier.
    pub fn from_notifier<S: Send + Sync + 'static>(
        source: &Notifier<S>,
        map: impl Fn(&S) -> T + Send + Sync + 'static,
    ) -> Self {
        let src = source.clone();
        let derived = Self::build(Box::new(move || src.with(|v| map(v))));
        derived.watch(source);
        derived
    }

    /// Derive from two notifiers.
    pub fn from2<S1, S2>(
        s1: &Notifier<S1>,
        s2: &Notifier<S2>,
        map: impl Fn(&S1, &S2) -> T + Send + Sync + 'static,
    ) -> Self
    where
        S1: Send + Sync + 'static,
        S2: Send + Sync + 'static,
    {
        let a = s1.clone();
        let b = s2.clone();
        let derived = Self::build(Box::new(move || a.with(|v1| b.with(|v2| map(v1, v2)))));
        derived.watch(s1);
        derived.watch(s2);
        derived
    }

    /// Low-level constructor: the caller wires invalidation through the
    /// supplied subscriptions or [`invalidate`](Self::invalidate).
    pub fn from_fn(
        compute: impl Fn() -> T + Send + Sync + 'static,
        subscriptions: Vec<Subscription>,
    ) -> Self {
        let derived = Self::build(Box::new(compute));
        *derived.inner._subscriptions.lock() = subscriptions;
        derived
    }

    fn refresh<'c>(&self, cache: &'c mut Cache<T>) -> &'c T {
        let cached = cache
            .value
            .take()
            .filter(|_| !self.inner.dirty.load(Ordering::Acquire));
        let value = match cached {
            Some(value) => value,
            None => {
                // Clear before computing so a notification that lands mid-compute
                // leaves the cache dirty.
                self.inner.dirty.store(false, Ordering::Release);
                match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    (self.inner.compute)()
                })) {
                    Ok(value) => {
                        cache.version += 1;
                        value
                    }
                    Err(payload) => {
                        self.inner.dirty.store(true, Ordering::Release);
                        std::panic::resume_unwind(payload);
                    }
                }
            }
        };
        cache.value.insert(value)
    }

    /// Current value, recomputed first if any dependency changed.
    #[must_use]
    pub fn get(&self) -> T {
        let mut cache = self.inner.cache.lock();
        self.refresh(&mut cache).clone()
    }

    /// Borrow the current value without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let mut cache = self.inner.cache.lock();
        f(self.refresh(&mut cache))
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    /// Force the next `get()` to recompute.
    pub fn invalidate(&self) {
        self.inner.dirty.store(true, Ordering::Release);
    }

    /// Number of recomputations so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.cache.lock().version
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn single_dep_derived() {
        let source = Notifier::new(10);
        let derived = Derived::from_notifier(&source, |v| v * 2);

        assert_eq!(derived.get(), 20);
        assert_eq!(derived.version(), 1);

        source.set(5);
        assert!(derived.is_dirty());
        assert_eq!(derived.get(), 10);
        assert_eq!(derived.version(), 2);
    }

    #[test]
    fn two_dep_derived() {
        let width = Notifier::new(10);
        let height = Notifier::new(20);
        let area = Derived::from2(&width, &height, |w, h| w * h);

        assert_eq!(area.get(), 200);
        width.set(5);
        assert_eq!(area.get(), 100);
        height.set(30);
        assert_eq!(area.get(), 150);
    }

    #[test]
    fn memoization() {
        let runs = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&runs);
        let source = Notifier::new(10);
        let derived = Derived::from_notifier(&source, move |v| {
            r.fetch_add(1, Ordering::SeqCst);
            v * 2
        });

        assert_eq!(derived.get(), 20);
        assert_eq!(derived.get(), 20);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        source.set(20);
        assert_eq!(derived.get(), 40);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn silent_write_does_not_invalidate() {
        let source = Notifier::new(1);
        let derived = Derived::from_notifier(&source, |v| *v);
        assert_eq!(derived.get(), 1);

        source.set_silently(2);
        assert!(!derived.is_dirty());
        assert_eq!(derived.get(), 1);

        // Transform always notifies, so the derived value catches up.
        source.transform(|v| v);
        assert_eq!(derived.get(), 2);
    }

    #[test]
    fn equal_write_keeps_cache_clean() {
        let source = Notifier::new(42);
        let derived = Derived::from_notifier(&source, |v| *v);
        let _ = derived.get();
        source.set(42);
        assert!(!derived.is_dirty());
        assert_eq!(derived.version(), 1);
    }

    #[test]
    fn invalidate_forces_recompute() {
        let source = Notifier::new(5);
        let derived = Derived::from_notifier(&source, |v| *v);
        let _ = derived.get();
        derived.invalidate();
        assert!(derived.is_dirty());
        let _ = derived.get();
        assert_eq!(derived.version(), 2);
    }

    #[test]
    fn from_fn_requires_manual_invalidation() {
        let source = Notifier::new(5);
        let src = source.clone();
        let derived = Derived::from_fn(move || src.get() * 3, vec![]);
        assert_eq!(derived.get(), 15);

        source.set(10);
        assert_eq!(derived.get(), 15);
        derived.invalidate();
        assert_eq!(derived.get(), 30);
    }

    #[test]
    fn survives_source_disposal() {
        let source = Notifier::new(String::from("kept"));
        let derived = Derived::from_notifier(&source, |v| v.len());
        assert_eq!(derived.get(), 4);
        source.dispose();
        assert_eq!(derived.get(), 4);
        assert!(!derived.is_dirty());
    }

    #[test]
    fn panicking_compute_leaves_cache_dirty() {
        let source = Notifier::new(0i32);
        let src = source.clone();
        let derived = Derived::from_fn(
            move || {
                let v = src.get();
                assert!(v >= 0, "negative input");
                v + 1
            },
            vec![],
        );
        assert_eq!(derived.get(), 1);

        source.set(-1);
        derived.invalidate();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| derived.get()));
        assert!(outcome.is_err());
        assert!(derived.is_dirty());

        source.set(4);
        assert_eq!(derived.with(|v| *v), 5);
        assert_eq!(derived.version(), 2);
        assert!(!derived.is_dirty());
    }

    #[test]
    fn with_access_and_debug() {
        let source = Notifier::new(vec![1, 2, 3]);
        let derived = Derived::from_notifier(&source, |v| v.iter().sum::<i32>());
        assert_eq!(derived.with(|s| *s), 6);
        let dbg = format!("{derived:?}");
        assert!(dbg.contains("Derived"));
        assert!(dbg.contains('6'));
    }
}
