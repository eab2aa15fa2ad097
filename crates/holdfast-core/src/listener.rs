#![forbid(unsafe_code)]

//! Ordered listener storage with snapshot delivery.
//!
//! # Design
//!
//! The listener list is an immutable `Vec` behind an [`ArcSwap`]. Writers
//! (`add`, `remove`) are serialized by a mutex and publish a fresh list;
//! [`ListenerRegistry::notify_all`] loads the current list once and iterates
//! that snapshot, so the list can be mutated from inside a listener without
//! invalidating the round in progress.
//!
//! Every entry also carries a `live` flag that removal clears. Delivery skips
//! entries whose flag is cleared, which is what stops a listener removed
//! mid-round from being invoked later in that same round.
//!
//! # Invariants
//!
//! 1. Delivery order is registration order.
//! 2. A round delivers only to listeners present when the round started.
//! 3. A listener removed during a round is not invoked later in that round;
//!    the listener currently running is unaffected.
//! 4. A panicking listener does not stop the round. Its panic is reported to
//!    the fault sink after the round completes.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::fault::{Fault, FaultKind, FaultSink, default_sink, panic_message};

/// A zero-argument change callback with stable identity.
///
/// Clones share identity: removing any clone removes the registration made
/// with another clone.
#[derive(Clone)]
pub struct Listener {
    callback: Arc<dyn Fn() + Send + Sync>,
}

impl Listener {
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Whether `self` and `other` are the same listener.
    #[must_use]
    pub fn same(&self, other: &Listener) -> bool {
        Arc::ptr_eq(&self.callback, &other.callback)
    }

    fn call(&self) {
        (self.callback)();
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("ptr", &Arc::as_ptr(&self.callback).cast::<()>())
            .finish()
    }
}

/// Identifier of a single registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

struct Entry {
    id: ListenerId,
    listener: Listener,
    live: AtomicBool,
}

struct Shared {
    origin: Arc<str>,
    entries: ArcSwap<Vec<Arc<Entry>>>,
    writer: Mutex<()>,
    next_id: AtomicU64,
    closed: AtomicBool,
    sink: Arc<dyn FaultSink>,
}

impl Shared {
    fn remove_where(&self, matches: impl Fn(&Entry) -> bool) -> bool {
        let _writer = self.writer.lock();
        let current = self.entries.load_full();
        let Some(pos) = current.iter().position(|e| matches(e)) else {
            return false;
        };
        current[pos].live.store(false, Ordering::Release);
        let mut next = Vec::with_capacity(current.len() - 1);
        next.extend(
            current
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != pos)
                .map(|(_, e)| Arc::clone(e)),
        );
        self.entries.store(Arc::new(next));
        true
    }
}

/// Ordered, reentrancy-safe collection of [`Listener`]s.
///
/// Cloning a `ListenerRegistry` creates a new handle to the **same** list.
#[derive(Clone)]
pub struct ListenerRegistry {
    shared: Arc<Shared>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new("listeners", default_sink())
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("origin", &self.shared.origin)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ListenerRegistry {
    /// Create an empty registry. `origin` labels faults reported to `sink`.
    pub fn new(origin: impl Into<Arc<str>>, sink: Arc<dyn FaultSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                origin: origin.into(),
                entries: ArcSwap::from_pointee(Vec::new()),
                writer: Mutex::new(()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                sink,
            }),
        }
    }

    /// Append a listener. Adding the same listener twice stores it twice.
    ///
    /// After [`close`](Self::close) the listener is dropped and never invoked;
    /// the returned id is still unique.
    pub fn add(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        // Checked under the writer lock so a racing close() cannot miss it.
        let _writer = self.shared.writer.lock();
        if self.is_closed() {
            tracing::debug!(message = "listeners.add_after_close", origin = %self.shared.origin);
            return id;
        }
        let entry = Arc::new(Entry {
            id,
            listener,
            live: AtomicBool::new(true),
        });
        let current = self.shared.entries.load_full();
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(entry);
        self.shared.entries.store(Arc::new(next));
        id
    }

    /// Remove the first registration of `listener`. Returns `false` if it was
    /// not registered.
    pub fn remove(&self, listener: &Listener) -> bool {
        self.shared.remove_where(|e| e.listener.same(listener))
    }

    /// Remove the registration with the given id.
    pub fn remove_id(&self, id: ListenerId) -> bool {
        self.shared.remove_where(|e| e.id == id)
    }

    #[must_use]
    pub fn contains(&self, listener: &Listener) -> bool {
        self.shared
            .entries
            .load()
            .iter()
            .any(|e| e.listener.same(listener))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.entries.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one round to every listener present at the start of the call.
    ///
    /// Returns the number of listeners invoked.
    pub fn notify_all(&self) -> usize {
        let snapshot = self.shared.entries.load_full();
        let mut invoked = 0usize;
        let mut faults = Vec::new();

        for entry in snapshot.iter() {
            if !entry.live.load(Ordering::Acquire) {
                continue;
            }
            invoked += 1;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| entry.listener.call())) {
                faults.push(panic_message(payload.as_ref()));
            }
        }

        tracing::trace!(
            message = "listeners.notify",
            origin = %self.shared.origin,
            invoked,
            faults = faults.len(),
        );

        for message in faults {
            self.shared.sink.report(Fault::new(
                FaultKind::Listener,
                Arc::clone(&self.shared.origin),
                message,
            ));
        }
        invoked
    }

    /// Remove every listener and ignore later additions.
    ///
    /// A round in progress skips the listeners it has not reached yet.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _writer = self.shared.writer.lock();
        for entry in self.shared.entries.load().iter() {
            entry.live.store(false, Ordering::Release);
        }
        self.shared.entries.store(Arc::new(Vec::new()));
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub(crate) fn subscription(&self, id: ListenerId) -> Subscription {
        Subscription {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }
}

/// Anything that owns a [`ListenerRegistry`] consumers can subscribe to.
pub trait Listenable {
    fn listeners(&self) -> &ListenerRegistry;
}

impl Listenable for ListenerRegistry {
    fn listeners(&self) -> &ListenerRegistry {
        self
    }
}

/// RAII guard that removes its listener on drop.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    shared: Weak<Shared>,
    id: ListenerId,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Whether the listener is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|s| s.entries.load().iter().any(|e| e.id == self.id))
    }

    /// Unsubscribe now. Equivalent to dropping the guard.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_where(|e| e.id == self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
