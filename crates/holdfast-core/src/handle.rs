#![forbid(unsafe_code)]

//! Environment handles and per-instance handle brokers.
//!
//! An [`EnvHandle`] is a revocable capability supplied by the consumer layer
//! (for example a mounted view). A lifecycle instance owns a [`HandleBroker`]
//! that records which handles are currently attached to it. The broker's
//! `has_handle()` is true iff at least one attachment is live, and the owner
//! is told about availability changes through an observer callback instead of
//! polling.
//!
//! Attachments are leases: [`HandleBroker::attach`] returns a [`HandleLease`]
//! that detaches on drop, so a consumer that disappears without calling
//! `detach` cannot leave a dangling attachment behind.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Error, Result};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_ATTACHMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an [`EnvHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

struct HandleInner {
    id: HandleId,
    label: Arc<str>,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

/// An external environment handle. Cheap to clone; equality is identity.
#[derive(Clone)]
pub struct EnvHandle {
    inner: Arc<HandleInner>,
}

impl EnvHandle {
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        Self::build(label.into(), None)
    }

    /// A handle that carries a typed payload for `init` bodies to use.
    pub fn with_payload<P: Any + Send + Sync>(label: impl Into<Arc<str>>, payload: P) -> Self {
        Self::build(label.into(), Some(Arc::new(payload)))
    }

    fn build(label: Arc<str>, payload: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)),
                label,
                payload,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// The payload, if one of type `P` was supplied.
    #[must_use]
    pub fn payload<P: Any + Send + Sync>(&self) -> Option<Arc<P>> {
        Arc::clone(self.inner.payload.as_ref()?).downcast::<P>().ok()
    }
}

impl PartialEq for EnvHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for EnvHandle {}

impl fmt::Debug for EnvHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvHandle")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("payload", &self.inner.payload.is_some())
            .finish()
    }
}

/// Availability transition reported to a broker's observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleEvent {
    /// The first attachment arrived.
    Available,
    /// The last attachment went away.
    Unavailable,
}

type Observer = Arc<dyn Fn(HandleEvent) + Send + Sync>;

#[derive(Default)]
struct BrokerState {
    attachments: Vec<(u64, EnvHandle)>,
    released: bool,
}

struct BrokerInner {
    owner: Arc<str>,
    state: Mutex<BrokerState>,
    observer: Mutex<Option<Observer>>,
}

impl BrokerInner {
    fn emit(&self, event: HandleEvent) {
        tracing::debug!(message = "handle.transition", owner = %self.owner, event = ?event);
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer(event);
        }
    }

    fn detach_where(&self, matches: impl Fn(u64, &EnvHandle) -> bool) -> bool {
        let became_empty = {
            let mut state = self.state.lock();
            // Most recent attachment first.
            let Some(pos) = state.attachments.iter().rposition(|(id, h)| matches(*id, h)) else {
                return false;
            };
            state.attachments.remove(pos);
            state.attachments.is_empty()
        };
        if became_empty {
            self.emit(HandleEvent::Unavailable);
        }
        true
    }
}

/// Tracks the handles attached to one lifecycle instance.
///
/// Cloning shares the same broker.
#[derive(Clone)]
pub struct HandleBroker {
    inner: Arc<BrokerInner>,
}

impl fmt::Debug for HandleBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("HandleBroker")
            .field("owner", &self.inner.owner)
            .field("attachments", &state.attachments.len())
            .field("released", &state.released)
            .finish()
    }
}

impl HandleBroker {
    pub fn new(owner: impl Into<Arc<str>>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                owner: owner.into(),
                state: Mutex::new(BrokerState::default()),
                observer: Mutex::new(None),
            }),
        }
    }

    /// Install the callback that receives availability transitions. Replaces
    /// any previous observer.
    pub fn set_observer(&self, observer: impl Fn(HandleEvent) + Send + Sync + 'static) {
        *self.inner.observer.lock() = Some(Arc::new(observer));
    }

    /// Attach `handle`. The first live attachment makes the broker available.
    ///
    /// After [`release`](Self::release) the attachment is ignored and the
    /// returned lease is inert.
    pub fn attach(&self, handle: EnvHandle) -> HandleLease {
        let attachment = NEXT_ATTACHMENT_ID.fetch_add(1, Ordering::Relaxed);
        let became_available = {
            let mut state = self.inner.state.lock();
            if state.released {
                tracing::debug!(
                    message = "handle.attach_after_release",
                    owner = %self.inner.owner,
                    handle = %handle.label(),
                );
                return HandleLease {
                    broker: Weak::new(),
                    attachment,
                    handle,
                };
            }
            state.attachments.push((attachment, handle.clone()));
            state.attachments.len() == 1
        };
        if became_available {
            self.inner.emit(HandleEvent::Available);
        }
        HandleLease {
            broker: Arc::downgrade(&self.inner),
            attachment,
            handle,
        }
    }

    /// Remove one attachment of `handle` (the most recent). Returns `false`
    /// if it was not attached.
    pub fn detach(&self, handle: &EnvHandle) -> bool {
        self.inner.detach_where(|_, h| h == handle)
    }

    #[must_use]
    pub fn has_handle(&self) -> bool {
        !self.inner.state.lock().attachments.is_empty()
    }

    #[must_use]
    pub fn attachment_count(&self) -> usize {
        self.inner.state.lock().attachments.len()
    }

    /// The most recently attached live handle.
    #[must_use]
    pub fn current(&self) -> Option<EnvHandle> {
        self.inner
            .state
            .lock()
            .attachments
            .last()
            .map(|(_, h)| h.clone())
    }

    /// The current handle, or [`Error::HandleUnavailable`] naming `operation`.
    pub fn require(&self, operation: &str) -> Result<EnvHandle> {
        self.current()
            .ok_or_else(|| Error::handle_unavailable(operation))
    }

    /// Drop every attachment and refuse new ones. Idempotent.
    pub fn release(&self) {
        let had_handles = {
            let mut state = self.inner.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            let had = !state.attachments.is_empty();
            state.attachments.clear();
            had
        };
        if had_handles {
            self.inner.emit(HandleEvent::Unavailable);
        }
        self.inner.observer.lock().take();
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.state.lock().released
    }
}

/// A live attachment. Dropping it detaches the handle.
#[must_use = "dropping a HandleLease immediately detaches the handle"]
pub struct HandleLease {
    broker: Weak<BrokerInner>,
    attachment: u64,
    handle: EnvHandle,
}

impl HandleLease {
    #[must_use]
    pub fn handle(&self) -> &EnvHandle {
        &self.handle
    }

    /// Whether this attachment is still live.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.broker.upgrade().is_some_and(|b| {
            b.state
                .lock()
                .attachments
                .iter()
                .any(|(id, _)| *id == self.attachment)
        })
    }

    /// Detach now. Equivalent to dropping the lease.
    pub fn detach(self) {}
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            let attachment = self.attachment;
            broker.detach_where(|id, _| id == attachment);
        }
    }
}

impl fmt::Debug for HandleLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleLease")
            .field("handle", &self.handle)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Anything that owns a [`HandleBroker`].
pub trait HandleHost {
    fn broker(&self) -> &HandleBroker;
}

impl HandleHost for HandleBroker {
    fn broker(&self) -> &HandleBroker {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(broker: &HandleBroker) -> Arc<Mutex<Vec<HandleEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        broker.set_observer(move |e| sink.lock().push(e));
        events
    }

    #[test]
    fn has_handle_tracks_last_attachment() {
        let broker = HandleBroker::new("vm");
        let events = observed(&broker);
        let a = EnvHandle::new("view-a");
        let b = EnvHandle::new("view-b");

        let lease_a = broker.attach(a.clone());
        let lease_b = broker.attach(b.clone());
        assert!(broker.has_handle());
        assert_eq!(broker.current(), Some(b));

        drop(lease_b);
        assert!(broker.has_handle());
        assert_eq!(broker.current(), Some(a));

        drop(lease_a);
        assert!(!broker.has_handle());
        assert_eq!(
            *events.lock(),
            vec![HandleEvent::Available, HandleEvent::Unavailable]
        );
    }

    #[test]
    fn explicit_detach_then_lease_drop_is_single_removal() {
        let broker = HandleBroker::new("vm");
        let h = EnvHandle::new("view");
        let lease1 = broker.attach(h.clone());
        let lease2 = broker.attach(h.clone());

        assert!(broker.detach(&h));
        assert_eq!(broker.attachment_count(), 1);
        // lease2's attachment was the one removed; dropping it is a no-op.
        assert!(!lease2.is_attached());
        drop(lease2);
        assert!(lease1.is_attached());
        assert!(broker.has_handle());
    }

    #[test]
    fn require_names_operation() {
        let broker = HandleBroker::new("vm");
        let err = broker.require("load_theme").expect_err("no handle");
        assert_eq!(
            err.to_string(),
            "handle required but unavailable for load_theme"
        );

        let _lease = broker.attach(EnvHandle::new("view"));
        assert!(broker.require("load_theme").is_ok());
    }

    #[test]
    fn release_clears_and_refuses_new_attachments() {
        let broker = HandleBroker::new("vm");
        let events = observed(&broker);
        let lease = broker.attach(EnvHandle::new("view"));
        broker.release();
        assert!(!broker.has_handle());
        assert!(!lease.is_attached());

        let late = broker.attach(EnvHandle::new("late"));
        assert!(!late.is_attached());
        assert!(!broker.has_handle());
        assert_eq!(
            *events.lock(),
            vec![HandleEvent::Available, HandleEvent::Unavailable]
        );
        broker.release();
    }

    #[test]
    fn payload_downcast() {
        let h = EnvHandle::with_payload("view", 42u32);
        assert_eq!(h.payload::<u32>().as_deref(), Some(&42));
        assert!(h.payload::<String>().is_none());
        assert!(EnvHandle::new("bare").payload::<u32>().is_none());
    }

    #[test]
    fn handles_compare_by_identity() {
        let a = EnvHandle::new("same");
        let b = EnvHandle::new("same");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
