#![forbid(unsafe_code)]

//! Synchronous lifecycle: a notifier plus a handle-gated `init` routine.
//!
//! # Protocol
//!
//! 1. At construction the broker is asked whether a handle is attached, and
//!    `init` runs once, synchronously. `init` receives the lifecycle itself and
//!    establishes the starting value with `set`/`set_silently`.
//! 2. An `init` error at construction aborts construction.
//! 3. If construction ran without a handle, the first time a handle becomes
//!    available `init` runs once more. Every later attach/detach cycle, and
//!    every later [`Lifecycle::reinitialize_with_handle`] call, is a no-op.
//! 4. Disposal closes the init guard, releases all handle attachments and
//!    disposes the notifier. The last value stays readable; nothing is
//!    reinitialized on access.
//!
//! Reinit errors are returned from `reinitialize_with_handle`. When the
//! rerun is triggered by an attachment instead, the error is logged at `warn`
//! and reported to the fault sink.

use std::any::type_name;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{BoxError, Error, Result};
use crate::fault::{Fault, FaultKind, FaultSink, default_sink, panic_message};
use crate::guard::InitGuard;
use crate::handle::{EnvHandle, HandleBroker, HandleEvent, HandleHost, HandleLease};
use crate::listener::{Listenable, ListenerRegistry, Subscription};
use crate::notifier::{DisposeHook, Notifier, NotifierConfig};
use crate::registry::Managed;

type InitFn<T> = dyn Fn(&Lifecycle<T>) -> std::result::Result<(), BoxError> + Send + Sync;

struct LifecycleInner<T> {
    name: Arc<str>,
    notifier: Notifier<T>,
    broker: HandleBroker,
    guard: InitGuard,
    init: Box<InitFn<T>>,
    init_runs: AtomicU32,
}

/// A notifier whose starting value comes from a handle-gated `init`.
///
/// Cloning creates a new handle to the **same** lifecycle.
pub struct Lifecycle<T> {
    inner: Arc<LifecycleInner<T>>,
}

impl<T> Clone for Lifecycle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug + Send + Sync + 'static> fmt::Debug for Lifecycle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("name", &self.inner.name)
            .field("notifier", &self.inner.notifier)
            .field("has_handle", &self.inner.broker.has_handle())
            .field("init_runs", &self.inner.init_runs.load(Ordering::Acquire))
            .finish()
    }
}

/// Builder for [`Lifecycle`].
pub struct LifecycleBuilder<T> {
    initial: T,
    name: Option<Arc<str>>,
    fault_sink: Arc<dyn FaultSink>,
}

impl<T: Send + Sync + 'static> LifecycleBuilder<T> {
    /// `initial` is the value held before `init` runs.
    pub fn new(initial: T) -> Self {
        Self {
            initial,
            name: None,
            fault_sink: default_sink(),
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn fault_sink(mut self, sink: Arc<dyn FaultSink>) -> Self {
        self.fault_sink = sink;
        self
    }

    /// Construct without a handle and run `init`.
    pub fn build<E>(
        self,
        init: impl Fn(&Lifecycle<T>) -> std::result::Result<(), E> + Send + Sync + 'static,
    ) -> Result<Lifecycle<T>>
    where
        E: Into<BoxError>,
    {
        let (lifecycle, ()) = self.construct(boxed_init(init), |_| ())?;
        Ok(lifecycle)
    }

    /// Construct with `handle` already attached and run `init`.
    ///
    /// The returned lease keeps the handle attached.
    pub fn build_with_handle<E>(
        self,
        handle: EnvHandle,
        init: impl Fn(&Lifecycle<T>) -> std::result::Result<(), E> + Send + Sync + 'static,
    ) -> Result<(Lifecycle<T>, HandleLease)>
    where
        E: Into<BoxError>,
    {
        self.construct(boxed_init(init), move |broker| broker.attach(handle))
    }

    /// `attach` runs against the fresh broker before `init`; its output is
    /// held until construction finishes and then handed back.
    fn construct<L>(
        self,
        init: Box<InitFn<T>>,
        attach: impl FnOnce(&HandleBroker) -> L,
    ) -> Result<(Lifecycle<T>, L)> {
        let name = self
            .name
            .unwrap_or_else(|| Arc::from(format!("lifecycle<{}>", type_name::<T>())));
        let notifier = Notifier::with_config(
            self.initial,
            NotifierConfig::default()
                .label(Arc::clone(&name))
                .fault_sink(self.fault_sink),
        );
        let broker = HandleBroker::new(Arc::clone(&name));
        let lease = attach(&broker);

        let lifecycle = Lifecycle {
            inner: Arc::new(LifecycleInner {
                name,
                notifier,
                broker,
                guard: InitGuard::new(),
                init,
                init_runs: AtomicU32::new(0),
            }),
        };

        let has_handle = lifecycle.has_handle();
        lifecycle.inner.guard.mark_constructed(has_handle);
        let phase = if has_handle {
            "construct_with_handle"
        } else {
            "construct"
        };
        if let Err(err) = lifecycle.run_init(phase) {
            drop(lease);
            lifecycle.dispose();
            return Err(err);
        }

        lifecycle.watch_handles();
        Ok((lifecycle, lease))
    }
}

fn boxed_init<T, E>(
    init: impl Fn(&Lifecycle<T>) -> std::result::Result<(), E> + Send + Sync + 'static,
) -> Box<InitFn<T>>
where
    E: Into<BoxError>,
{
    Box::new(move |lc: &Lifecycle<T>| init(lc).map_err(Into::<BoxError>::into))
}

impl<T: Send + Sync + 'static> Lifecycle<T> {
    pub fn builder(initial: T) -> LifecycleBuilder<T> {
        LifecycleBuilder::new(initial)
    }

    fn run_init(&self, phase: &'static str) -> Result<()> {
        let run = self.inner.init_runs.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(
            message = "lifecycle.init",
            name = %self.inner.name,
            phase,
            run,
            has_handle = self.has_handle(),
        );
        (self.inner.init)(self).map_err(|source| Error::init(&*self.inner.name, source))
    }

    fn watch_handles(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.broker.set_observer(move |event| {
            if event != HandleEvent::Available {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                Lifecycle { inner }.reinit_on_attach();
            }
        });
    }

    fn reinit_on_attach(&self) {
        let message = match catch_unwind(AssertUnwindSafe(|| self.reinitialize_with_handle())) {
            Ok(Ok(_)) => return,
            Ok(Err(err)) => err.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };
        tracing::warn!(
            message = "lifecycle.reinit_failed",
            name = %self.inner.name,
            error = %message,
        );
        self.inner.notifier.fault_sink().report(Fault::new(
            FaultKind::Init,
            Arc::clone(&self.inner.name),
            message,
        ));
    }

    /// Rerun `init` now that a handle is attached, at most once per lifecycle.
    ///
    /// Returns `Ok(true)` if `init` ran. No-op (`Ok(false)`) when disposed,
    /// when no handle is attached, when construction already had a handle,
    /// or when the rerun already happened.
    pub fn reinitialize_with_handle(&self) -> Result<bool> {
        if self.is_disposed() || !self.has_handle() {
            return Ok(false);
        }
        if !self.inner.guard.try_claim_reinit() {
            return Ok(false);
        }
        self.run_init("reinit")?;
        Ok(true)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The underlying notifier.
    #[must_use]
    pub fn notifier(&self) -> &Notifier<T> {
        &self.inner.notifier
    }

    #[must_use]
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.inner.notifier.get()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.notifier.with(f)
    }

    pub fn set(&self, value: T) -> bool
    where
        T: PartialEq,
    {
        self.inner.notifier.set(value)
    }

    pub fn set_silently(&self, value: T) {
        self.inner.notifier.set_silently(value);
    }

    pub fn transform(&self, f: impl FnOnce(T) -> T)
    where
        T: Clone,
    {
        self.inner.notifier.transform(f);
    }

    pub fn transform_silently(&self, f: impl FnOnce(T) -> T)
    where
        T: Clone,
    {
        self.inner.notifier.transform_silently(f);
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.notifier.subscribe(callback)
    }

    #[must_use]
    pub fn has_handle(&self) -> bool {
        self.inner.broker.has_handle()
    }

    /// The most recently attached handle.
    #[must_use]
    pub fn handle(&self) -> Option<EnvHandle> {
        self.inner.broker.current()
    }

    /// The current handle, or a "handle required" error naming `operation`.
    pub fn require(&self, operation: &str) -> Result<EnvHandle> {
        self.inner.broker.require(operation)
    }

    /// How many times `init` has run (at most 2).
    #[must_use]
    pub fn init_runs(&self) -> u32 {
        self.inner.init_runs.load(Ordering::Acquire)
    }

    pub fn dispose(&self) {
        if self.inner.notifier.is_disposed() {
            return;
        }
        self.inner.guard.close();
        self.inner.broker.release();
        self.inner.notifier.dispose();
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.notifier.is_disposed()
    }
}

impl<T: Send + Sync + 'static> Managed for Lifecycle<T> {
    fn dispose(&self) {
        Lifecycle::dispose(self);
    }

    fn is_disposed(&self) -> bool {
        Lifecycle::is_disposed(self)
    }

    fn on_dispose(&self, hook: DisposeHook) {
        self.inner.notifier.on_dispose(hook);
    }
}

impl<T> HandleHost for Lifecycle<T> {
    fn broker(&self) -> &HandleBroker {
        &self.inner.broker
    }
}

impl<T> Listenable for Lifecycle<T> {
    fn listeners(&self) -> &ListenerRegistry {
        self.inner.notifier.listeners()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
