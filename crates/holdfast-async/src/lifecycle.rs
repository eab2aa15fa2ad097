#![forbid(unsafe_code)]

//! Async lifecycle: a notifier over [`AsyncState<T>`] driven by an
//! asynchronous `init`.
//!
//! # Design
//!
//! Each `init` invocation is a *cycle*. Starting a cycle bumps a generation
//! counter, moves the state to `Loading` (always notifying) and calls `init`
//! to obtain its future. The future is either spawned on a tokio runtime
//! ([`reload`](AsyncLifecycle::reload)) or awaited inline
//! ([`reload_and_wait`](AsyncLifecycle::reload_and_wait)). When it resolves,
//! its outcome is applied only if its generation is still the latest and the
//! lifecycle is not disposed; otherwise the completion is stale and dropped.
//!
//! The handle-gated protocol matches the sync [`Lifecycle`]: the first guarded
//! cycle records whether a handle was attached, and if it was not, the first
//! handle attachment starts exactly one more cycle. That cycle is deferred
//! until no other cycle is in flight, so the two handle-gated `init` calls
//! never overlap.
//!
//! # Invariants
//!
//! 1. Completions of superseded cycles never touch the state.
//! 2. `init` faults (errors and panics) become `Error` states; they are never
//!    raised to the code that started the cycle.
//! 3. After [`dispose`](AsyncLifecycle::dispose) no completion is applied and
//!    no cycle starts. The last state stays readable.
//!
//! # Failure Modes
//!
//! - **No tokio runtime** when a cycle must be spawned: the cycle is not
//!   started, a `warn` event is logged and a `Runtime` fault is reported.
//!
//! [`Lifecycle`]: holdfast_core::Lifecycle

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use futures::future::{self, BoxFuture, FutureExt, TryFutureExt};
use holdfast_core::fault::panic_message;
use holdfast_core::{
    BoxError, DisposeHook, EnvHandle, Fault, FaultKind, FaultSink, HandleBroker, HandleEvent,
    HandleHost, HandleLease, InitFault, InitGuard, Listenable, ListenerRegistry, Managed,
    MessageError, Notifier, NotifierConfig, Result, Subscription,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::config::AsyncLifecycleConfig;
use crate::state::AsyncState;

/// The boxed future an `init` call produces.
pub type InitFuture<T> = BoxFuture<'static, std::result::Result<T, BoxError>>;

type InitFn<T> = dyn Fn(AsyncLifecycle<T>) -> InitFuture<T> + Send + Sync;

#[derive(Debug, Default)]
struct Cycles {
    in_flight: usize,
    /// The handle-triggered rerun is claimed but waits for `in_flight == 0`.
    reinit_pending: bool,
    /// The queued rerun is being started.
    reinit_starting: bool,
}

struct AsyncInner<T> {
    name: Arc<str>,
    notifier: Notifier<AsyncState<T>>,
    broker: HandleBroker,
    guard: InitGuard,
    init: Box<InitFn<T>>,
    generation: AtomicU64,
    cycles: Mutex<Cycles>,
    init_calls: AtomicU32,
    settled: Notify,
    runtime: Option<Handle>,
}

/// A notifier over [`AsyncState<T>`] whose data comes from an async `init`.
///
/// Cloning creates a new handle to the **same** lifecycle.
pub struct AsyncLifecycle<T> {
    inner: Arc<AsyncInner<T>>,
}

impl<T> Clone for AsyncLifecycle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug + Send + Sync + 'static> fmt::Debug for AsyncLifecycle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cycles = self.inner.cycles.lock();
        f.debug_struct("AsyncLifecycle")
            .field("name", &self.inner.name)
            .field("state", &self.inner.notifier)
            .field("generation", &self.inner.generation.load(Ordering::Acquire))
            .field("in_flight", &cycles.in_flight)
            .field("has_handle", &self.inner.broker.has_handle())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`AsyncLifecycle`].
pub struct AsyncLifecycleBuilder<T> {
    config: AsyncLifecycleConfig,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for AsyncLifecycleBuilder<T> {
    fn default() -> Self {
        Self::with_config(AsyncLifecycleConfig::default())
    }
}

impl<T> AsyncLifecycleBuilder<T> {
    #[must_use]
    pub fn with_config(config: AsyncLifecycleConfig) -> Self {
        Self {
            config,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.config = self.config.name(name);
        self
    }

    /// Whether construction starts the first cycle (default `true`). When
    /// `false`, call [`AsyncLifecycle::load`].
    #[must_use]
    pub fn load_on_init(mut self, load_on_init: bool) -> Self {
        self.config = self.config.load_on_init(load_on_init);
        self
    }

    #[must_use]
    pub fn fault_sink(mut self, sink: Arc<dyn FaultSink>) -> Self {
        self.config = self.config.fault_sink(sink);
        self
    }

    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.config = self.config.runtime(runtime);
        self
    }
}

impl<T: Clone + Send + Sync + 'static> AsyncLifecycleBuilder<T> {
    /// Construct without a handle.
    pub fn build<F, Fut, E>(self, init: F) -> AsyncLifecycle<T>
    where
        F: Fn(AsyncLifecycle<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.construct(boxed_init(init), |_| ()).0
    }

    /// Construct with `handle` already attached. The returned lease keeps it
    /// attached.
    pub fn build_with_handle<F, Fut, E>(
        self,
        handle: EnvHandle,
        init: F,
    ) -> (AsyncLifecycle<T>, HandleLease)
    where
        F: Fn(AsyncLifecycle<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.construct(boxed_init(init), move |broker| broker.attach(handle))
    }

    /// `attach` runs against the fresh broker before the first cycle starts.
    fn construct<L>(
        self,
        init: Box<InitFn<T>>,
        attach: impl FnOnce(&HandleBroker) -> L,
    ) -> (AsyncLifecycle<T>, L) {
        let config = self.config;
        let name = config
            .name
            .unwrap_or_else(|| Arc::from(format!("async<{}>", type_name::<T>())));
        let notifier = Notifier::with_config(
            AsyncState::Initial,
            NotifierConfig::default()
                .label(Arc::clone(&name))
                .fault_sink(config.fault_sink),
        );
        let broker = HandleBroker::new(Arc::clone(&name));
        let lease = attach(&broker);

        let lifecycle = AsyncLifecycle {
            inner: Arc::new(AsyncInner {
                name,
                notifier,
                broker,
                guard: InitGuard::new(),
                init,
                generation: AtomicU64::new(0),
                cycles: Mutex::new(Cycles::default()),
                init_calls: AtomicU32::new(0),
                settled: Notify::new(),
                runtime: config.runtime,
            }),
        };
        if config.load_on_init {
            lifecycle.load();
        }
        lifecycle.watch_handles();
        (lifecycle, lease)
    }
}

fn boxed_init<T, F, Fut, E>(init: F) -> Box<InitFn<T>>
where
    F: Fn(AsyncLifecycle<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    Box::new(move |lc: AsyncLifecycle<T>| init(lc).map_err(Into::<BoxError>::into).boxed())
}

// ---------------------------------------------------------------------------
// Cycles
// ---------------------------------------------------------------------------

/// Keeps the in-flight count raised while a cycle runs.
struct InFlight<T: Clone + Send + Sync + 'static> {
    lifecycle: AsyncLifecycle<T>,
}

impl<T: Clone + Send + Sync + 'static> Drop for InFlight<T> {
    fn drop(&mut self) {
        let inner = &self.lifecycle.inner;
        let start_reinit = {
            let mut cycles = inner.cycles.lock();
            cycles.in_flight = cycles.in_flight.saturating_sub(1);
            if cycles.in_flight == 0 && cycles.reinit_pending {
                cycles.reinit_pending = false;
                cycles.reinit_starting = true;
                true
            } else {
                false
            }
        };
        if start_reinit {
            self.lifecycle.spawn_cycle("reinit");
            inner.cycles.lock().reinit_starting = false;
        }
        inner.settled.notify_waiters();
    }
}

/// A started cycle: its generation and the future `init` returned.
struct Cycle<T: Clone + Send + Sync + 'static> {
    generation: u64,
    future: InitFuture<T>,
    flight: InFlight<T>,
}

impl<T: Clone + Send + Sync + 'static> Cycle<T> {
    async fn run(self) {
        let Cycle {
            generation,
            future,
            flight,
        } = self;
        let outcome = match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(error)) => Err(InitFault::from(error)),
            Err(payload) => Err(panic_fault(payload.as_ref())),
        };
        flight.lifecycle.finish(generation, outcome);
        drop(flight);
    }
}

fn panic_fault(payload: &(dyn std::any::Any + Send)) -> InitFault {
    Arc::new(MessageError::new(format!(
        "init panicked: {}",
        panic_message(payload)
    )))
}

impl<T: Clone + Send + Sync + 'static> AsyncLifecycle<T> {
    pub fn builder() -> AsyncLifecycleBuilder<T> {
        AsyncLifecycleBuilder::default()
    }

    fn watch_handles(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.broker.set_observer(move |event| {
            if event != HandleEvent::Available {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                AsyncLifecycle { inner }.reinitialize_with_handle();
            }
        });
    }

    /// Runtime to spawn on, or `None` after logging and reporting why not.
    fn runtime(&self) -> Option<Handle> {
        if let Some(runtime) = &self.inner.runtime {
            return Some(runtime.clone());
        }
        match Handle::try_current() {
            Ok(runtime) => Some(runtime),
            Err(err) => {
                tracing::warn!(
                    message = "async.spawn_failed",
                    name = %self.inner.name,
                    error = %err,
                );
                self.inner.notifier.fault_sink().report(Fault::new(
                    FaultKind::Runtime,
                    Arc::clone(&self.inner.name),
                    format!("cannot start init cycle: {err}"),
                ));
                None
            }
        }
    }

    fn start_cycle(&self, reason: &'static str) -> Option<Cycle<T>> {
        if self.is_disposed() {
            return None;
        }
        let generation = {
            let mut cycles = self.inner.cycles.lock();
            cycles.in_flight += 1;
            let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
            self.inner.notifier.set_silently(AsyncState::Loading);
            generation
        };
        let flight = InFlight {
            lifecycle: self.clone(),
        };
        self.inner.notifier.notify();

        let call = self.inner.init_calls.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(
            message = "async.cycle.start",
            name = %self.inner.name,
            generation,
            reason,
            call,
            has_handle = self.has_handle(),
        );
        let future = match catch_unwind(AssertUnwindSafe(|| (self.inner.init)(self.clone()))) {
            Ok(future) => future,
            Err(payload) => {
                let message = format!("init panicked: {}", panic_message(payload.as_ref()));
                future::ready(Err(BoxError::from(message))).boxed()
            }
        };
        Some(Cycle {
            generation,
            future,
            flight,
        })
    }

    fn spawn_cycle(&self, reason: &'static str) -> bool {
        if self.is_disposed() {
            return false;
        }
        match self.runtime() {
            Some(runtime) => self.spawn_on(&runtime, reason),
            None => false,
        }
    }

    fn spawn_on(&self, runtime: &Handle, reason: &'static str) -> bool {
        match self.start_cycle(reason) {
            Some(cycle) => {
                runtime.spawn(cycle.run());
                true
            }
            None => false,
        }
    }

    fn finish(&self, generation: u64, outcome: std::result::Result<T, InitFault>) {
        let applied = {
            let _cycles = self.inner.cycles.lock();
            let current = self.inner.generation.load(Ordering::Acquire);
            if self.is_disposed() || current != generation {
                tracing::debug!(
                    message = "async.cycle.stale",
                    name = %self.inner.name,
                    generation,
                    current,
                    disposed = self.is_disposed(),
                );
                false
            } else {
                self.inner.notifier.set_silently(match outcome {
                    Ok(data) => AsyncState::Success(data),
                    Err(error) => AsyncState::Error { error, trace: None },
                });
                true
            }
        };
        if applied {
            tracing::debug!(
                message = "async.cycle.finish",
                name = %self.inner.name,
                generation,
                state = self.inner.notifier.with(AsyncState::name),
            );
            self.inner.notifier.notify();
        }
    }

    /// Start the first guarded cycle when `load_on_init` was `false`.
    ///
    /// Returns `false` if the first cycle already started, the lifecycle is
    /// disposed, or no runtime is available.
    pub fn load(&self) -> bool {
        if self.is_disposed() || self.inner.guard.constructed().is_some() {
            return false;
        }
        let Some(runtime) = self.runtime() else {
            return false;
        };
        if !self.inner.guard.mark_constructed(self.has_handle()) {
            return false;
        }
        self.spawn_on(&runtime, "load")
    }

    /// Start a fresh cycle now, superseding any cycle in flight.
    pub fn reload(&self) -> bool {
        self.spawn_cycle("reload")
    }

    /// Run a fresh cycle inline and return the resulting state.
    ///
    /// Does not need a runtime to spawn on. If another cycle starts before
    /// this one finishes, the returned state is whatever that cycle left.
    pub async fn reload_and_wait(&self) -> AsyncState<T> {
        if let Some(cycle) = self.start_cycle("reload") {
            cycle.run().await;
        }
        self.state()
    }

    /// Start the single handle-triggered cycle if it is due.
    ///
    /// No-op (returns `false`) when disposed, without a handle, when the first
    /// cycle already had a handle, or once the rerun was claimed. While another
    /// cycle is in flight the rerun is queued and starts when it completes.
    pub fn reinitialize_with_handle(&self) -> bool {
        if self.is_disposed() || !self.has_handle() || !self.inner.guard.reinit_due() {
            return false;
        }
        // Resolve the runtime before claiming so a missing runtime does not
        // consume the rerun.
        let Some(runtime) = self.runtime() else {
            return false;
        };
        if !self.inner.guard.try_claim_reinit() {
            return false;
        }
        {
            let mut cycles = self.inner.cycles.lock();
            if cycles.in_flight > 0 {
                cycles.reinit_pending = true;
                tracing::debug!(
                    message = "async.reinit.deferred",
                    name = %self.inner.name,
                    in_flight = cycles.in_flight,
                );
                return true;
            }
        }
        self.spawn_on(&runtime, "reinit")
    }

    /// Resolve once the state is `Success` or `Error` with no cycle in
    /// flight (or the lifecycle is disposed).
    pub async fn wait_settled(&self) -> AsyncState<T> {
        loop {
            let mut notified = pin!(self.inner.settled.notified());
            notified.as_mut().enable();
            if self.is_settled() {
                return self.state();
            }
            notified.await;
        }
    }

    fn is_settled(&self) -> bool {
        if self.is_disposed() {
            return true;
        }
        let cycles = self.inner.cycles.lock();
        cycles.in_flight == 0
            && !cycles.reinit_pending
            && !cycles.reinit_starting
            && self.inner.notifier.with(AsyncState::is_settled)
    }

    fn store(&self, state: AsyncState<T>) {
        self.inner.notifier.set_silently(state);
        self.inner.notifier.notify();
        self.inner.settled.notify_waiters();
    }

    /// Move to `Loading` and notify.
    pub fn loading_state(&self) {
        self.store(AsyncState::Loading);
    }

    /// Move to `Success(data)` and notify.
    pub fn update_state(&self, data: T) {
        self.store(AsyncState::Success(data));
    }

    /// Move to `Error` and notify.
    pub fn error_state(&self, error: impl Into<BoxError>) {
        self.store(AsyncState::error(error));
    }

    pub fn error_state_with_trace(
        &self,
        error: impl Into<BoxError>,
        trace: std::backtrace::Backtrace,
    ) {
        self.store(AsyncState::error_with_trace(error, trace));
    }

    /// Apply `f` to the data if the state is `Success`, then notify.
    ///
    /// Returns whether `f` ran.
    pub fn transform_data_state(&self, f: impl FnOnce(T) -> T) -> bool {
        let applied = self.transform_data_state_silently(f);
        if applied {
            self.inner.notifier.notify();
        }
        applied
    }

    /// Apply `f` to the data if the state is `Success`, without notifying.
    pub fn transform_data_state_silently(&self, f: impl FnOnce(T) -> T) -> bool {
        let Some(data) = self.data() else {
            return false;
        };
        self.inner.notifier.set_silently(AsyncState::Success(f(data)));
        true
    }

    /// Replace the whole state with `f(state)` and notify.
    pub fn transform_state(&self, f: impl FnOnce(AsyncState<T>) -> AsyncState<T>) {
        self.inner.notifier.transform(f);
        self.inner.settled.notify_waiters();
    }

    /// Replace the whole state with `f(state)` without notifying.
    pub fn transform_state_silently(&self, f: impl FnOnce(AsyncState<T>) -> AsyncState<T>) {
        self.inner.notifier.transform_silently(f);
        self.inner.settled.notify_waiters();
    }

    #[must_use]
    pub fn state(&self) -> AsyncState<T> {
        self.inner.notifier.get()
    }

    /// Borrow the current state. `f` must not write to this lifecycle.
    pub fn with_state<R>(&self, f: impl FnOnce(&AsyncState<T>) -> R) -> R {
        self.inner.notifier.with(f)
    }

    #[must_use]
    pub fn data(&self) -> Option<T> {
        self.inner.notifier.with(|s| s.data().cloned())
    }

    #[must_use]
    pub fn error(&self) -> Option<InitFault> {
        self.inner.notifier.with(|s| s.error_value().cloned())
    }

    #[must_use]
    pub fn is_initial(&self) -> bool {
        self.inner.notifier.with(AsyncState::is_initial)
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.inner.notifier.with(AsyncState::is_loading)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.inner.notifier.with(AsyncState::is_success)
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.inner.notifier.with(AsyncState::is_error)
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.notifier.subscribe(callback)
    }

    /// Register a callback that receives the state current at delivery time.
    pub fn subscribe_state(
        &self,
        callback: impl Fn(&AsyncState<T>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.notifier.subscribe_value(callback)
    }

    /// The underlying notifier.
    #[must_use]
    pub fn notifier(&self) -> &Notifier<AsyncState<T>> {
        &self.inner.notifier
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn has_handle(&self) -> bool {
        self.inner.broker.has_handle()
    }

    #[must_use]
    pub fn handle(&self) -> Option<EnvHandle> {
        self.inner.broker.current()
    }

    /// The current handle, or a "handle required" error naming `operation`.
    pub fn require(&self, operation: &str) -> Result<EnvHandle> {
        self.inner.broker.require(operation)
    }

    /// How many times `init` has been called, reloads included.
    #[must_use]
    pub fn init_calls(&self) -> u32 {
        self.inner.init_calls.load(Ordering::Acquire)
    }

    /// Number of cycles started so far; the latest cycle's generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Stop applying completions, release handles and dispose the notifier.
    /// Idempotent.
    pub fn dispose(&self) {
        if self.inner.notifier.is_disposed() {
            return;
        }
        {
            let mut cycles = self.inner.cycles.lock();
            cycles.reinit_pending = false;
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.inner.guard.close();
        self.inner.broker.release();
        self.inner.notifier.dispose();
        self.inner.settled.notify_waiters();
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.notifier.is_disposed()
    }
}

impl<T: Clone + Send + Sync + 'static> Managed for AsyncLifecycle<T> {
    fn dispose(&self) {
        AsyncLifecycle::dispose(self);
    }

    fn is_disposed(&self) -> bool {
        AsyncLifecycle::is_disposed(self)
    }

    fn on_dispose(&self, hook: DisposeHook) {
        self.inner.notifier.on_dispose(hook);
    }
}

impl<T> HandleHost for AsyncLifecycle<T> {
    fn broker(&self) -> &HandleBroker {
        &self.inner.broker
    }
}

impl<T> Listenable for AsyncLifecycle<T> {
    fn listeners(&self) -> &ListenerRegistry {
        self.inner.notifier.listeners()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
