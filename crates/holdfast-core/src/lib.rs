#![forbid(unsafe_code)]

//! Core: observable value holders, the instance registry, environment
//! handles, and handle-gated synchronous lifecycles.
//!
//! - [`Notifier`]: a shared value that notifies listeners on change.
//! - [`InstanceRegistry`]: keyed, per-type instance reuse and bulk cleanup.
//! - [`HandleBroker`] / [`EnvHandle`]: attachment tracking for the handle a
//!   holder needs for environment-dependent work.
//! - [`Lifecycle`]: a notifier whose `init` reruns once when a handle first
//!   becomes available.
//! - [`consumer`]: free functions UI code uses against any holder.

pub mod consumer;
pub mod derived;
pub mod error;
pub mod fault;
pub mod guard;
pub mod handle;
pub mod lifecycle;
pub mod listener;
pub mod notifier;
pub mod registry;

pub use derived::Derived;
pub use error::{BoxError, Error, InitFault, MessageError, Result};
pub use fault::{Fault, FaultKind, FaultLog, FaultSink, TracingFaultSink, default_sink};
pub use guard::{InitGuard, InitMode};
pub use handle::{EnvHandle, HandleBroker, HandleEvent, HandleHost, HandleId, HandleLease};
pub use lifecycle::{Lifecycle, LifecycleBuilder};
pub use listener::{Listenable, Listener, ListenerId, ListenerRegistry, Subscription};
pub use notifier::{DisposeHook, Notifier, NotifierConfig};
pub use registry::{InstanceId, InstanceRegistry, Managed, RegistryConfig};
