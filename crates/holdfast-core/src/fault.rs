//! Isolated fault reporting.
//!
//! Faults raised by user callbacks (listeners, `init` bodies on the reinit
//! path) never unwind into the code that triggered them. They are converted
//! into [`Fault`] records and handed to a [`FaultSink`] once the triggering
//! operation has finished.
//!
//! Sinks are injected: registries, notifiers and lifecycles each hold an
//! `Arc<dyn FaultSink>`. The default sink logs through `tracing`.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Where an isolated fault came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// A listener panicked during a delivery round.
    Listener,
    /// A user `init` body failed outside of construction.
    Init,
    /// The runtime could not perform a scheduled operation.
    Runtime,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Listener => "listener",
            Self::Init => "init",
            Self::Runtime => "runtime",
        })
    }
}

/// A captured, isolated fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    /// Label of the notifier or lifecycle that observed the fault.
    pub origin: Arc<str>,
    pub message: String,
}

impl Fault {
    #[must_use]
    pub fn new(kind: FaultKind, origin: impl Into<Arc<str>>, message: impl Into<String>) -> Self {
        Self {
            kind,
            origin: origin.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fault in {}: {}", self.kind, self.origin, self.message)
    }
}

/// Destination for isolated faults.
pub trait FaultSink: Send + Sync + 'static {
    fn report(&self, fault: Fault);
}

/// Default sink: logs every fault at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFaultSink;

impl FaultSink for TracingFaultSink {
    fn report(&self, fault: Fault) {
        tracing::error!(
            message = "fault.isolated",
            kind = %fault.kind,
            origin = %fault.origin,
            detail = %fault.message,
        );
    }
}

/// In-memory sink that keeps every reported fault, in report order.
#[derive(Debug, Default)]
pub struct FaultLog {
    faults: Mutex<Vec<Fault>>,
}

impl FaultLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.faults.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faults.lock().is_empty()
    }

    /// Copy of the recorded faults.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Fault> {
        self.faults.lock().clone()
    }

    /// Drain the recorded faults.
    pub fn take(&self) -> Vec<Fault> {
        std::mem::take(&mut *self.faults.lock())
    }
}

impl FaultSink for FaultLog {
    fn report(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }
}

/// The sink used when none is configured.
#[must_use]
pub fn default_sink() -> Arc<dyn FaultSink> {
    Arc::new(TracingFaultSink)
}

/// Best-effort text of a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
