//! Construction options for async lifecycles.

use std::fmt;
use std::sync::Arc;

use holdfast_core::{FaultSink, default_sink};
use tokio::runtime::Handle;

/// Options shared by every [`AsyncLifecycle`](crate::AsyncLifecycle) built
/// from the same builder.
#[derive(Clone)]
pub struct AsyncLifecycleConfig {
    /// Label used in logs and faults. Defaults to `async<TypeName>`.
    pub name: Option<Arc<str>>,
    /// Start the first `init` cycle during construction.
    pub load_on_init: bool,
    pub fault_sink: Arc<dyn FaultSink>,
    /// Runtime that `init` cycles are spawned on. `None` means the runtime
    /// current at spawn time.
    pub runtime: Option<Handle>,
}

impl Default for AsyncLifecycleConfig {
    fn default() -> Self {
        Self {
            name: None,
            load_on_init: true,
            fault_sink: default_sink(),
            runtime: None,
        }
    }
}

impl AsyncLifecycleConfig {
    #[must_use]
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn load_on_init(mut self, load_on_init: bool) -> Self {
        self.load_on_init = load_on_init;
        self
    }

    #[must_use]
    pub fn fault_sink(mut self, sink: Arc<dyn FaultSink>) -> Self {
        self.fault_sink = sink;
        self
    }

    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

impl fmt::Debug for AsyncLifecycleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLifecycleConfig")
            .field("name", &self.name)
            .field("load_on_init", &self.load_on_init)
            .field("runtime", &self.runtime.is_some())
            .finish_non_exhaustive()
    }
}
