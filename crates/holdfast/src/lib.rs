#![forbid(unsafe_code)]

//! Holdfast public facade crate.
//!
//! This crate provides the stable, ergonomic surface area for users.

pub use holdfast_core as core;
#[cfg(feature = "async")]
pub use holdfast_async as asynchronous;

pub mod prelude {
    pub use holdfast_core::consumer::{attach_handle, detach_handle, subscribe, unsubscribe};
    pub use holdfast_core::{
        Derived, EnvHandle, Error, FaultLog, FaultSink, HandleLease, InstanceRegistry, Lifecycle,
        LifecycleBuilder, Notifier, NotifierConfig, RegistryConfig, Result, Subscription,
    };

    #[cfg(feature = "async")]
    pub use holdfast_async::{AsyncLifecycle, AsyncLifecycleBuilder, AsyncLifecycleConfig, AsyncState};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn prelude_covers_sync_surface() {
        let registry = InstanceRegistry::default();
        let counter = registry.notifier(Some("counter"), || 0u32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let c = counter.clone();
        let sub = subscribe(&counter, move || s.lock().push(c.get()));

        counter.set(1);
        counter.set(1);
        counter.set(2);
        unsubscribe(sub);
        assert_eq!(*seen.lock(), vec![1, 2]);

        assert_eq!(registry.cleanup(), 1);
        assert_eq!(registry.count_total(), 0);
    }
}
