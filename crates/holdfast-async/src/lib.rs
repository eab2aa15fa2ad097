#![forbid(unsafe_code)]

//! Async lifecycles: [`AsyncState`] (initial/loading/success/error) driven by
//! an asynchronous `init` running on tokio, with the same handle-gated rerun
//! protocol as [`holdfast_core::Lifecycle`] and stale-completion discard.

pub mod config;
pub mod lifecycle;
pub mod state;

pub use config::AsyncLifecycleConfig;
pub use lifecycle::{AsyncLifecycle, AsyncLifecycleBuilder, InitFuture};
pub use state::AsyncState;
