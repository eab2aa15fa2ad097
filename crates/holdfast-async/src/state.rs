#![forbid(unsafe_code)]

//! The four-state model held by an async lifecycle.

use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;

use holdfast_core::{BoxError, InitFault};

/// Load state of an [`AsyncLifecycle`](crate::AsyncLifecycle).
///
/// Any state may move to any other; the lifecycle itself only drives
/// `Initial -> Loading -> Success | Error`.
#[derive(Clone)]
pub enum AsyncState<T> {
    /// Nothing has been loaded yet.
    Initial,
    /// An `init` cycle is running.
    Loading,
    Success(T),
    Error {
        error: InitFault,
        trace: Option<Arc<Backtrace>>,
    },
}

impl<T> AsyncState<T> {
    /// Error state without a trace.
    pub fn error(error: impl Into<BoxError>) -> Self {
        Self::Error {
            error: Arc::from(error.into()),
            trace: None,
        }
    }

    pub fn error_with_trace(error: impl Into<BoxError>, trace: Backtrace) -> Self {
        Self::Error {
            error: Arc::from(error.into()),
            trace: Some(Arc::new(trace)),
        }
    }

    #[must_use]
    pub fn is_initial(&self) -> bool {
        matches!(self, Self::Initial)
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// `Success` or `Error`.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.is_success() || self.is_error()
    }

    #[must_use]
    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Success(data) => Some(data),
            _ => None,
        }
    }

    #[must_use]
    pub fn error_value(&self) -> Option<&InitFault> {
        match self {
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    #[must_use]
    pub fn trace(&self) -> Option<&Backtrace> {
        match self {
            Self::Error { trace, .. } => trace.as_deref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_data(self) -> Option<T> {
        match self {
            Self::Success(data) => Some(data),
            _ => None,
        }
    }

    /// Map the `Success` payload, leaving other states untouched.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> AsyncState<U> {
        match self {
            Self::Initial => AsyncState::Initial,
            Self::Loading => AsyncState::Loading,
            Self::Success(data) => AsyncState::Success(f(data)),
            Self::Error { error, trace } => AsyncState::Error { error, trace },
        }
    }

    /// Short state name used in log fields.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Loading => "loading",
            Self::Success(_) => "success",
            Self::Error { .. } => "error",
        }
    }
}

impl<T> Default for AsyncState<T> {
    fn default() -> Self {
        Self::Initial
    }
}

/// Errors compare by identity: two `Error` states are equal only if they
/// share the same fault allocation.
impl<T: PartialEq> PartialEq for AsyncState<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Initial, Self::Initial) | (Self::Loading, Self::Loading) => true,
            (Self::Success(a), Self::Success(b)) => a == b,
            (Self::Error { error: a, .. }, Self::Error { error: b, .. }) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for AsyncState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => f.write_str("Initial"),
            Self::Loading => f.write_str("Loading"),
            Self::Success(data) => f.debug_tuple("Success").field(data).finish(),
            Self::Error { error, trace } => f
                .debug_struct("Error")
                .field("error", &format_args!("{error}"))
                .field("traced", &trace.is_some())
                .finish(),
        }
    }
}
