use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by user-supplied fallible code (`init` bodies).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared, cloneable form of a user fault, stored inside state values.
pub type InitFault = Arc<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("key already registered: {key} ({type_name})")]
    DuplicateKey {
        type_name: &'static str,
        key: String,
    },

    #[error("handle required but unavailable for {operation}")]
    HandleUnavailable { operation: String },

    #[error("init failed for {name}: {source}")]
    Init {
        name: String,
        #[source]
        source: BoxError,
    },
}

impl Error {
    #[must_use]
    pub fn duplicate_key(type_name: &'static str, key: impl Into<String>) -> Self {
        Self::DuplicateKey {
            type_name,
            key: key.into(),
        }
    }

    #[must_use]
    pub fn handle_unavailable(operation: impl Into<String>) -> Self {
        Self::HandleUnavailable {
            operation: operation.into(),
        }
    }

    #[must_use]
    pub fn init(name: impl Into<String>, source: BoxError) -> Self {
        Self::Init {
            name: name.into(),
            source,
        }
    }

    /// Whether this error indicates a registry or handle usage mistake rather
    /// than a fault raised by user code.
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. } | Self::HandleUnavailable { .. })
    }
}

/// A plain-message error, used when a fault only carries text (panic payloads,
/// ad-hoc `error_state` messages).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct MessageError(pub String);

impl MessageError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
