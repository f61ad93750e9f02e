//! Error types for Flowguard setup and store access.
//!
//! Errors on the guarded-call path live next to the code that raises them:
//! [`crate::ratelimit::ParameterResolutionError`], [`crate::store::StoreError`]
//! and [`crate::guard::GuardError`].

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Flowguard operations outside a guarded call.
#[derive(Error, Debug)]
pub enum FlowguardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate declaration no budget can be built from
    #[error("Invalid rate spec: {0}")]
    InvalidSpec(String),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<config::ConfigError> for FlowguardError {
    fn from(err: config::ConfigError) -> Self {
        FlowguardError::Config(err.to_string())
    }
}

/// Result type alias for Flowguard operations.
pub type Result<T> = std::result::Result<T, FlowguardError>;
