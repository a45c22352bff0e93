//! Internal error types.
//!
//! The public [`crate::queue::QueueService`] facade surfaces most failures as
//! plain strings (see module docs there) because that is the boundary
//! contract the debugger-command lifecycle asks for: callers (and, one layer
//! up, an external protocol frontend) want a message, not a typed exception.
//! Internally though, components like the cache and config validation use a
//! real error enum so call sites can match on cause instead of parsing text.

use thiserror::Error;

/// Errors raised by [`crate::queue::QueueService`] operations before a
/// command reaches the executor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue service has been disposed")]
    Disposed,

    #[error("Command not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("id conflict: {0}")]
    IdConflict(String),
}

/// Errors raised while validating a [`crate::config::SessionConfig`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("session_id must not be empty")]
    EmptySessionId,

    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("shutdown_timeout ({shutdown:?}) must be greater than force_shutdown_timeout ({force:?})")]
    ShutdownOrdering {
        shutdown: std::time::Duration,
        force: std::time::Duration,
    },

    #[error("cache_pressure must be within [0.1, 1.0], got {0}")]
    PressureOutOfRange(f64),
}
