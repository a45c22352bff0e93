//! Per-session configuration.
//!
//! One [`SessionConfig`] is built per debugger session and shared (read-only)
//! by the tracker, cache, timeout policy, and executor. Defaults below are
//! not arbitrary: they keep the relative ordering of the four timeout tiers
//! the way a windbg-class debugger actually behaves (a `k` stack walk is
//! cheap; `!analyze -v` is not).

use crate::error::ConfigError;
use std::time::Duration;

/// Immutable, per-session configuration. Construct with [`SessionConfig::new`]
/// or via [`Default`] + field updates, then call [`SessionConfig::validate`]
/// before handing it to a [`crate::queue::QueueService`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: String,

    pub default_timeout: Duration,
    pub complex_timeout: Duration,
    pub long_running_timeout: Duration,
    pub simple_timeout: Duration,

    pub heartbeat_interval: Duration,

    pub shutdown_timeout: Duration,
    pub force_shutdown_timeout: Duration,

    pub cleanup_interval: Duration,
    pub retention: Duration,

    pub cache_max_bytes: usize,
    pub cache_max_entries: usize,
    pub cache_pressure: f64,

    pub stats_log_interval: Duration,
}

impl SessionConfig {
    /// Build a config for `session_id` with the teacher-grounded defaults,
    /// i.e. everything but the id.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// Check every invariant spec.md §3 states. Called once at session
    /// construction; a failed session never starts its executor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_id.is_empty() {
            return Err(ConfigError::EmptySessionId);
        }
        for (field, d) in [
            ("default_timeout", self.default_timeout),
            ("complex_timeout", self.complex_timeout),
            ("long_running_timeout", self.long_running_timeout),
            ("simple_timeout", self.simple_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("shutdown_timeout", self.shutdown_timeout),
            ("force_shutdown_timeout", self.force_shutdown_timeout),
            ("cleanup_interval", self.cleanup_interval),
            ("retention", self.retention),
            ("stats_log_interval", self.stats_log_interval),
        ] {
            if d.is_zero() {
                return Err(ConfigError::NotPositive { field });
            }
        }
        if self.shutdown_timeout <= self.force_shutdown_timeout {
            return Err(ConfigError::ShutdownOrdering {
                shutdown: self.shutdown_timeout,
                force: self.force_shutdown_timeout,
            });
        }
        if !(0.1..=1.0).contains(&self.cache_pressure) {
            return Err(ConfigError::PressureOutOfRange(self.cache_pressure));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            simple_timeout: Duration::from_secs(15),
            default_timeout: Duration::from_secs(300),
            complex_timeout: Duration::from_secs(600),
            long_running_timeout: Duration::from_secs(1800),
            heartbeat_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            force_shutdown_timeout: Duration::from_secs(3),
            cleanup_interval: Duration::from_secs(300),
            retention: Duration::from_secs(30 * 60),
            cache_max_bytes: 16 * 1024 * 1024,
            cache_max_entries: 2000,
            cache_pressure: 0.9,
            stats_log_interval: Duration::from_secs(60),
        }
    }
}
