//! The recovery service: an external collaborator (spec §1, §6) invoked
//! fire-and-forget when the executor suspects the debugger session is stuck
//! (a command timed out, or a fault looks like a session-level problem
//! rather than a one-off command error).
//!
//! The core never blocks on this call: a wedged recovery service must not
//! wedge command execution in turn.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[async_trait]
pub trait RecoveryService: Send + Sync {
    /// Diagnostic only; not polled by the executor's hot path.
    async fn is_session_healthy(&self) -> bool;

    /// Invoked fire-and-forget on timeout or a fault heuristically
    /// indicating the debugger session may be wedged.
    async fn recover_stuck_session(&self, reason: &str) -> bool;
}

/// A `RecoveryService` that does nothing and reports the session healthy.
/// The default when no real recovery backend is wired in (e.g. the demo
/// CLI).
pub struct NullRecovery;

#[async_trait]
impl RecoveryService for NullRecovery {
    async fn is_session_healthy(&self) -> bool {
        true
    }

    async fn recover_stuck_session(&self, _reason: &str) -> bool {
        false
    }
}

/// A scriptable `RecoveryService` for tests: records every invocation and
/// its reason, and notifies waiters so async tests can await "recovery was
/// called" without sleeping.
pub struct MockRecovery {
    calls: Mutex<Vec<String>>,
    healthy: std::sync::atomic::AtomicBool,
    count: AtomicU32,
    notify: Notify,
}

impl MockRecovery {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            healthy: std::sync::atomic::AtomicBool::new(true),
            count: AtomicU32::new(0),
            notify: Notify::new(),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Wait until at least one call has been recorded.
    pub async fn wait_for_call(&self) {
        if self.call_count() > 0 {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for MockRecovery {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            healthy: std::sync::atomic::AtomicBool::new(true),
            count: AtomicU32::new(0),
            notify: Notify::new(),
        }
    }
}

#[async_trait]
impl RecoveryService for MockRecovery {
    async fn is_session_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn recover_stuck_session(&self, reason: &str) -> bool {
        self.calls.lock().push(reason.to_string());
        self.count.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        true
    }
}
