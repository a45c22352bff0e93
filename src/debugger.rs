//! The debugger subprocess driver: an external collaborator (spec §1, §6).
//!
//! The core only ever sees [`DebuggerDriver`]. The real native debugger (a
//! long-running process that reads one textual command at a time) lives
//! entirely outside this crate's scope; what's here is the trait the
//! executor depends on, a scriptable [`MockDebugger`] for tests, and
//! [`ShellDebugger`] — a minimal demo backend for the CLI in `main.rs` that
//! shells out per command the way the teacher's `process::run` does
//! (`src/process.rs`), standing in for a real debugger session since this
//! crate has nothing interactive to drive.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Why [`DebuggerDriver::execute_command`] failed.
#[derive(Debug, Clone)]
pub enum DebuggerFault {
    /// The supplied cancellation scope fired before the debugger returned.
    Cancelled,
    /// Any other execution fault, carrying a human-readable message.
    Other(String),
}

/// Single-owner driver for one debugger subprocess. The executor is the
/// only caller; external callers MUST NOT invoke this directly (spec §5).
#[async_trait]
pub trait DebuggerDriver: Send + Sync {
    /// Execute `text` against the debugger, returning its textual output.
    /// `cancel` may fire while this is in flight (user cancel, timeout, or
    /// shutdown) — implementations should race it cooperatively and return
    /// [`DebuggerFault::Cancelled`] if it wins, but are not required to: the
    /// executor always records a timeout/cancel outcome itself even if the
    /// debugger ignores the signal.
    async fn execute_command(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<String, DebuggerFault>;

    /// Best-effort interruption of whatever is currently running. Idempotent.
    async fn cancel_current_operation(&self);

    /// Diagnostic only.
    fn is_active(&self) -> bool;
}

// ---------------------------------------------------------------------------
// MockDebugger — scriptable test double
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum ScriptedResponse {
    Output { text: String, delay: Duration },
    Hang,
    Fault(String),
}

struct MockInner {
    scripted: Mutex<HashMap<String, ScriptedResponse>>,
    default: Mutex<ScriptedResponse>,
    active: AtomicBool,
    cancel_calls: AtomicU32,
}

/// A scriptable [`DebuggerDriver`] for tests. Exact-match `text` against a
/// scripted response; falls back to the configured default (plain echo with
/// no delay unless overridden).
#[derive(Clone)]
pub struct MockDebugger {
    inner: Arc<MockInner>,
}

impl MockDebugger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                scripted: Mutex::new(HashMap::new()),
                default: Mutex::new(ScriptedResponse::Output {
                    text: String::new(),
                    delay: Duration::ZERO,
                }),
                active: AtomicBool::new(false),
                cancel_calls: AtomicU32::new(0),
            }),
        }
    }

    /// Script an exact-match successful response, returned after `delay`.
    pub fn with_response(self, text: &str, output: &str, delay: Duration) -> Self {
        self.inner.scripted.lock().insert(
            text.to_string(),
            ScriptedResponse::Output {
                text: output.to_string(),
                delay,
            },
        );
        self
    }

    /// Script an exact-match command that never returns on its own (the
    /// executor's timeout must kick it, or a cancellation scope must fire).
    pub fn with_hang(self, text: &str) -> Self {
        self.inner
            .scripted
            .lock()
            .insert(text.to_string(), ScriptedResponse::Hang);
        self
    }

    /// Script an exact-match command that raises a non-cancellation fault.
    pub fn with_fault(self, text: &str, message: &str) -> Self {
        self.inner
            .scripted
            .lock()
            .insert(text.to_string(), ScriptedResponse::Fault(message.to_string()));
        self
    }

    #[must_use]
    pub fn cancel_call_count(&self) -> u32 {
        self.inner.cancel_calls.load(Ordering::Relaxed)
    }
}

impl Default for MockDebugger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DebuggerDriver for MockDebugger {
    async fn execute_command(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<String, DebuggerFault> {
        self.inner.active.store(true, Ordering::SeqCst);
        let response = self
            .inner
            .scripted
            .lock()
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.inner.default.lock().clone());

        let result = match response {
            ScriptedResponse::Output { text: out, delay } => {
                if delay.is_zero() {
                    Ok(out)
                } else {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => Ok(out),
                        () = cancel.cancelled() => Err(DebuggerFault::Cancelled),
                    }
                }
            }
            ScriptedResponse::Hang => {
                cancel.cancelled().await;
                Err(DebuggerFault::Cancelled)
            }
            ScriptedResponse::Fault(msg) => Err(DebuggerFault::Other(msg)),
        };

        self.inner.active.store(false, Ordering::SeqCst);
        result
    }

    async fn cancel_current_operation(&self) {
        self.inner.cancel_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// ShellDebugger — demo backend for the CLI
// ---------------------------------------------------------------------------

/// Spawns `/bin/sh -c <command>` per call. Not a faithful debugger model (a
/// real one keeps state across commands); it exists only so the demo CLI in
/// `main.rs` has something real to drive end-to-end.
pub struct ShellDebugger {
    last_pid: AtomicU32,
    active: AtomicBool,
}

impl ShellDebugger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_pid: AtomicU32::new(0),
            active: AtomicBool::new(false),
        }
    }
}

impl Default for ShellDebugger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DebuggerDriver for ShellDebugger {
    async fn execute_command(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<String, DebuggerFault> {
        self.active.store(true, Ordering::SeqCst);

        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c").arg(text);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(DebuggerFault::Other(format!("failed to spawn shell: {e}")));
            }
        };
        if let Some(pid) = child.id() {
            self.last_pid.store(pid, Ordering::SeqCst);
        }

        let output = tokio::select! {
            result = child.wait_with_output() => {
                match result {
                    Ok(out) => {
                        let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                        text.push_str(&String::from_utf8_lossy(&out.stderr));
                        Ok(text)
                    }
                    Err(e) => Err(DebuggerFault::Other(format!("wait failed: {e}"))),
                }
            }
            () = cancel.cancelled() => Err(DebuggerFault::Cancelled),
        };

        self.active.store(false, Ordering::SeqCst);
        output
    }

    async fn cancel_current_operation(&self) {
        let pid = self.last_pid.load(Ordering::SeqCst);
        if pid != 0 {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
