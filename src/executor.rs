//! The single-consumer executor: drives one command end-to-end through
//! state transitions, timeout, heartbeat, recovery, cache write, and
//! completion. See spec §4.5.
//!
//! Exactly one [`Executor`] runs per session, as the sole reader of the
//! inbound channel and the sole writer of [`crate::tracker::Tracker::current`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::{CachedResult, ResultCache};
use crate::command::{Command, CommandState};
use crate::config::SessionConfig;
use crate::debugger::{DebuggerDriver, DebuggerFault};
use crate::events::{Event, EventSink, EventState, HeartbeatEvent, StatusEvent};
use crate::recovery::RecoveryService;
use crate::timeout::{classify, heartbeat_text};
use crate::tracker::Tracker;

/// Why the per-command cancellation scope fired, recorded by the watchdog
/// task so the main body can classify the outcome deterministically even if
/// the debugger ignores cancellation and returns its own result late.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    UserCancel,
    Shutdown,
    Timeout,
}

pub struct Executor {
    pub(crate) tracker: Arc<Tracker>,
    pub(crate) cache: Arc<ResultCache>,
    pub(crate) config: Arc<SessionConfig>,
    pub(crate) debugger: Arc<dyn DebuggerDriver>,
    pub(crate) recovery: Arc<dyn RecoveryService>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) shutdown: CancellationToken,
}

impl Executor {
    /// Run the consume loop until the inbound channel is closed and
    /// drained. Each command is handed to the debugger strictly in arrival
    /// order (spec §4.5 ordering guarantees): this loop never starts a
    /// second command before the previous one reaches a terminal state.
    pub async fn run(self, mut inbound: mpsc::Receiver<Arc<Command>>) {
        while let Some(cmd) = inbound.recv().await {
            self.tracker.pop_front_order();
            self.run_command(cmd).await;
        }
        tracing::debug!(session = %self.config.session_id, "executor drained, exiting");
    }

    async fn run_command(&self, cmd: Arc<Command>) {
        // A command already cancelled while queued, or dequeued after
        // shutdown was signalled, never reaches the debugger (spec §4.5
        // step 1; §4.6 disposal drains the backlog this way).
        if cmd.is_cancel_requested() || self.shutdown.is_cancelled() {
            let reason = if self.shutdown.is_cancelled() {
                "Service is shutting down"
            } else {
                "Command was cancelled"
            };
            if self.finish(
                &cmd,
                CommandState::Cancelled,
                reason.to_string(),
                Duration::ZERO,
                EventState::Cancelled,
            ) {
                self.tracker.record_cancelled();
            }
            return;
        }

        self.tracker.set_current(Some(cmd.clone()));
        if !cmd.begin_execution() {
            // Raced with a cancellation that landed between the check above
            // and here; the command is already terminal.
            self.tracker.set_current(None);
            return;
        }
        self.emit_status(&cmd, EventState::Executing, 95, None, None);

        let timeout = classify(&cmd.text, &self.config);
        let started = Instant::now();

        let stop_reason: Arc<Mutex<Option<StopReason>>> = Arc::new(Mutex::new(None));
        let scope = CancellationToken::new();
        let done = CancellationToken::new();

        let watchdog = tokio::spawn(watch(
            cmd.cancel_token(),
            self.shutdown.clone(),
            timeout,
            scope.clone(),
            done.clone(),
            stop_reason.clone(),
        ));

        let heartbeat = tokio::spawn(heartbeat_loop(
            cmd.id.clone(),
            cmd.text.clone(),
            self.config.heartbeat_interval,
            started,
            scope.clone(),
            done.clone(),
            self.events.clone(),
        ));

        let result = self.debugger.execute_command(&cmd.text, scope.clone()).await;
        done.cancel();
        let _ = watchdog.await;
        heartbeat.abort();

        let elapsed = started.elapsed();
        let reason = *stop_reason.lock();
        self.tracker.set_current(None);
        self.finish_command(&cmd, result, reason, elapsed).await;
    }

    async fn finish_command(
        &self,
        cmd: &Arc<Command>,
        result: Result<String, DebuggerFault>,
        reason: Option<StopReason>,
        elapsed: Duration,
    ) {
        match reason {
            Some(StopReason::Timeout) => {
                let text = format!(
                    "Command timed out after {:.1} minutes",
                    elapsed.as_secs_f64() / 60.0
                );
                if self.finish(cmd, CommandState::Failed, text, elapsed, EventState::Failed) {
                    self.tracker.record_failed();
                    self.invoke_recovery(format!(
                        "command '{}' timed out after {:.1} minutes",
                        cmd.text,
                        elapsed.as_secs_f64() / 60.0
                    ));
                }
            }
            Some(StopReason::Shutdown) => {
                let text = "Service is shutting down".to_string();
                if self.finish(cmd, CommandState::Cancelled, text, elapsed, EventState::Cancelled)
                {
                    self.tracker.record_cancelled();
                }
            }
            Some(StopReason::UserCancel) => {
                let text = "Command was cancelled".to_string();
                if self.finish(cmd, CommandState::Cancelled, text, elapsed, EventState::Cancelled)
                {
                    self.tracker.record_cancelled();
                }
            }
            None => match result {
                Ok(output) => {
                    if self.finish(
                        cmd,
                        CommandState::Completed,
                        output,
                        elapsed,
                        EventState::Completed,
                    ) {
                        self.tracker.record_processed();
                    }
                }
                Err(DebuggerFault::Cancelled) => {
                    // The debugger raised cancellation with no watchdog
                    // reason recorded (e.g. it independently noticed the
                    // scope): treat as a user cancel, the most common cause.
                    let text = "Command was cancelled".to_string();
                    if self.finish(
                        cmd,
                        CommandState::Cancelled,
                        text,
                        elapsed,
                        EventState::Cancelled,
                    ) {
                        self.tracker.record_cancelled();
                    }
                }
                Err(DebuggerFault::Other(msg)) => {
                    let text = format!("Command execution failed: {msg}");
                    if self.finish(cmd, CommandState::Failed, text, elapsed, EventState::Failed) {
                        self.tracker.record_failed();
                        if fault_indicates_trouble(&msg) {
                            self.invoke_recovery(format!(
                                "command '{}' failed: {msg}",
                                cmd.text
                            ));
                        }
                    }
                }
            },
        }
    }

    /// Transition `cmd` to its terminal state, fulfill completion, write the
    /// cache entry, and emit the terminal status event. `outcome` is the
    /// success output or the error text depending on `terminal`. Returns
    /// whether this call actually performed the transition: `false` if
    /// something else (e.g. a concurrent `CancelAll`) already completed
    /// `cmd` first, in which case the caller MUST NOT bump stats counters or
    /// invoke recovery for an outcome that didn't win.
    #[must_use]
    fn finish(
        &self,
        cmd: &Arc<Command>,
        terminal: CommandState,
        outcome: String,
        elapsed: Duration,
        event_state: EventState,
    ) -> bool {
        let ok = terminal == CommandState::Completed;
        if !cmd.complete(outcome.clone(), terminal) {
            return false;
        }

        let cached = if ok {
            CachedResult::success(outcome.clone(), elapsed)
        } else {
            CachedResult::failure(outcome.clone(), elapsed)
        };
        self.cache.store(cmd.id.clone(), cached);

        let progress = if ok { 100 } else { 0 };
        if ok {
            self.emit_status(cmd, event_state, progress, Some(outcome), None);
        } else {
            self.emit_status(cmd, event_state, progress, None, Some(outcome));
        }
        true
    }

    fn emit_status(
        &self,
        cmd: &Arc<Command>,
        state: EventState,
        progress: u8,
        result: Option<String>,
        error: Option<String>,
    ) {
        self.events.emit(Event::Status(StatusEvent {
            id: cmd.id.clone(),
            text: cmd.text.clone(),
            state,
            progress,
            result,
            error,
            queue_position: None,
            message: None,
        }));
    }

    /// Fire-and-forget recovery invocation: spawned so a wedged recovery
    /// service can never delay the next command (spec §4.5/§7).
    fn invoke_recovery(&self, reason: String) {
        let recovery = self.recovery.clone();
        tokio::spawn(async move {
            if !recovery.recover_stuck_session(&reason).await {
                tracing::warn!(%reason, "recovery service declined or failed to recover session");
            }
        });
    }
}

/// Race the command's own cancel, the session shutdown signal, and the
/// per-command timeout against `done` (fired once the debugger call
/// returns on its own). Whichever fires first is recorded and used to
/// cancel `scope`, which the debugger call and the heartbeat loop observe.
async fn watch(
    cmd_cancel: CancellationToken,
    shutdown: CancellationToken,
    timeout: Duration,
    scope: CancellationToken,
    done: CancellationToken,
    reason: Arc<Mutex<Option<StopReason>>>,
) {
    tokio::select! {
        () = cmd_cancel.cancelled() => *reason.lock() = Some(StopReason::UserCancel),
        () = shutdown.cancelled() => *reason.lock() = Some(StopReason::Shutdown),
        () = tokio::time::sleep(timeout) => *reason.lock() = Some(StopReason::Timeout),
        () = done.cancelled() => return,
    }
    scope.cancel();
}

/// Emit a progress event every `interval` while the command runs. Permitted
/// to miss a tick right around completion (spec §4.5) — it simply races
/// `scope`/`done` each iteration.
async fn heartbeat_loop(
    id: String,
    text: String,
    interval: Duration,
    started: Instant,
    scope: CancellationToken,
    done: CancellationToken,
    events: Arc<dyn EventSink>,
) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {
                let elapsed = started.elapsed();
                events.emit(Event::Heartbeat(HeartbeatEvent {
                    id: id.clone(),
                    text: text.clone(),
                    elapsed,
                    detail: heartbeat_text(&text, elapsed),
                }));
            }
            () = scope.cancelled() => break,
            () = done.cancelled() => break,
        }
    }
}

/// Whether an "Other fault" message heuristically indicates the debugger
/// session itself may be wedged, per spec §4.5 step 5.
fn fault_indicates_trouble(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("debugger")
        || lower.contains("session")
        || lower.contains("invalid operation")
        || lower.contains("timeout")
}
