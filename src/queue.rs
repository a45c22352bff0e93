//! Per-session façade: submit, poll, cancel, list, dispose. Owns the
//! tracker, cache, and inbound channel, and spawns the executor plus the
//! retention/stats background tasks. See spec §4.6.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::command::{Command, CommandState};
use crate::config::SessionConfig;
use crate::debugger::DebuggerDriver;
use crate::error::QueueError;
use crate::events::{Event, EventSink, EventState, QueueEvent, StatusEvent};
use crate::executor::Executor;
use crate::recovery::RecoveryService;
use crate::timeout::classify;
use crate::tracker::{ListEntry, Tracker};

/// Capacity of the inbound channel. Producers block (honouring shutdown)
/// once this many commands are queued ahead of the executor; spec.md
/// doesn't size this, so we pick a generous bound well above any realistic
/// interactive-debugger backlog.
const INBOUND_CAPACITY: usize = 1024;

/// Rich point-in-time view of one command, returned by [`QueueService::info`].
#[derive(Debug, Clone)]
pub struct CommandInfo {
    pub id: String,
    pub text: String,
    pub state: CommandState,
    pub queued_at: Instant,
    pub elapsed: Duration,
    pub remaining: Duration,
    pub queue_position: i64,
    pub is_complete: bool,
    /// Composed human-readable status, per spec §6. Populated for queued
    /// commands; `None` for current/terminal ones (callers read `state`).
    pub status_message: Option<String>,
}

/// Per-session command execution façade.
pub struct QueueService {
    config: Arc<SessionConfig>,
    tracker: Arc<Tracker>,
    cache: Arc<ResultCache>,
    debugger: Arc<dyn DebuggerDriver>,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
    /// `None` once [`QueueService::dispose`] has closed the channel to
    /// producers; submitters see this as `Disposed` rather than hanging.
    inbound_tx: Mutex<Option<mpsc::Sender<Arc<Command>>>>,
    /// Single-consumer receivers for commands not yet awaited. Taken out
    /// (and consumed) by the first `await_result` call for an id; later
    /// calls fall back to the result cache.
    pending: Mutex<HashMap<String, oneshot::Receiver<String>>>,
    executor_handle: SyncMutex<Option<JoinHandle<()>>>,
    retention_handle: SyncMutex<Option<JoinHandle<()>>>,
    stats_handle: SyncMutex<Option<JoinHandle<()>>>,
}

impl QueueService {
    /// Validate `config`, wire the executor and background tasks, and
    /// return a ready-to-use service. Fails only if `config` itself is
    /// invalid; never fails on account of the debugger/recovery/event
    /// backends, which are trusted trait objects.
    pub fn new(
        config: SessionConfig,
        debugger: Arc<dyn DebuggerDriver>,
        recovery: Arc<dyn RecoveryService>,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>, crate::error::ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let tracker = Arc::new(Tracker::new());
        let cache = Arc::new(ResultCache::new(
            config.cache_max_bytes,
            config.cache_max_entries,
            config.cache_pressure,
        ));
        let shutdown = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let executor = Executor {
            tracker: tracker.clone(),
            cache: cache.clone(),
            config: config.clone(),
            debugger: debugger.clone(),
            recovery,
            events: events.clone(),
            shutdown: shutdown.clone(),
        };
        let executor_handle = tokio::spawn(executor.run(inbound_rx));

        let retention_handle = {
            let tracker = tracker.clone();
            let shutdown = shutdown.clone();
            let interval = config.cleanup_interval;
            let retention = config.retention;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(interval) => {
                            tracker.sweep_expired(retention);
                        }
                        () = shutdown.cancelled() => break,
                    }
                }
            })
        };

        let stats_handle = {
            let tracker = tracker.clone();
            let cache = cache.clone();
            let shutdown = shutdown.clone();
            let interval = config.stats_log_interval;
            let session_id = config.session_id.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(interval) => {
                            let (processed, failed, cancelled) = tracker.stats();
                            let cache_stats = cache.stats();
                            tracing::info!(
                                session = %session_id,
                                processed, failed, cancelled,
                                cache_entries = cache_stats.entries,
                                cache_bytes = cache_stats.bytes,
                                cache_usage_pct = cache_stats.usage_pct,
                                "session stats",
                            );
                        }
                        () = shutdown.cancelled() => break,
                    }
                }
            })
        };

        Ok(Arc::new(Self {
            config,
            tracker,
            cache,
            debugger,
            events,
            shutdown,
            disposed: AtomicBool::new(false),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            pending: Mutex::new(HashMap::new()),
            executor_handle: SyncMutex::new(Some(executor_handle)),
            retention_handle: SyncMutex::new(Some(retention_handle)),
            stats_handle: SyncMutex::new(Some(stats_handle)),
        }))
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Submit `text` for execution, returning its fresh id. Errors:
    /// `Disposed` after [`QueueService::dispose`], `InvalidArgument` for
    /// empty/whitespace text (spec §4.6, §8 boundary behaviour).
    pub async fn submit(&self, text: &str) -> Result<String, QueueError> {
        if self.is_disposed() {
            return Err(QueueError::Disposed);
        }
        if text.trim().is_empty() {
            return Err(QueueError::InvalidArgument(
                "command text must not be empty or whitespace".to_string(),
            ));
        }

        let tx = self.inbound_tx.lock().await.clone();
        let Some(tx) = tx else {
            return Err(QueueError::Disposed);
        };

        let n = self.tracker.next_submission_index();
        let id = format!("cmd-{}-{:04}", self.config.session_id, n);

        let (cmd, rx) = Command::new(id.clone(), text.to_string(), Instant::now());
        let cmd = Arc::new(cmd);
        if !self.tracker.add(cmd.clone()) {
            return Err(QueueError::IdConflict(id));
        }
        self.pending.lock().await.insert(id.clone(), rx);

        let position = self.tracker.queue_position(&id).max(0);
        self.events.emit(Event::Status(StatusEvent {
            id: id.clone(),
            text: text.to_string(),
            state: EventState::Queued,
            progress: queued_progress(position, Duration::ZERO),
            result: None,
            error: None,
            queue_position: Some(position),
            message: None,
        }));

        if tx.send(cmd).await.is_err() {
            // The executor has already shut down; surface this the same as
            // a disposed service rather than hanging the caller.
            return Err(QueueError::Disposed);
        }
        Ok(id)
    }

    /// Block until `id` reaches a terminal state and return its outcome
    /// string (debugger output on success, the error text otherwise). This
    /// deployment picks the "block on the completion signal" branch of the
    /// spec §4.6 open question, not the polling-string branch.
    ///
    /// Safe to call more than once (concurrently or sequentially, e.g. a
    /// caller retrying after its own timeout) for the same id: only the
    /// first call consumes the per-command oneshot, but every call can
    /// still observe the command's terminal outcome via
    /// [`crate::command::Command::wait_terminal`] as long as the tracker
    /// hasn't swept it yet.
    pub async fn await_result(&self, id: &str) -> Result<String, QueueError> {
        if self.is_disposed() && self.tracker.get(id).is_none() && !self.cache.has(id) {
            return Err(QueueError::Disposed);
        }
        if let Some(result) = self.cache.get(id) {
            return Ok(outcome_string(result));
        }

        let rx = self.pending.lock().await.remove(id);
        if let Some(rx) = rx {
            if let Ok(outcome) = rx.await {
                return Ok(outcome);
            }
            // The sender was dropped without sending, which `Command` never
            // does on its own; fall through to the tracker/cache lookup
            // below just in case.
        }
        self.lookup_terminal_or_not_found(id).await
    }

    async fn lookup_terminal_or_not_found(&self, id: &str) -> Result<String, QueueError> {
        if let Some(cmd) = self.tracker.get(id) {
            cmd.wait_terminal().await;
            if let Some(outcome) = cmd.completed_result() {
                return Ok(outcome);
            }
        }
        if let Some(result) = self.cache.get(id) {
            return Ok(outcome_string(result));
        }
        Err(QueueError::NotFound(format!("Command not found: {id}")))
    }

    /// Current lifecycle state, or `None` if `id` is unknown (spec §4.6).
    pub fn state(&self, id: &str) -> Result<Option<CommandState>, QueueError> {
        if self.is_disposed() {
            return Err(QueueError::Disposed);
        }
        Ok(self.tracker.state(id))
    }

    /// Rich status view composed from the tracker (spec §4.6, §6).
    pub fn info(&self, id: &str) -> Result<Option<CommandInfo>, QueueError> {
        if self.is_disposed() {
            return Err(QueueError::Disposed);
        }
        let Some(cmd) = self.tracker.get(id) else {
            return Ok(None);
        };
        let state = cmd.state();
        let elapsed = cmd.queued_at.elapsed();
        let queue_position = self.tracker.queue_position(id);

        let remaining = match (state, cmd.execution_started_at()) {
            (CommandState::Executing, Some(started)) => {
                let timeout = classify(&cmd.text, &self.config);
                timeout.saturating_sub(started.elapsed())
            }
            _ => Duration::ZERO,
        };

        let status_message = if state == CommandState::Queued && queue_position >= 1 {
            Some(queued_status_string(queue_position, elapsed))
        } else {
            None
        };

        Ok(Some(CommandInfo {
            id: cmd.id.clone(),
            text: cmd.text.clone(),
            state,
            queued_at: cmd.queued_at,
            elapsed,
            remaining,
            queue_position,
            is_complete: state.is_terminal(),
            status_message,
        }))
    }

    /// Cancel `id`. Returns `false` for unknown ids, `true` (idempotently)
    /// for already-terminal ones, and otherwise trips the command's cancel
    /// handle — calling the debugger's best-effort interrupt if it is
    /// currently executing (spec §4.5 cancellation semantics). Never fails
    /// post-disposal.
    pub async fn cancel(&self, id: &str) -> bool {
        let Some(cmd) = self.tracker.get(id) else {
            return false;
        };
        if cmd.state().is_terminal() {
            return true;
        }
        let was_current = self
            .tracker
            .current()
            .is_some_and(|cur| cur.id == cmd.id);
        cmd.request_cancel();
        if was_current {
            self.debugger.cancel_current_operation().await;
        }
        true
    }

    /// Trip every non-terminal command's cancel, transition each to
    /// `Cancelled`, and call the debugger's interrupt once. Returns the
    /// count actually cancelled; `0` post-disposal (spec §4.5/§4.6).
    pub async fn cancel_all(&self, reason: Option<&str>) -> usize {
        if self.is_disposed() {
            return 0;
        }
        self.cancel_all_inner(reason.unwrap_or("Cancelled by request")).await
    }

    async fn cancel_all_inner(&self, reason: &str) -> usize {
        let cancelled = self.tracker.cancel_all_collect(reason);
        if !cancelled.is_empty() {
            self.debugger.cancel_current_operation().await;
        }
        for cmd in &cancelled {
            self.cache.store(
                cmd.id.clone(),
                crate::cache::CachedResult::failure(reason.to_string(), cmd.queued_at.elapsed()),
            );
            self.events.emit(Event::Status(StatusEvent {
                id: cmd.id.clone(),
                text: cmd.text.clone(),
                state: EventState::Cancelled,
                progress: 0,
                result: None,
                error: Some(reason.to_string()),
                queue_position: None,
                message: None,
            }));
        }
        cancelled.len()
    }

    /// Snapshot of currently-tracked commands, current-first then queued
    /// then other non-terminal then terminal (spec §4.2). Empty
    /// post-disposal.
    #[must_use]
    pub fn list(&self) -> Vec<ListEntry> {
        if self.is_disposed() {
            return Vec::new();
        }
        self.tracker.list()
    }

    /// The currently-executing command, if any. `None` post-disposal.
    #[must_use]
    pub fn current(&self) -> Option<Arc<Command>> {
        if self.is_disposed() {
            return None;
        }
        self.tracker.current()
    }

    /// `(processed, failed, cancelled)` lifetime counters.
    #[must_use]
    pub fn stats(&self) -> (u64, u64, u64) {
        self.tracker.stats()
    }

    /// Gracefully shut down: signal shutdown, stop accepting submissions,
    /// give the executor `shutdown_timeout` to drain naturally, force
    /// cancel anything left and give it `force_shutdown_timeout` more, then
    /// unconditionally cancel-all and tear down background tasks. Idempotent
    /// (spec §4.6).
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        // Drop the sender: once every already-queued command drains, the
        // executor's `recv()` observes a closed channel and its run loop
        // returns, rather than blocking forever on new submissions that
        // will never arrive.
        self.inbound_tx.lock().await.take();

        let executor_handle = self.executor_handle.lock().take();
        if let Some(handle) = executor_handle {
            if tokio::time::timeout(self.config.shutdown_timeout, handle)
                .await
                .is_err()
            {
                tracing::warn!(
                    session = %self.config.session_id,
                    "executor did not drain within shutdown_timeout, forcing cancellation",
                );
                self.cancel_all_inner("Service disposed").await;
                // Give any in-flight debugger call a further grace period
                // to unwind in response to the forced cancellation above.
                tokio::time::sleep(self.config.force_shutdown_timeout).await;
            }
        }

        self.cancel_all_inner("Service disposed").await;

        if let Some(handle) = self.retention_handle.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.stats_handle.lock().take() {
            handle.abort();
        }
        self.cache.clear();

        self.events.emit(Event::Queue(QueueEvent {
            kind: "shutdown".to_string(),
            message: format!("session {} disposed", self.config.session_id),
            payload: None,
        }));
    }
}

/// Render a cached terminal result as the plain outcome string
/// `await_result` hands back: the debugger output on success, the error
/// text otherwise.
fn outcome_string(result: crate::cache::CachedResult) -> String {
    if result.ok {
        result.output
    } else {
        result.error.unwrap_or_default()
    }
}

/// `"Next in queue"` / `"2nd in queue"` / `"3rd in queue"` / `"<k>th in
/// queue"`, an elapsed suffix, and an ETA suffix, per spec §6.
fn queued_status_string(position: i64, elapsed: Duration) -> String {
    let base = match position {
        1 => "Next in queue".to_string(),
        2 => "2nd in queue".to_string(),
        3 => "3rd in queue".to_string(),
        k => format!("{k}th in queue"),
    };
    let mins = elapsed.as_secs() / 60;
    let secs = elapsed.as_secs() % 60;
    let rem_min = std::cmp::max(3, position * 2);
    let rem_sec = std::cmp::max(5, position * 10);
    format!(
        "{base} (waited {mins}m {secs}s) - Check again in {rem_min}-{rem_sec} seconds"
    )
}

/// `clamp(baseProgress + timeBonus, 5, 90)` per spec §6.
fn queued_progress(position: i64, elapsed: Duration) -> u8 {
    let base_progress = std::cmp::max(5, 100 - position * 15);
    let elapsed_min = elapsed.as_secs_f64() / 60.0;
    let time_bonus = std::cmp::min(10, (elapsed_min * 2.0).floor() as i64);
    (base_progress + time_bonus).clamp(5, 90) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::MockDebugger;
    use crate::events::NullEventSink;
    use crate::recovery::MockRecovery;
    use std::time::Duration as StdDuration;

    fn service(config: SessionConfig, debugger: Arc<dyn DebuggerDriver>) -> Arc<QueueService> {
        QueueService::new(
            config,
            debugger,
            Arc::new(MockRecovery::default()),
            Arc::new(NullEventSink),
        )
        .expect("valid config")
    }

    fn fast_cfg() -> SessionConfig {
        let mut c = SessionConfig::new("s1");
        c.heartbeat_interval = StdDuration::from_millis(20);
        c.shutdown_timeout = StdDuration::from_millis(200);
        c.force_shutdown_timeout = StdDuration::from_millis(50);
        c.cleanup_interval = StdDuration::from_secs(3600);
        c.stats_log_interval = StdDuration::from_secs(3600);
        c
    }

    #[tokio::test]
    async fn happy_path_submit_and_await() {
        let dbg = MockDebugger::new().with_response("k", "stack-dump", StdDuration::from_millis(10));
        let svc = service(fast_cfg(), Arc::new(dbg));

        let id = svc.submit("k").await.unwrap();
        assert!(id.starts_with("cmd-s1-"));
        let out = svc.await_result(&id).await.unwrap();
        assert_eq!(out, "stack-dump");
        assert_eq!(svc.state(&id).unwrap(), Some(CommandState::Completed));
        assert_eq!(svc.stats().0, 1);

        svc.dispose().await;
    }

    #[tokio::test]
    async fn empty_text_is_rejected() {
        let svc = service(fast_cfg(), Arc::new(MockDebugger::new()));
        let err = svc.submit("   ").await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));
        svc.dispose().await;
    }

    #[tokio::test]
    async fn unknown_id_operations() {
        let svc = service(fast_cfg(), Arc::new(MockDebugger::new()));
        assert!(!svc.cancel("nope").await);
        let err = svc.await_result("nope").await.unwrap_err();
        assert_eq!(err, QueueError::NotFound("Command not found: nope".into()));
        svc.dispose().await;
    }

    #[tokio::test]
    async fn queued_cancellation_never_reaches_debugger() {
        let dbg = MockDebugger::new().with_response("!analyze -v", "analysis-done", StdDuration::from_millis(300));
        let svc = service(fast_cfg(), Arc::new(dbg));

        let a = svc.submit("!analyze -v").await.unwrap();
        let b = svc.submit("lm").await.unwrap();
        // Give the executor a moment to pick up `a` so `b` is still queued.
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(svc.cancel(&b).await);

        assert_eq!(svc.await_result(&b).await.unwrap(), "Command was cancelled");
        assert_eq!(svc.await_result(&a).await.unwrap(), "analysis-done");
        assert_eq!(svc.stats().2, 1);

        svc.dispose().await;
    }

    #[tokio::test]
    async fn dispose_cancels_queued_commands_and_is_idempotent() {
        let dbg = MockDebugger::new().with_response("!analyze -v", "slow", StdDuration::from_millis(200));
        let svc = service(fast_cfg(), Arc::new(dbg));

        let a = svc.submit("!analyze -v").await.unwrap();
        let b = svc.submit("k").await.unwrap();
        let c = svc.submit("lm").await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(5)).await;

        svc.dispose().await;
        svc.dispose().await; // idempotent

        for id in [&a, &b, &c] {
            let state = svc.tracker.state(id);
            assert!(state.map(|s| s.is_terminal()).unwrap_or(true), "{id} not terminal");
        }

        let err = svc.submit("k").await.unwrap_err();
        assert_eq!(err, QueueError::Disposed);
        assert_eq!(svc.cancel_all(None).await, 0);
        assert!(svc.list().is_empty());
        assert!(svc.current().is_none());
    }

    #[tokio::test]
    async fn info_reports_queue_position_and_status_string() {
        let dbg = MockDebugger::new().with_response("!analyze -v", "slow", StdDuration::from_millis(200));
        let svc = service(fast_cfg(), Arc::new(dbg));

        let _c1 = svc.submit("!analyze -v").await.unwrap();
        let _c2 = svc.submit("k").await.unwrap();
        let _c3 = svc.submit("k").await.unwrap();
        let c4 = svc.submit("k").await.unwrap();
        let _c5 = svc.submit("k").await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let info = svc.info(&c4).await_info();
        assert_eq!(info.queue_position, 3);
        assert_eq!(info.state, CommandState::Queued);
        assert!(info.elapsed > StdDuration::ZERO);
        assert_eq!(info.remaining, StdDuration::ZERO);
        assert!(!info.is_complete);
        let msg = info.status_message.unwrap();
        assert!(msg.starts_with("3rd in queue"), "{msg}");
        assert!(msg.contains("Check again in 6-30 seconds"), "{msg}");

        svc.dispose().await;
    }

    trait InfoResultExt {
        fn await_info(self) -> CommandInfo;
    }
    impl InfoResultExt for Result<Option<CommandInfo>, QueueError> {
        fn await_info(self) -> CommandInfo {
            self.unwrap().expect("command known")
        }
    }

    #[tokio::test]
    async fn cancel_all_racing_the_executing_command_does_not_double_count() {
        // `cancel_all` transitions the currently-executing command to
        // `Cancelled` directly (spec §4.5), which can race the executor's
        // own `finish_command` for that same command once it observes the
        // tripped cancel token. Whichever wins must be the only one to bump
        // `cancelled`.
        let dbg = MockDebugger::new().with_hang("!heap");
        let svc = service(fast_cfg(), Arc::new(dbg));

        let id = svc.submit("!heap").await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(svc.tracker.state(&id), Some(CommandState::Executing));

        let cancelled = svc.cancel_all(Some("shutting down")).await;
        assert_eq!(cancelled, 1);

        let outcome = svc.await_result(&id).await.unwrap();
        assert_eq!(outcome, "shutting down");
        assert_eq!(svc.stats().2, 1, "cancelled counter must not be double-counted");

        svc.dispose().await;
    }

    #[tokio::test]
    async fn await_result_can_be_called_more_than_once() {
        // The first call consumes the per-command oneshot; a realistic
        // caller that retries `await_result` after its own timeout must
        // still get the real outcome, not a false `NotFound`.
        let dbg = MockDebugger::new().with_response("k", "stack-dump", StdDuration::from_millis(80));
        let svc = service(fast_cfg(), Arc::new(dbg));

        let id = svc.submit("k").await.unwrap();

        // First caller gives up early (simulating its own timeout) without
        // ever observing completion, so the oneshot is dropped unconsumed.
        let _ = tokio::time::timeout(StdDuration::from_millis(5), svc.await_result(&id)).await;

        // A second caller retries later, once the command has completed and
        // the first call's lock on `pending` (if any) has long been released.
        let out = svc.await_result(&id).await.unwrap();
        assert_eq!(out, "stack-dump");

        // And a third call, after the result is already cached, still works.
        let out2 = svc.await_result(&id).await.unwrap();
        assert_eq!(out2, "stack-dump");

        svc.dispose().await;
    }

    #[tokio::test]
    async fn await_result_concurrent_callers_both_see_the_outcome() {
        let dbg = MockDebugger::new().with_response("k", "stack-dump", StdDuration::from_millis(40));
        let svc = service(fast_cfg(), Arc::new(dbg));
        let id = svc.submit("k").await.unwrap();

        let (a, b) = tokio::join!(svc.await_result(&id), svc.await_result(&id));
        assert_eq!(a.unwrap(), "stack-dump");
        assert_eq!(b.unwrap(), "stack-dump");

        svc.dispose().await;
    }

    #[tokio::test]
    async fn id_format_is_monotonic_and_zero_padded() {
        let svc = service(fast_cfg(), Arc::new(MockDebugger::new()));
        let a = svc.submit("k").await.unwrap();
        let b = svc.submit("k").await.unwrap();
        assert_eq!(a, "cmd-s1-0000");
        assert_eq!(b, "cmd-s1-0001");
        svc.dispose().await;
    }
}
