//! A single queued debugger command: identity, lifecycle state machine,
//! one-shot completion signal, and per-command cancellation handle.
//!
//! See spec §3/§4.1. The state machine is intentionally small and its
//! terminal-state guard lives in one place ([`Command::transition`]) rather
//! than being re-checked by every caller.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a [`Command`]. `Completed`, `Cancelled`, and `Failed`
/// are terminal: no further transition is accepted once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandState {
    Queued = 0,
    Executing = 1,
    Completed = 2,
    Cancelled = 3,
    Failed = 4,
}

impl CommandState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Queued,
            1 => Self::Executing,
            2 => Self::Completed,
            3 => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

/// A command submitted to a session's queue.
///
/// All fields except `state` are immutable after construction. `cancel` is
/// shared with the executor; it is intentionally never handed to callers
/// directly (they go through [`crate::queue::QueueService::cancel`]).
pub struct Command {
    pub id: String,
    pub text: String,
    pub queued_at: Instant,
    state: AtomicU8,
    cancel: CancellationToken,
    completion_tx: Mutex<Option<oneshot::Sender<String>>>,
    /// Durable copy of the outcome passed to [`Command::complete`], readable
    /// by any number of callers after the fact — unlike `completion_tx`,
    /// which only the first `await_result` caller gets to consume.
    result: Mutex<Option<String>>,
    /// Fired once, after `result` is populated, so any number of waiters
    /// beyond the single oneshot consumer can observe completion.
    completion_notify: Notify,
    /// Set once, by [`Command::begin_execution`], when this command leaves
    /// `Queued`. Used to compute remaining time against its own timeout
    /// rather than its total time alive in the tracker.
    execution_started_at: Mutex<Option<Instant>>,
}

impl Command {
    /// Construct a new queued command, returning it alongside the
    /// single-consumer receiver for its eventual terminal result.
    #[must_use]
    pub fn new(id: String, text: String, queued_at: Instant) -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        let cmd = Self {
            id,
            text,
            queued_at,
            state: AtomicU8::new(CommandState::Queued as u8),
            cancel: CancellationToken::new(),
            completion_tx: Mutex::new(Some(tx)),
            result: Mutex::new(None),
            completion_notify: Notify::new(),
            execution_started_at: Mutex::new(None),
        };
        (cmd, rx)
    }

    #[must_use]
    pub fn state(&self) -> CommandState {
        CommandState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Request cancellation of this command. Idempotent.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn execution_started_at(&self) -> Option<Instant> {
        *self.execution_started_at.lock()
    }

    /// Transition `Queued -> Executing` and record the start instant used
    /// for remaining-time estimates. Returns `false` if the command is
    /// already terminal (e.g. cancelled while queued).
    pub fn begin_execution(&self) -> bool {
        if !self.transition(CommandState::Executing) {
            return false;
        }
        *self.execution_started_at.lock() = Some(Instant::now());
        true
    }

    /// Attempt a bare state transition (no completion signal). Used by the
    /// executor for the non-terminal `Queued -> Executing` step. Returns
    /// `false` if the command is already terminal.
    pub fn transition(&self, to: CommandState) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if CommandState::from_u8(current).is_terminal() {
                return false;
            }
            if self
                .state
                .compare_exchange(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Transition into a terminal state, store `outcome` for any number of
    /// later readers, and fulfill the completion signal, exactly once. A
    /// second call (from a racing path) is a no-op and returns `false`.
    pub fn complete(&self, outcome: String, terminal: CommandState) -> bool {
        debug_assert!(terminal.is_terminal());
        if !self.transition(terminal) {
            return false;
        }
        *self.result.lock() = Some(outcome.clone());
        if let Some(tx) = self.completion_tx.lock().take() {
            // The receiver may already be gone if the caller stopped polling;
            // that is not an error for the command's own outcome.
            let _ = tx.send(outcome);
        }
        self.completion_notify.notify_waiters();
        true
    }

    /// The stored outcome, once this command has reached a terminal state.
    /// `None` before then.
    #[must_use]
    pub fn completed_result(&self) -> Option<String> {
        self.result.lock().clone()
    }

    /// Wait until this command reaches a terminal state. Unlike the
    /// one-shot completion channel handed out by [`Command::new`], this can
    /// be called by any number of waiters, any number of times — each sees
    /// the same terminal outcome via [`Command::completed_result`].
    pub async fn wait_terminal(&self) {
        loop {
            // Register interest before checking, so a `complete()` that
            // lands between the check and the wait can't be missed.
            let notified = self.completion_notify.notified();
            if self.state().is_terminal() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_command_is_queued() {
        let (cmd, _rx) = Command::new("cmd-s-0001".into(), "k".into(), Instant::now());
        assert_eq!(cmd.state(), CommandState::Queued);
        assert!(!cmd.is_cancel_requested());
    }

    #[test]
    fn transition_out_of_terminal_is_rejected() {
        let (cmd, _rx) = Command::new("cmd-s-0001".into(), "k".into(), Instant::now());
        assert!(cmd.complete("done".into(), CommandState::Completed));
        assert!(!cmd.transition(CommandState::Executing));
        assert_eq!(cmd.state(), CommandState::Completed);
    }

    #[tokio::test]
    async fn complete_fulfills_receiver_exactly_once() {
        let (cmd, rx) = Command::new("cmd-s-0001".into(), "k".into(), Instant::now());
        assert!(cmd.transition(CommandState::Executing));
        assert!(cmd.complete("stack-dump".into(), CommandState::Completed));
        // Second completion attempt is a no-op.
        assert!(!cmd.complete("ignored".into(), CommandState::Failed));
        assert_eq!(rx.await.unwrap(), "stack-dump");
        assert_eq!(cmd.state(), CommandState::Completed);
    }

    #[tokio::test]
    async fn wait_terminal_is_observable_by_many_callers() {
        let (cmd, _rx) = Command::new("cmd-s-0001".into(), "k".into(), Instant::now());
        let cmd = std::sync::Arc::new(cmd);
        assert!(cmd.completed_result().is_none());

        let waiter = {
            let cmd = cmd.clone();
            tokio::spawn(async move {
                cmd.wait_terminal().await;
                cmd.completed_result()
            })
        };
        tokio::task::yield_now().await;
        assert!(cmd.complete("stack-dump".into(), CommandState::Completed));

        assert_eq!(waiter.await.unwrap(), Some("stack-dump".to_string()));
        // A second, later waiter also observes it without blocking.
        cmd.wait_terminal().await;
        assert_eq!(cmd.completed_result(), Some("stack-dump".to_string()));
    }

    #[test]
    fn cancellation_is_idempotent_and_visible() {
        let (cmd, _rx) = Command::new("cmd-s-0001".into(), "k".into(), Instant::now());
        cmd.request_cancel();
        cmd.request_cancel();
        assert!(cmd.is_cancel_requested());
    }
}
