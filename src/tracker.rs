//! Indexed registry of live commands for one session.
//!
//! Holds every command that has not yet been swept by retention, a FIFO
//! snapshot of the ids still waiting in the inbound channel (used purely for
//! `queue_position`/`list` reporting — the channel itself is the real
//! ordering authority), the currently-executing command, and atomic
//! lifetime counters. See spec §4.2.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::command::{Command, CommandState};

/// One row of [`Tracker::list`].
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub id: String,
    pub text: String,
    pub queued_at: Instant,
    pub status: String,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    submitted: AtomicU64,
}

/// Concurrent-read registry of commands for a single session.
pub struct Tracker {
    entries: RwLock<HashMap<String, Arc<Command>>>,
    /// FIFO snapshot mirroring the inbound channel: pushed on submit, popped
    /// when the executor dequeues. Index into this (1-based) is queue
    /// position for a command that hasn't started executing yet.
    order: RwLock<VecDeque<String>>,
    current: RwLock<Option<Arc<Command>>>,
    counters: Counters,
}

impl Tracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            order: RwLock::new(VecDeque::new()),
            current: RwLock::new(None),
            counters: Counters::default(),
        }
    }

    /// Allocate the next per-session command counter value (used to build
    /// ids of the form `cmd-<session>-<N4>`, spec §3).
    pub fn next_submission_index(&self) -> u64 {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a freshly constructed command and enqueue its id into the
    /// FIFO snapshot. A fresh id colliding with a live one is an invariant
    /// violation (ids are monotonic per session); returns `false` in that
    /// case so the caller can fail the submission.
    pub fn add(&self, cmd: Arc<Command>) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&cmd.id) {
            return false;
        }
        self.order.write().push_back(cmd.id.clone());
        entries.insert(cmd.id.clone(), cmd);
        true
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Command>> {
        self.entries.read().get(id).cloned()
    }

    #[must_use]
    pub fn state(&self, id: &str) -> Option<CommandState> {
        self.get(id).map(|c| c.state())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Command>> {
        self.entries.write().remove(id)
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<Command>> {
        self.current.read().clone()
    }

    /// Written only by the executor, exactly when it enters/leaves
    /// `Executing` (spec §4.2).
    pub fn set_current(&self, cmd: Option<Arc<Command>>) {
        *self.current.write() = cmd;
    }

    /// Pop the next id off the FIFO snapshot. Call this exactly when the
    /// executor receives the matching id off the real inbound channel, so
    /// the snapshot never drifts from the channel's actual order.
    pub fn pop_front_order(&self) -> Option<String> {
        self.order.write().pop_front()
    }

    /// `0` if `id` is currently executing; `1..N` for its position in the
    /// FIFO snapshot; `-1` if it isn't live in the queue (terminal or
    /// unknown).
    #[must_use]
    pub fn queue_position(&self, id: &str) -> i64 {
        if let Some(cur) = self.current.read().as_ref() {
            if cur.id == id {
                return 0;
            }
        }
        let order = self.order.read();
        match order.iter().position(|x| x == id) {
            Some(idx) => (idx as i64) + 1,
            None => -1,
        }
    }

    /// Current first, then queued (channel order), then any other
    /// non-terminal commands, then terminal commands. Status is the state
    /// name, with `"Queued (position k)"` for channel entries (spec §4.2).
    #[must_use]
    pub fn list(&self) -> Vec<ListEntry> {
        let entries = self.entries.read();
        let order = self.order.read();
        let current = self.current.read();

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::with_capacity(entries.len());

        if let Some(cur) = current.as_ref() {
            if let Some(cmd) = entries.get(&cur.id) {
                out.push(ListEntry {
                    id: cmd.id.clone(),
                    text: cmd.text.clone(),
                    queued_at: cmd.queued_at,
                    status: cmd.state().as_str().to_string(),
                });
                seen.insert(cmd.id.clone());
            }
        }

        for (pos, id) in order.iter().enumerate() {
            if seen.contains(id) {
                continue;
            }
            if let Some(cmd) = entries.get(id) {
                out.push(ListEntry {
                    id: cmd.id.clone(),
                    text: cmd.text.clone(),
                    queued_at: cmd.queued_at,
                    status: format!("Queued (position {})", pos + 1),
                });
                seen.insert(id.clone());
            }
        }

        let mut others: Vec<&Arc<Command>> = entries
            .values()
            .filter(|c| !seen.contains(&c.id) && !c.state().is_terminal())
            .collect();
        others.sort_by_key(|c| c.queued_at);
        for cmd in others {
            out.push(ListEntry {
                id: cmd.id.clone(),
                text: cmd.text.clone(),
                queued_at: cmd.queued_at,
                status: cmd.state().as_str().to_string(),
            });
            seen.insert(cmd.id.clone());
        }

        let mut terminal: Vec<&Arc<Command>> = entries
            .values()
            .filter(|c| !seen.contains(&c.id))
            .collect();
        terminal.sort_by_key(|c| c.queued_at);
        for cmd in terminal {
            out.push(ListEntry {
                id: cmd.id.clone(),
                text: cmd.text.clone(),
                queued_at: cmd.queued_at,
                status: cmd.state().as_str().to_string(),
            });
        }

        out
    }

    /// Cancel every live non-terminal command, transitioning each to
    /// `Cancelled` with `reason` as its result text. Returns the count of
    /// commands actually transitioned (already-terminal commands are
    /// skipped, not double-counted).
    pub fn cancel_all(&self, reason: &str) -> usize {
        let entries = self.entries.read();
        let mut count = 0usize;
        for cmd in entries.values() {
            cmd.request_cancel();
            if cmd.complete(reason.to_string(), CommandState::Cancelled) {
                count += 1;
            }
        }
        drop(entries);
        if count > 0 {
            self.counters
                .cancelled
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    /// Like [`Tracker::cancel_all`], but returns the commands actually
    /// transitioned so the caller can also populate the result cache for
    /// each (spec §4.5 "CancelAll" / §4.6 disposal flow).
    pub fn cancel_all_collect(&self, reason: &str) -> Vec<Arc<Command>> {
        let entries = self.entries.read();
        let mut cancelled = Vec::new();
        for cmd in entries.values() {
            cmd.request_cancel();
            if cmd.complete(reason.to_string(), CommandState::Cancelled) {
                cancelled.push(cmd.clone());
            }
        }
        drop(entries);
        if !cancelled.is_empty() {
            self.counters
                .cancelled
                .fetch_add(cancelled.len() as u64, Ordering::Relaxed);
        }
        cancelled
    }

    pub fn record_processed(&self) {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// `(processed, failed, cancelled)`.
    #[must_use]
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.counters.processed.load(Ordering::Relaxed),
            self.counters.failed.load(Ordering::Relaxed),
            self.counters.cancelled.load(Ordering::Relaxed),
        )
    }

    /// Best-effort retention sweep: drop terminal entries older than
    /// `retention`. Run periodically by [`crate::queue::QueueService`].
    pub fn sweep_expired(&self, retention: Duration) {
        let mut entries = self.entries.write();
        entries.retain(|_id, cmd| {
            !cmd.state().is_terminal() || cmd.queued_at.elapsed() < retention
        });
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}
