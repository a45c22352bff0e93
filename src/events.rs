//! Fire-and-forget event sink: status/heartbeat/queue events produced by the
//! executor and queue service for an external event/notification sink (out
//! of scope per spec §1 — this module only defines the shapes and a default
//! in-process sink).
//!
//! Event delivery never gates a command's outcome (spec §4.5/§9): emitting
//! is a bounded, drop-oldest side channel, grounded in the design note
//! "Fire-and-forget background tasks for events" — never a blocking call on
//! the executor's hot path.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Status of a command as reported to the event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Queued,
    Executing,
    Completed,
    Cancelled,
    Failed,
}

impl EventState {
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
}

/// A lifecycle status update for one command.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub id: String,
    pub text: String,
    pub state: EventState,
    pub progress: u8,
    pub result: Option<String>,
    pub error: Option<String>,
    pub queue_position: Option<i64>,
    pub message: Option<String>,
}

/// A periodic progress update for an executing command.
#[derive(Debug, Clone)]
pub struct HeartbeatEvent {
    pub id: String,
    pub text: String,
    pub elapsed: Duration,
    pub detail: String,
}

/// A session-level lifecycle event: startup, shutdown, bulk cancel.
#[derive(Debug, Clone)]
pub struct QueueEvent {
    pub kind: String,
    pub message: String,
    pub payload: Option<serde_json::Value>,
}

/// Union of everything the sink can carry.
#[derive(Debug, Clone)]
pub enum Event {
    Status(StatusEvent),
    Heartbeat(HeartbeatEvent),
    Queue(QueueEvent),
}

/// Consumer-side interface for the event sink. Implementations MUST NOT
/// block the caller meaningfully — `emit` is called from the executor's hot
/// path.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// A bounded, drop-oldest in-process sink. When full, the oldest buffered
/// event is discarded (logged at `warn!`) to make room for the new one —
/// emitters are never blocked and command outcomes never wait on this.
pub struct ChannelEventSink {
    buf: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
}

impl ChannelEventSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Drain every buffered event (oldest first). Intended for tests and for
    /// a forwarding task that bridges to the real external sink.
    pub fn drain(&self) -> Vec<Event> {
        let mut buf = self.buf.lock();
        buf.drain(..).collect()
    }

    /// Wait until at least one event is buffered, or return immediately if
    /// one already is.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: Event) {
        let mut buf = self.buf.lock();
        if buf.len() >= self.capacity {
            buf.pop_front();
            tracing::warn!("event sink at capacity, dropping oldest buffered event");
        }
        buf.push_back(event);
        drop(buf);
        self.notify.notify_one();
    }
}

/// A sink that discards everything. Useful for tests that don't assert on
/// event contents.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: Event) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(id: &str) -> Event {
        Event::Status(StatusEvent {
            id: id.to_string(),
            text: "k".into(),
            state: EventState::Completed,
            progress: 100,
            result: Some("ok".into()),
            error: None,
            queue_position: None,
            message: None,
        })
    }

    #[test]
    fn emit_and_drain_preserves_order() {
        let sink = ChannelEventSink::new(10);
        sink.emit(status("c1"));
        sink.emit(status("c2"));
        let drained = sink.drain();
        assert_eq!(drained.len(), 2);
        let Event::Status(first) = &drained[0] else { panic!() };
        assert_eq!(first.id, "c1");
    }

    #[test]
    fn overflow_drops_oldest() {
        let sink = ChannelEventSink::new(2);
        sink.emit(status("c1"));
        sink.emit(status("c2"));
        sink.emit(status("c3"));
        let drained = sink.drain();
        assert_eq!(drained.len(), 2);
        let Event::Status(first) = &drained[0] else { panic!() };
        assert_eq!(first.id, "c2");
        let Event::Status(second) = &drained[1] else { panic!() };
        assert_eq!(second.id, "c3");
    }

    #[test]
    fn null_sink_discards_silently() {
        let sink = NullEventSink;
        sink.emit(status("c1"));
    }
}
