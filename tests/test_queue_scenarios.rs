//! Integration tests exercising [`QueueService`] end-to-end through its
//! public API, rather than `run_command` directly on the executor. Mirrors
//! the concrete scenarios enumerated by the specification this crate
//! implements (happy path, queued cancellation, timeout + recovery, bulk
//! cancel during shutdown, status composition).

use std::sync::Arc;
use std::time::Duration;

use dbgqueue::command::CommandState;
use dbgqueue::config::SessionConfig;
use dbgqueue::debugger::{DebuggerDriver, MockDebugger};
use dbgqueue::error::QueueError;
use dbgqueue::events::NullEventSink;
use dbgqueue::queue::QueueService;
use dbgqueue::recovery::MockRecovery;

fn fast_config(session: &str) -> SessionConfig {
    let mut cfg = SessionConfig::new(session);
    cfg.heartbeat_interval = Duration::from_millis(20);
    cfg.shutdown_timeout = Duration::from_millis(300);
    cfg.force_shutdown_timeout = Duration::from_millis(100);
    cfg.cleanup_interval = Duration::from_secs(3600);
    cfg.stats_log_interval = Duration::from_secs(3600);
    cfg
}

#[tokio::test]
async fn happy_path_reports_completed_and_processed_count() {
    let dbg = MockDebugger::new().with_response("k", "stack-dump", Duration::from_millis(40));
    let svc = QueueService::new(
        fast_config("s1"),
        Arc::new(dbg),
        Arc::new(MockRecovery::default()),
        Arc::new(NullEventSink),
    )
    .unwrap();

    let id = svc.submit("k").await.unwrap();
    let out = svc.await_result(&id).await.unwrap();

    assert_eq!(out, "stack-dump");
    assert_eq!(svc.state(&id).unwrap(), Some(CommandState::Completed));
    assert_eq!(svc.stats().0, 1);

    svc.dispose().await;
}

#[tokio::test]
async fn queued_command_cancelled_before_dequeue_never_reaches_debugger() {
    let dbg = MockDebugger::new().with_response(
        "!analyze -v",
        "analysis complete",
        Duration::from_millis(300),
    );
    let svc = QueueService::new(
        fast_config("s2"),
        Arc::new(dbg),
        Arc::new(MockRecovery::default()),
        Arc::new(NullEventSink),
    )
    .unwrap();

    let a = svc.submit("!analyze -v").await.unwrap();
    let b = svc.submit("lm").await.unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;
    assert!(svc.cancel(&b).await);

    assert_eq!(svc.await_result(&b).await.unwrap(), "Command was cancelled");
    assert_eq!(svc.state(&b).unwrap(), Some(CommandState::Cancelled));
    assert_eq!(svc.await_result(&a).await.unwrap(), "analysis complete");
    assert_eq!(svc.stats().2, 1);

    svc.dispose().await;
}

#[tokio::test]
async fn timeout_fails_the_command_and_triggers_recovery_once() {
    let dbg: Arc<dyn DebuggerDriver> = Arc::new(MockDebugger::new().with_hang("!heap"));
    let recovery = Arc::new(MockRecovery::default());
    let mut cfg = fast_config("s3");
    cfg.long_running_timeout = Duration::from_millis(80);
    let svc = QueueService::new(cfg, dbg, recovery.clone(), Arc::new(NullEventSink)).unwrap();

    let id = svc.submit("!heap").await.unwrap();
    let outcome = svc.await_result(&id).await.unwrap();

    assert!(outcome.starts_with("Command timed out after"), "{outcome}");
    assert_eq!(svc.state(&id).unwrap(), Some(CommandState::Failed));
    recovery.wait_for_call().await;
    assert_eq!(recovery.call_count(), 1);
    assert!(recovery.calls()[0].contains("!heap"));

    svc.dispose().await;
}

#[tokio::test]
async fn dispose_drives_every_queued_command_to_a_terminal_state() {
    let dbg = MockDebugger::new().with_response("!analyze -v", "slow", Duration::from_millis(500));
    let svc = QueueService::new(
        fast_config("s4"),
        Arc::new(dbg),
        Arc::new(MockRecovery::default()),
        Arc::new(NullEventSink),
    )
    .unwrap();

    let a = svc.submit("!analyze -v").await.unwrap();
    let b = svc.submit("k").await.unwrap();
    let c = svc.submit("lm").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    svc.dispose().await;

    for id in [&a, &b, &c] {
        let state = svc.state(id);
        assert!(matches!(state, Err(QueueError::Disposed)));
        let outcome = svc.await_result(id).await;
        assert!(outcome.is_ok(), "{id} should resolve to a terminal message even post-disposal");
    }

    // Disposal is idempotent and submissions are rejected afterward.
    svc.dispose().await;
    assert_eq!(svc.submit("k").await.unwrap_err(), QueueError::Disposed);
    assert_eq!(svc.cancel_all(None).await, 0);
}

#[tokio::test]
async fn status_composition_reports_queue_position_and_eta() {
    let dbg = MockDebugger::new().with_response("!analyze -v", "slow", Duration::from_millis(300));
    let svc = QueueService::new(
        fast_config("s5"),
        Arc::new(dbg),
        Arc::new(MockRecovery::default()),
        Arc::new(NullEventSink),
    )
    .unwrap();

    let _c1 = svc.submit("!analyze -v").await.unwrap();
    let _c2 = svc.submit("k").await.unwrap();
    let _c3 = svc.submit("k").await.unwrap();
    let c4 = svc.submit("k").await.unwrap();
    let _c5 = svc.submit("k").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let info = svc.info(&c4).unwrap().expect("command known");
    assert_eq!(info.queue_position, 3);
    assert_eq!(info.state, CommandState::Queued);
    assert!(!info.is_complete);
    let msg = info.status_message.expect("queued commands carry a status string");
    assert!(msg.starts_with("3rd in queue"), "{msg}");
    assert!(msg.contains("Check again in 6-30 seconds"), "{msg}");

    svc.dispose().await;
}

#[tokio::test]
async fn cancel_of_unknown_id_is_false_and_await_reports_not_found() {
    let svc = QueueService::new(
        fast_config("s6"),
        Arc::new(MockDebugger::new()),
        Arc::new(MockRecovery::default()),
        Arc::new(NullEventSink),
    )
    .unwrap();

    assert!(!svc.cancel("cmd-s6-9999").await);
    let err = svc.await_result("cmd-s6-9999").await.unwrap_err();
    assert_eq!(err, QueueError::NotFound("Command not found: cmd-s6-9999".to_string()));

    svc.dispose().await;
}

#[tokio::test]
async fn list_reflects_current_then_queued_then_terminal_ordering() {
    let dbg = MockDebugger::new().with_response("!analyze -v", "slow", Duration::from_millis(200));
    let svc = QueueService::new(
        fast_config("s7"),
        Arc::new(dbg),
        Arc::new(MockRecovery::default()),
        Arc::new(NullEventSink),
    )
    .unwrap();

    let a = svc.submit("!analyze -v").await.unwrap();
    let b = svc.submit("k").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let list = svc.list();
    let ids: Vec<&str> = list.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec![a.as_str(), b.as_str()]);
    assert_eq!(list[0].status, "executing");
    assert_eq!(list[1].status, "Queued (position 1)");

    svc.dispose().await;
}
