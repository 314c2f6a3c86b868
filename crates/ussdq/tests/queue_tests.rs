//! Claim/execute behaviour of the poller and executor against a real store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use common::{settle, FlakyStore, ScriptedBackend, TestQueue, POLL_INTERVAL};
use ussdq::model::NewOperation;
use ussdq::store::OperationStore;
use ussdq::{
    Executor, NotificationKind, Notifier, OperationStatus, QueuePoller, SimulatedBackend,
    SqliteStore, TickOutcome,
};

fn executed(outcome: TickOutcome) -> ussdq::ExecutionReport {
    match outcome {
        TickOutcome::Executed(report) => report,
        other => panic!("expected an execution, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_simulated_backend_completes_pending_operation() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let executor = Executor::new(
        store.clone(),
        Arc::new(SimulatedBackend::default()),
        Notifier::default(),
        Duration::from_secs(45),
    );
    let poller = QueuePoller::new(store.clone(), executor, POLL_INTERVAL);
    let op = store
        .insert(NewOperation::new("*123#", 1).unwrap())
        .await
        .unwrap();

    let report = executed(poller.tick().await);
    assert_eq!(report.id, op.id);

    let stored = store.get(&op.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OperationStatus::Completed);
    assert_eq!(
        stored.result.as_deref(),
        Some("Response from *123# via SIM 1: Balance: $25.50")
    );
    assert!(stored.error_message.is_none());
    let executed_at = stored.executed_at.unwrap();
    assert!(executed_at >= stored.created_at);
    assert!(executed_at - stored.created_at < chrono::Duration::seconds(5));
}

#[tokio::test]
async fn test_one_cycle_executes_only_the_oldest() {
    let queue = TestQueue::in_memory(ScriptedBackend::new());
    let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
    let t1 = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 1).unwrap();
    // Inserted out of order on purpose.
    let later = queue
        .store
        .insert_at(NewOperation::new("*2#", 1).unwrap(), t1)
        .unwrap();
    let earlier = queue
        .store
        .insert_at(NewOperation::new("*1#", 1).unwrap(), t0)
        .unwrap();

    let report = executed(queue.poller.tick().await);

    assert_eq!(report.id, earlier.id);
    assert_eq!(queue.get(&earlier.id).await.status, OperationStatus::Completed);
    assert_eq!(queue.get(&later.id).await.status, OperationStatus::Pending);

    let report = executed(queue.poller.tick().await);
    assert_eq!(report.id, later.id);
    assert_eq!(
        queue.backend.calls(),
        vec![("*1#".to_string(), 1), ("*2#".to_string(), 1)]
    );
    assert_eq!(queue.poller.tick().await, TickOutcome::Idle);
}

#[tokio::test]
async fn test_backend_error_marks_operation_failed() {
    let queue = TestQueue::in_memory(ScriptedBackend::new().fail("*100#", "timeout"));
    let mut notes = queue.notifier.subscribe();
    let op = queue.enqueue("*100#", 2).await;

    let report = executed(queue.poller.tick().await);
    assert_eq!(report.status, OperationStatus::Failed);

    let stored = queue.get(&op.id).await;
    assert_eq!(stored.status, OperationStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("timeout"));
    assert!(stored.result.is_none());
    assert!(stored.executed_at.is_some());

    assert_eq!(notes.recv().await.unwrap().kind, NotificationKind::Started);
    let failure = notes.recv().await.unwrap();
    assert_eq!(failure.text, "USSD failed: *100#: timeout");

    // Failed operations are never picked up again.
    assert_eq!(queue.poller.tick().await, TickOutcome::Idle);
}

#[tokio::test]
async fn test_tick_while_busy_does_not_touch_store() {
    let (backend, gate) = ScriptedBackend::gated();
    let queue = TestQueue::new(FlakyStore::new(), backend);
    let first = queue.enqueue("*1#", 1).await;
    let second = queue.enqueue("*2#", 1).await;

    let poller = queue.poller.clone();
    let running = tokio::spawn(async move { poller.tick().await });
    let backend = queue.backend.clone();
    settle(|| backend.in_flight() == 1).await;
    assert!(queue.poller.is_busy());

    let reads_before = queue.store.reads();
    assert_eq!(queue.poller.tick().await, TickOutcome::Busy);
    assert_eq!(queue.store.reads(), reads_before);
    assert_eq!(queue.get(&second.id).await.status, OperationStatus::Pending);
    assert_eq!(queue.get(&first.id).await.status, OperationStatus::Executing);

    gate.add_permits(1);
    let report = executed(running.await.unwrap());
    assert_eq!(report.id, first.id);
    assert!(!queue.poller.is_busy());

    gate.add_permits(1);
    let report = executed(queue.poller.tick().await);
    assert_eq!(report.id, second.id);
    assert_eq!(queue.backend.max_in_flight(), 1);
}

#[tokio::test]
async fn test_transient_read_failure_is_retried() {
    let queue = TestQueue::new(FlakyStore::new(), ScriptedBackend::new());
    let op = queue.enqueue("*123#", 1).await;
    queue.store.fail_next_reads(1);

    assert_eq!(queue.poller.tick().await, TickOutcome::ReadFailed);
    assert_eq!(queue.get(&op.id).await.status, OperationStatus::Pending);
    assert!(!queue.poller.is_busy());

    executed(queue.poller.tick().await);
    assert_eq!(queue.get(&op.id).await.status, OperationStatus::Completed);
    assert_eq!(queue.backend.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_running_poller_recovers_from_read_failure() {
    let queue = TestQueue::new(FlakyStore::new(), ScriptedBackend::new());
    let op = queue.enqueue("*123#", 1).await;
    queue.store.fail_next_reads(1);

    let handle = queue.poller.start();

    tokio::time::sleep(POLL_INTERVAL + Duration::from_millis(100)).await;
    assert_eq!(queue.store.reads(), 1);
    assert_eq!(queue.get(&op.id).await.status, OperationStatus::Pending);

    tokio::time::sleep(POLL_INTERVAL).await;
    assert_eq!(queue.get(&op.id).await.status, OperationStatus::Completed);
    assert_eq!(queue.backend.calls().len(), 1);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_first_tick_waits_one_interval() {
    let queue = TestQueue::in_memory(ScriptedBackend::new());
    let op = queue.enqueue("*1#", 1).await;

    let handle = queue.poller.start();
    tokio::time::sleep(POLL_INTERVAL - Duration::from_millis(100)).await;
    assert_eq!(queue.get(&op.id).await.status, OperationStatus::Pending);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(queue.get(&op.id).await.status, OperationStatus::Completed);
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_execution() {
    let (backend, gate) = ScriptedBackend::gated();
    let queue = TestQueue::in_memory(backend);
    let op = queue.enqueue("*1#", 1).await;
    let untouched = queue.enqueue("*2#", 1).await;

    let handle = queue.poller.start();
    let backend = queue.backend.clone();
    tokio::time::sleep(POLL_INTERVAL + Duration::from_millis(100)).await;
    settle(|| backend.in_flight() == 1).await;

    let stopping = tokio::spawn(handle.stop());
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!stopping.is_finished());

    gate.add_permits(1);
    stopping.await.unwrap();

    assert_eq!(queue.get(&op.id).await.status, OperationStatus::Completed);
    assert_eq!(queue.get(&untouched.id).await.status, OperationStatus::Pending);
    assert_eq!(queue.poller.tick().await, TickOutcome::Stopped);
    assert_eq!(queue.backend.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_on_change_claims_without_waiting_for_tick() {
    let queue = TestQueue::new(FlakyStore::new(), ScriptedBackend::new());
    let poller = queue.poller.clone().with_dispatch_on_change(true);

    let handle = poller.start();
    let store = queue.store.clone();
    settle(|| store.subscribes() == 1).await;

    let enqueued = tokio::time::Instant::now();
    let op = queue.enqueue("*9#", 3).await;
    queue.wait_for_status(&op.id, OperationStatus::Completed).await;

    assert!(enqueued.elapsed() < POLL_INTERVAL);
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_queue_drains_in_order_under_steady_polling() {
    let queue = TestQueue::in_memory(ScriptedBackend::new());
    for code in ["*1#", "*2#", "*3#"] {
        queue.enqueue(code, 1).await;
    }

    let handle = queue.poller.start();
    tokio::time::sleep(POLL_INTERVAL * 3 + Duration::from_millis(100)).await;
    handle.stop().await;

    let codes: Vec<String> = queue
        .backend
        .calls()
        .into_iter()
        .map(|(code, _)| code)
        .collect();
    assert_eq!(codes, vec!["*1#", "*2#", "*3#"]);
    assert_eq!(queue.backend.max_in_flight(), 1);
}

#[tokio::test]
async fn test_failed_claim_write_still_dials() {
    let queue = TestQueue::new(
        FlakyStore::new(),
        ScriptedBackend::new().reply("*1#", "Balance: $2.00"),
    );
    let mut notes = queue.notifier.subscribe();
    let op = queue.enqueue("*1#", 1).await;
    queue
        .store
        .fail_next_writes(OperationStatus::Executing, 1);

    let report = executed(queue.poller.tick().await);

    assert_eq!(report.status, OperationStatus::Completed);
    assert_eq!(queue.backend.calls(), vec![("*1#".to_string(), 1)]);
    assert!(!queue.poller.is_busy());
    assert_eq!(notes.recv().await.unwrap().kind, NotificationKind::Started);
    assert_eq!(notes.recv().await.unwrap().kind, NotificationKind::Success);
    assert!(notes.try_recv().is_err());

    // The terminal write lands straight from pending.
    let stored = queue.get(&op.id).await;
    assert_eq!(stored.status, OperationStatus::Completed);
    assert_eq!(stored.result.as_deref(), Some("Balance: $2.00"));
    assert!(stored.executed_at.is_none());
}

#[tokio::test]
async fn test_failed_terminal_write_leaves_row_executing() {
    let queue = TestQueue::new(FlakyStore::new(), ScriptedBackend::new());
    let mut notes = queue.notifier.subscribe();
    let op = queue.enqueue("*1#", 1).await;
    queue
        .store
        .fail_next_writes(OperationStatus::Completed, 1);

    let report = executed(queue.poller.tick().await);

    assert_eq!(report.status, OperationStatus::Completed);
    assert_eq!(report.result.as_deref(), Some("ok:*1#"));
    assert_eq!(queue.backend.calls().len(), 1);
    assert!(!queue.poller.is_busy());
    assert_eq!(notes.recv().await.unwrap().kind, NotificationKind::Started);
    assert_eq!(notes.recv().await.unwrap().kind, NotificationKind::Success);

    let stored = queue.get(&op.id).await;
    assert_eq!(stored.status, OperationStatus::Executing);
    assert!(stored.result.is_none());
    assert_eq!(stored.executed_at, report.executed_at);

    // Not pending any more, so it is never dialled twice.
    assert_eq!(queue.poller.tick().await, TickOutcome::Idle);
    assert_eq!(queue.backend.calls().len(), 1);
}
