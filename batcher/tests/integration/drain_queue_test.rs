use std::time::Duration;

use batcher::error::ErrorKind;
use batcher::test_utils::coordinator::drain_queue_coordinator;
use batcher::test_utils::unit::{UnitOutcome, UnitRecorder};
use telemetry::init_test_tracing;
use tokio::time::timeout;

const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn backlog_is_drained_back_to_back() {
    init_test_tracing();
    let (coordinator, store) = drain_queue_coordinator(2, 0);
    let recorder = UnitRecorder::new();

    // Without yielding, the first round takes the first three units and the remaining three are
    // still above the threshold when it finishes.
    for index in 0..6 {
        coordinator
            .enqueue(recorder.put(&format!("unit-{index}"), "value"))
            .unwrap();
    }

    timeout(IDLE_TIMEOUT, coordinator.wait_until_idle())
        .await
        .unwrap();

    assert_eq!(store.commits().await, 2);
    assert_eq!(store.entries().await.len(), 6);
    assert_eq!(recorder.committed(), 6);
}

#[tokio::test(start_paused = true)]
async fn leftovers_below_threshold_are_drained_by_interval() {
    init_test_tracing();
    let (coordinator, store) = drain_queue_coordinator(2, 100);
    let recorder = UnitRecorder::new();

    for index in 0..5 {
        coordinator
            .enqueue(recorder.put(&format!("unit-{index}"), "value"))
            .unwrap();
    }

    coordinator.wait_until_idle().await;

    assert_eq!(store.commits().await, 2);
    assert_eq!(recorder.committed(), 5);
    assert_eq!(coordinator.pending_len(), 0);
}

#[tokio::test]
async fn failing_unit_rolls_back_every_unit_of_round() {
    init_test_tracing();
    let (coordinator, store) = drain_queue_coordinator(2, 0);
    let recorder = UnitRecorder::new();

    coordinator.enqueue(recorder.put("before", "value")).unwrap();
    coordinator.enqueue(recorder.failing("failing")).unwrap();
    coordinator.enqueue(recorder.put("after", "value")).unwrap();

    recorder.wait_for_outcomes(3).await;

    for name in ["before", "failing", "after"] {
        assert_eq!(
            recorder.outcome_of(name),
            Some(UnitOutcome::RolledBack(ErrorKind::UnitExecutionFailed))
        );
    }
    assert!(store.entries().await.is_empty());
    assert_eq!(store.commits().await, 0);

    // The coordinator keeps accepting work after a failed round.
    for name in ["a", "b", "c"] {
        coordinator.enqueue(recorder.put(name, "value")).unwrap();
    }
    recorder.wait_for_outcomes(6).await;
    assert_eq!(recorder.committed(), 3);
}

#[tokio::test]
async fn panicking_unit_rolls_back_round() {
    init_test_tracing();
    let (coordinator, store) = drain_queue_coordinator(1, 0);
    let recorder = UnitRecorder::new();

    coordinator.enqueue(recorder.put("first", "value")).unwrap();
    coordinator.enqueue(recorder.panicking("panicking")).unwrap();

    recorder.wait_for_outcomes(2).await;

    assert_eq!(
        recorder.outcome_of("first"),
        Some(UnitOutcome::RolledBack(ErrorKind::UnitPanic))
    );
    assert_eq!(
        recorder.outcome_of("panicking"),
        Some(UnitOutcome::RolledBack(ErrorKind::UnitPanic))
    );
    assert!(store.get("first").await.is_none());
    assert!(!coordinator.is_closed());
}

#[tokio::test]
async fn commit_failure_rolls_back_without_closing() {
    init_test_tracing();
    let (coordinator, store) = drain_queue_coordinator(0, 0);
    let recorder = UnitRecorder::new();
    store.fail_next_commits(1).await;

    coordinator.enqueue(recorder.put("lost", "value")).unwrap();
    recorder.wait_for_outcomes(1).await;

    assert_eq!(
        recorder.outcome_of("lost"),
        Some(UnitOutcome::RolledBack(ErrorKind::CommitFailed))
    );
    assert!(!coordinator.is_closed());
}

#[tokio::test]
async fn dispatched_round_completes_after_close() {
    init_test_tracing();
    let (coordinator, store) = drain_queue_coordinator(2, 0);
    let recorder = UnitRecorder::new();

    for name in ["a", "b", "c"] {
        coordinator.enqueue(recorder.put(name, "value")).unwrap();
    }
    assert!(coordinator.is_executing());

    coordinator.close();
    let err = coordinator
        .enqueue(recorder.put("rejected", "value"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CoordinatorClosed);

    timeout(IDLE_TIMEOUT, coordinator.wait_until_idle())
        .await
        .unwrap();

    assert_eq!(recorder.committed(), 3);
    assert_eq!(recorder.outcome_of("rejected"), None);
    assert_eq!(store.commits().await, 1);
}

#[tokio::test]
async fn close_rolls_back_units_never_dispatched() {
    init_test_tracing();
    let (coordinator, store) = drain_queue_coordinator(10, 0);
    let recorder = UnitRecorder::new();

    coordinator.enqueue(recorder.put("a", "value")).unwrap();
    coordinator.enqueue(recorder.put("b", "value")).unwrap();
    coordinator.close();

    assert_eq!(recorder.rolled_back(), 2);
    assert_eq!(
        recorder.outcome_of("a"),
        Some(UnitOutcome::RolledBack(ErrorKind::CoordinatorClosed))
    );
    assert_eq!(store.commits().await, 0);
    assert_eq!(coordinator.pending_len(), 0);
}

#[tokio::test]
async fn panicking_commit_callback_does_not_stop_round_notifications() {
    init_test_tracing();
    let (coordinator, store) = drain_queue_coordinator(2, 0);
    let recorder = UnitRecorder::new();

    coordinator.enqueue(recorder.put("a", "value")).unwrap();
    coordinator
        .enqueue(recorder.panicking_on_commit("b", "value"))
        .unwrap();
    coordinator.enqueue(recorder.put("c", "value")).unwrap();

    timeout(IDLE_TIMEOUT, coordinator.wait_until_idle())
        .await
        .unwrap();
    recorder.wait_for_outcomes(2).await;

    assert_eq!(recorder.outcome_of("a"), Some(UnitOutcome::Committed));
    assert_eq!(recorder.outcome_of("b"), None);
    assert_eq!(recorder.outcome_of("c"), Some(UnitOutcome::Committed));
    assert_eq!(store.commits().await, 1);
    assert_eq!(store.entries().await.len(), 3);
    assert!(!coordinator.is_closed());
}

#[tokio::test]
async fn units_below_threshold_stay_pending_without_interval() {
    init_test_tracing();
    let (coordinator, store) = drain_queue_coordinator(2, 0);
    let recorder = UnitRecorder::new();

    // The third enqueue dispatches a round; the last two stay at the threshold.
    for index in 0..5 {
        coordinator
            .enqueue(recorder.put(&format!("unit-{index}"), "value"))
            .unwrap();
    }
    recorder.wait_for_outcomes(3).await;

    let idle = timeout(Duration::from_millis(100), coordinator.wait_until_idle()).await;
    assert!(idle.is_err());
    assert_eq!(coordinator.pending_len(), 2);
    assert_eq!(store.commits().await, 1);
    assert_eq!(recorder.committed(), 3);

    // Closing releases the stranded units and the waiter.
    coordinator.close();
    timeout(IDLE_TIMEOUT, coordinator.wait_until_idle())
        .await
        .unwrap();
    assert_eq!(recorder.rolled_back(), 2);
}

#[tokio::test]
async fn store_creation_failure_closes_queue() {
    init_test_tracing();
    let (coordinator, store) = drain_queue_coordinator(1, 0);
    let recorder = UnitRecorder::new();
    store.fail_next_creations(1);

    coordinator.enqueue(recorder.put("a", "value")).unwrap();
    let err = coordinator
        .enqueue(recorder.put("b", "value"))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TransactionCreationFailed);
    assert!(coordinator.is_closed());
    for name in ["a", "b"] {
        assert_eq!(
            recorder.outcome_of(name),
            Some(UnitOutcome::RolledBack(ErrorKind::TransactionCreationFailed))
        );
    }
    assert_eq!(store.commits().await, 0);
}
