use std::time::Duration;

use batcher::error::ErrorKind;
use batcher::failpoints::{MEMORY_COMMIT_FP, MEMORY_CREATE_TRANSACTION_FP};
use batcher::test_utils::coordinator::{batch_register_coordinator, drain_queue_coordinator};
use batcher::test_utils::failpoints::ScopedFailpoints;
use batcher::test_utils::listener::RecordingListener;
use batcher::test_utils::unit::{UnitOutcome, UnitRecorder};
use telemetry::init_test_tracing;
use tokio::time::sleep;

#[tokio::test]
async fn transaction_creation_failure_closes_drain_queue() {
    init_test_tracing();
    let _failpoints = ScopedFailpoints::setup(&[(MEMORY_CREATE_TRANSACTION_FP, "return(creation)")]);
    let (coordinator, _store) = drain_queue_coordinator(1, 0);
    let recorder = UnitRecorder::new();

    coordinator.enqueue(recorder.put("a", "value")).unwrap();
    let err = coordinator
        .enqueue(recorder.put("b", "value"))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::FailpointCreation);
    assert!(coordinator.is_closed());
    assert!(!coordinator.is_executing());

    // Every accepted unit, including the one whose enqueue failed, is rolled back.
    for name in ["a", "b"] {
        assert_eq!(
            recorder.outcome_of(name),
            Some(UnitOutcome::RolledBack(ErrorKind::FailpointCreation))
        );
    }

    let err = coordinator
        .enqueue(recorder.put("c", "value"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CoordinatorClosed);
}

#[tokio::test]
async fn transaction_creation_failure_during_drain_loop_is_fatal() {
    init_test_tracing();
    let mut failpoints = ScopedFailpoints::setup(&[]);
    let (coordinator, _store) = drain_queue_coordinator(1, 0);
    let recorder = UnitRecorder::new();

    // The first round is dispatched before the failpoint is enabled.
    for name in ["a", "b", "c", "d"] {
        coordinator.enqueue(recorder.put(name, "value")).unwrap();
    }
    failpoints.configure(MEMORY_CREATE_TRANSACTION_FP, "return(creation)");

    coordinator.wait_until_idle().await;
    recorder.wait_for_outcomes(4).await;

    assert!(coordinator.is_closed());
    assert_eq!(recorder.outcome_of("a"), Some(UnitOutcome::Committed));
    assert_eq!(recorder.outcome_of("b"), Some(UnitOutcome::Committed));
    for name in ["c", "d"] {
        assert_eq!(
            recorder.outcome_of(name),
            Some(UnitOutcome::RolledBack(ErrorKind::FailpointCreation))
        );
    }
}

#[tokio::test]
async fn injected_commit_failure_rolls_back_drain_round() {
    init_test_tracing();
    let _failpoints = ScopedFailpoints::setup(&[(MEMORY_COMMIT_FP, "1*return")]);
    let (coordinator, store) = drain_queue_coordinator(0, 0);
    let recorder = UnitRecorder::new();

    coordinator.enqueue(recorder.put("lost", "value")).unwrap();
    recorder.wait_for_outcomes(1).await;
    coordinator.enqueue(recorder.put("kept", "value")).unwrap();
    recorder.wait_for_outcomes(2).await;

    assert_eq!(
        recorder.outcome_of("lost"),
        Some(UnitOutcome::RolledBack(ErrorKind::FailpointCommit))
    );
    assert_eq!(recorder.outcome_of("kept"), Some(UnitOutcome::Committed));
    assert!(store.get("lost").await.is_none());
    assert!(!coordinator.is_closed());
}

#[tokio::test]
async fn register_surfaces_transaction_creation_failure() {
    init_test_tracing();
    let mut failpoints =
        ScopedFailpoints::setup(&[(MEMORY_CREATE_TRANSACTION_FP, "return(creation)")]);
    let (coordinator, store) = batch_register_coordinator(1, 0);

    let err = coordinator.register().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailpointCreation);
    failpoints.remove(MEMORY_CREATE_TRANSACTION_FP);

    // The failed registration released its gate permit, so completion still proceeds.
    let contribution = coordinator.register().await.unwrap();
    coordinator.report(contribution, 1, None).await.unwrap();
    assert_eq!(store.commits().await, 1);
}

#[tokio::test(start_paused = true)]
async fn alarm_swallows_commit_failure() {
    init_test_tracing();
    let _failpoints = ScopedFailpoints::setup(&[(MEMORY_COMMIT_FP, "1*return")]);
    let (coordinator, store) = batch_register_coordinator(10, 100);
    let listener = RecordingListener::new();

    let contribution = coordinator.register().await.unwrap();
    coordinator
        .report(contribution, 1, Some(listener.clone()))
        .await
        .unwrap();

    sleep(Duration::from_millis(150)).await;
    listener.wait_for_outcomes(1).await;

    assert_eq!(listener.rolled_back(), 1);
    assert_eq!(store.commits().await, 0);
    assert_eq!(coordinator.pending_size(), 0);
    assert!(!coordinator.has_scheduled_alarm());
}
