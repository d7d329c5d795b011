use std::collections::HashSet;
use std::time::Duration;

use batcher::coordinator::batch::SharedBatchListener;
use batcher::error::{BatchResult, ErrorKind};
use batcher::test_utils::coordinator::batch_register_coordinator;
use batcher::test_utils::listener::{ListenerEvent, PanickingListener, RecordingListener};
use batcher::transaction::base::{Transaction, TransactionId};
use batcher::transaction::memory::MemoryTransaction;
use telemetry::init_test_tracing;
use tokio::time::sleep;

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_producers_share_one_transaction_and_listener() {
    init_test_tracing();
    let (coordinator, store) = batch_register_coordinator(3, 100);
    let listener = RecordingListener::new();

    let mut handles = Vec::new();
    for producer in 0..3 {
        let coordinator = coordinator.clone();
        let listener: SharedBatchListener<MemoryTransaction> = listener.clone();

        handles.push(tokio::spawn(async move {
            let contribution = coordinator.register().await?;
            let transaction_id = contribution.transaction().id();
            contribution
                .transaction()
                .put(format!("producer-{producer}"), "done")
                .await?;
            coordinator.report(contribution, 1, Some(listener)).await?;

            BatchResult::Ok(transaction_id)
        }));
    }

    let mut transaction_ids = HashSet::<TransactionId>::new();
    for handle in handles {
        transaction_ids.insert(handle.await.unwrap().unwrap());
    }

    assert_eq!(transaction_ids.len(), 1);
    assert_eq!(store.commits().await, 1);
    assert_eq!(store.entries().await.len(), 3);
    assert_eq!(listener.precommits(), 1);
    assert_eq!(listener.committed(), 1);
    assert_eq!(listener.rolled_back(), 0);
    assert_eq!(coordinator.pending_size(), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_batch_is_committed_by_alarm() {
    init_test_tracing();
    let (coordinator, store) = batch_register_coordinator(3, 100);
    let first = RecordingListener::new();
    let second = RecordingListener::new();

    for listener in [&first, &second] {
        let contribution = coordinator.register().await.unwrap();
        contribution.transaction().put("key", "value").await.unwrap();
        coordinator
            .report(contribution, 1, Some(listener.clone()))
            .await
            .unwrap();
    }

    assert_eq!(coordinator.pending_size(), 2);
    assert!(coordinator.has_scheduled_alarm());
    assert_eq!(store.commits().await, 0);

    sleep(Duration::from_millis(150)).await;
    first.wait_for_outcomes(1).await;
    second.wait_for_outcomes(1).await;

    assert_eq!(first.committed(), 1);
    assert_eq!(second.committed(), 1);
    assert_eq!(store.commits().await, 1);
    assert_eq!(coordinator.pending_size(), 0);
    assert!(!coordinator.has_scheduled_alarm());
}

#[tokio::test(start_paused = true)]
async fn next_alarm_is_scheduled_by_next_non_empty_batch() {
    init_test_tracing();
    let (coordinator, store) = batch_register_coordinator(10, 100);
    let listener = RecordingListener::new();

    for round in 1..=2u64 {
        let contribution = coordinator.register().await.unwrap();
        coordinator
            .report(contribution, 1, Some(listener.clone()))
            .await
            .unwrap();
        assert!(coordinator.has_scheduled_alarm());

        sleep(Duration::from_millis(150)).await;
        listener.wait_for_outcomes(round as usize).await;

        assert!(!coordinator.has_scheduled_alarm());
        assert_eq!(store.commits().await, round);
    }
}

#[tokio::test]
async fn reported_counts_accumulate_until_threshold() {
    init_test_tracing();
    let (coordinator, store) = batch_register_coordinator(5, 0);
    let listener = RecordingListener::new();

    for count in [2, 0, 2] {
        let contribution = coordinator.register().await.unwrap();
        coordinator
            .report(contribution, count, Some(listener.clone()))
            .await
            .unwrap();
    }
    assert_eq!(coordinator.pending_size(), 4);
    assert_eq!(store.commits().await, 0);

    let contribution = coordinator.register().await.unwrap();
    coordinator
        .report(contribution, 1, Some(listener.clone()))
        .await
        .unwrap();

    assert_eq!(store.commits().await, 1);
    assert_eq!(coordinator.pending_size(), 0);
    assert_eq!(
        listener.events()[1..],
        [ListenerEvent::Committed]
    );
}

#[tokio::test]
async fn commit_failure_reaches_reporter_and_every_listener() {
    init_test_tracing();
    let (coordinator, store) = batch_register_coordinator(2, 0);
    let first = RecordingListener::new();
    let second = RecordingListener::new();
    store.fail_next_commits(1).await;

    let contribution = coordinator.register().await.unwrap();
    contribution.transaction().put("lost", "value").await.unwrap();
    coordinator
        .report(contribution, 1, Some(first.clone()))
        .await
        .unwrap();

    let contribution = coordinator.register().await.unwrap();
    let err = coordinator
        .report(contribution, 1, Some(second.clone()))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CommitFailed);
    assert_eq!(first.rolled_back(), 1);
    assert_eq!(second.rolled_back(), 1);
    assert_eq!(first.committed() + second.committed(), 0);
    assert!(store.get("lost").await.is_none());

    // The failed batch is gone and the next one commits normally.
    let contribution = coordinator.register().await.unwrap();
    coordinator.report(contribution, 2, None).await.unwrap();
    assert_eq!(store.commits().await, 1);
}

#[tokio::test]
async fn explicit_completion_joins_extra_listener() {
    init_test_tracing();
    let (coordinator, store) = batch_register_coordinator(10, 0);
    let producer = RecordingListener::new();
    let flusher = RecordingListener::new();

    let contribution = coordinator.register().await.unwrap();
    coordinator
        .report(contribution, 1, Some(producer.clone()))
        .await
        .unwrap();
    coordinator
        .complete(true, Some(flusher.clone()))
        .await
        .unwrap();

    assert_eq!(store.commits().await, 1);
    assert_eq!(producer.committed(), 1);
    assert_eq!(flusher.precommits(), 1);
    assert_eq!(flusher.committed(), 1);

    // Nothing pending: the extra listener is told it committed without a new commit.
    coordinator
        .complete(true, Some(flusher.clone()))
        .await
        .unwrap();
    assert_eq!(store.commits().await, 1);
    assert_eq!(flusher.committed(), 2);
    assert_eq!(flusher.precommits(), 1);
}

#[tokio::test]
async fn close_flushes_pending_batch_and_rejects_producers() {
    init_test_tracing();
    let (coordinator, store) = batch_register_coordinator(10, 1000);
    let listener = RecordingListener::new();

    let contribution = coordinator.register().await.unwrap();
    contribution.transaction().put("key", "value").await.unwrap();
    coordinator
        .report(contribution, 1, Some(listener.clone()))
        .await
        .unwrap();

    coordinator.close().await.unwrap();

    assert!(coordinator.is_closed());
    assert!(!coordinator.has_scheduled_alarm());
    assert_eq!(listener.committed(), 1);
    assert_eq!(store.get("key").await.as_deref(), Some(&b"value"[..]));

    let err = coordinator.register().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CoordinatorClosed);
}

#[tokio::test]
async fn panicking_listener_does_not_stop_batch_notifications() {
    init_test_tracing();
    let (coordinator, store) = batch_register_coordinator(2, 0);
    let panicking = PanickingListener::new();
    let recording = RecordingListener::new();

    let contribution = coordinator.register().await.unwrap();
    contribution.transaction().put("first", "value").await.unwrap();
    coordinator
        .report(contribution, 1, Some(panicking.clone()))
        .await
        .unwrap();

    let contribution = coordinator.register().await.unwrap();
    coordinator
        .report(contribution, 1, Some(recording.clone()))
        .await
        .unwrap();

    assert_eq!(store.commits().await, 1);
    assert_eq!(recording.committed(), 1);
    assert_eq!(coordinator.pending_size(), 0);

    // The gate was released, so the next batch proceeds normally.
    let contribution = coordinator.register().await.unwrap();
    coordinator.report(contribution, 2, None).await.unwrap();
    assert_eq!(store.commits().await, 2);
}

#[tokio::test]
async fn register_surfaces_store_creation_failure() {
    init_test_tracing();
    let (coordinator, store) = batch_register_coordinator(1, 0);
    store.fail_next_creations(1);

    let err = coordinator.register().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransactionCreationFailed);

    let contribution = coordinator.register().await.unwrap();
    coordinator.report(contribution, 1, None).await.unwrap();
    assert_eq!(store.commits().await, 1);
}
