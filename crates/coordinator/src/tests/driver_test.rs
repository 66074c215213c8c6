//! Coordinator driver loop tests on the manual clock

use fedchain_types::{FailureReason, RoundState};

use super::harness::Harness;
use crate::error::CoordinatorError;

#[tokio::test]
async fn test_advance_one_round_closes_current_round() {
    let h = Harness::new();
    let round_id = h.start_round(60, 2);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    h.submit(round_id, "bob", vec![2.0, 2.0]).await;

    let mut coordinator = h.coordinator();
    let status = coordinator.advance_one_round().await.unwrap();
    assert_eq!(status.round_id, round_id);
    assert_eq!(status.state, RoundState::Closed);
    assert_eq!(coordinator.round_status(round_id), Some(status));
    assert_eq!(coordinator.round_status(round_id + 1), None);
}

#[tokio::test]
async fn test_deadline_is_reached_through_scheduler() {
    let h = Harness::new();
    let round_id = h.start_round(10, 3);
    let end_time = h.clock_now() + 10;
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;

    let mut coordinator = h.coordinator();
    let status = coordinator.advance_one_round().await.unwrap();
    assert_eq!(status.state, RoundState::Failed);
    assert_eq!(
        status.failure,
        Some(FailureReason::InsufficientParticipants { have: 1, need: 3 })
    );
    // Waits never overshoot the round deadline
    assert_eq!(h.clock_now(), end_time);
}

#[tokio::test]
async fn test_consecutive_rounds() {
    let h = Harness::new();
    let mut coordinator = h.coordinator();

    let first = h.start_round(60, 1);
    h.submit(first, "alice", vec![1.0, 1.0]).await;
    let statuses = coordinator.run_for_n_rounds(1).await.unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].round_id, first);

    let second = h.start_round(60, 1);
    h.submit(second, "bob", vec![3.0, 3.0]).await;
    let status = coordinator.advance_one_round().await.unwrap();
    assert_eq!(status.round_id, second);
    assert_eq!(status.state, RoundState::Closed);
    assert_eq!(h.ledger.model_commits().len(), 2);

    // The second model builds on the first committed one
    assert_eq!(h.committed_model(second).await, super::harness::weights(vec![4.0, 4.0]));
}

#[tokio::test]
async fn test_shutdown_cancels_idle_polling() {
    let h = Harness::new();
    let mut coordinator = h.coordinator();
    coordinator.shutdown_handle().trigger();

    let err = coordinator.advance_one_round().await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Cancelled));
}

#[tokio::test]
async fn test_processed_round_is_not_picked_again() {
    let h = Harness::new();
    let round_id = h.start_round(60, 1);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;

    let mut coordinator = h.coordinator();
    coordinator.advance_one_round().await.unwrap();

    // Only the closed round exists: the loop keeps polling until cancelled
    coordinator.shutdown_handle().trigger();
    let err = coordinator.advance_one_round().await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Cancelled));
    assert_eq!(h.ledger.model_commits().len(), 1);
}

#[tokio::test]
async fn test_round_at_or_below_last_processed_is_skipped() {
    let h = Harness::new();
    let round_id = h.start_round(60, 1);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    // Settled by an earlier run whose round records are gone
    h.store.set_last_processed_round(round_id).unwrap();

    let mut coordinator = h.coordinator();
    coordinator.shutdown_handle().trigger();
    let err = coordinator.advance_one_round().await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Cancelled));
    assert!(!coordinator.machine().is_tracked(round_id));
    assert!(h.ledger.model_commits().is_empty());
}
