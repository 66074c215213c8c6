//! Round lifecycle tests
//!
//! Drive single rounds through the state machine:
//! - Quorum, aggregation, model commit and reward payout
//! - Deadline without quorum
//! - Data failures (missing or mismatched gradients)
//! - Ledger rejections and transient faults
//! - Lease contention and loss

use std::sync::Arc;
use std::time::Duration;

use fedchain_bridge::{LeaseProvider, MemoryLedger, ProofBundle, Trainer};
use fedchain_types::{FailureReason, RoundState};

use super::harness::{weights, Harness, LosingLeases};
use crate::{
    config::StrategyConfig,
    error::CoordinatorError,
    publisher::ModelPublisher,
    retry::RetryPolicy,
    state_machine::{Collaborators, RoundStateMachine},
};

#[tokio::test]
async fn test_full_round_commits_model_and_pays_rewards() {
    let h = Harness::new();
    let round_id = h.start_round(60, 3);
    let (alice, _) = h.submit(round_id, "alice", vec![1.0, 2.0]).await;
    let (bob, _) = h.submit(round_id, "bob", vec![3.0, 4.0]).await;
    let (carol, _) = h.submit(round_id, "carol", vec![5.0, 6.0]).await;

    let mut machine = h.machine();
    let state = machine.advance(round_id).await.unwrap();
    assert_eq!(state, RoundState::Closed);

    let round = machine.round(round_id).unwrap();
    assert!(round.finalized);
    assert!(round.failure.is_none());
    assert_eq!(machine.record(round_id).unwrap().aggregated_participants, Some(3));

    // Base is the trainer's zero model, so the new model is the mean gradient
    assert_eq!(h.committed_model(round_id).await, weights(vec![3.0, 4.0]));
    let commits = h.ledger.model_commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(Some(&commits[0].model_ref), round.model_ref.as_ref());
    assert_eq!(commits[0].model_uri, commits[0].model_ref.uri());

    for participant in [alice, bob, carol] {
        assert_eq!(h.ledger.balance(&participant), 100);
    }
    let paid: u128 = machine.reward_records(round_id).iter().map(|r| r.amount).sum();
    assert_eq!(paid, 300);
    assert_eq!(h.ledger.finalize_tx_count(), 1);
    assert_eq!(h.ledger.reward_tx_count(), 1);
    assert!(h.leases.holder(round_id).is_none());
    assert_eq!(h.store.last_processed_round().unwrap(), Some(round_id));
}

#[tokio::test]
async fn test_insufficient_participants_fail_at_deadline() {
    let h = Harness::new();
    let round_id = h.start_round(60, 3);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    h.submit(round_id, "bob", vec![2.0, 2.0]).await;

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::AwaitingQuorum);
    // Nothing changed externally: same state, no side effects
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::AwaitingQuorum);
    assert_eq!(machine.tracker().count(round_id), 2);

    h.clock.set(h.clock_now() + 60);
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Failed);

    let status = machine.status(round_id).unwrap();
    assert_eq!(
        status.failure,
        Some(FailureReason::InsufficientParticipants { have: 2, need: 3 })
    );
    assert!(machine.record(round_id).unwrap().aggregated_participants.is_none());
    assert!(h.ledger.model_commits().is_empty());
    assert_eq!(h.ledger.finalize_tx_count(), 0);
    // Only the two gradients were ever stored
    assert_eq!(h.content.upload_count(), 2);
    assert!(!machine.tracker().is_accepting(round_id));
}

#[tokio::test]
async fn test_advance_after_close_is_a_no_op() {
    let h = Harness::new();
    let round_id = h.start_round(60, 1);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Closed);
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Closed);
    assert_eq!(h.ledger.model_commits().len(), 1);
    assert_eq!(h.ledger.reward_tx_count(), 1);
}

#[tokio::test]
async fn test_late_submissions_reach_quorum() {
    let h = Harness::new();
    let round_id = h.start_round(60, 2);
    h.submit(round_id, "alice", vec![2.0, 0.0]).await;

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::AwaitingQuorum);

    h.clock.advance(Duration::from_secs(30));
    h.submit(round_id, "bob", vec![4.0, 0.0]).await;
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Closed);
    assert_eq!(h.committed_model(round_id).await, weights(vec![3.0, 0.0]));
}

#[tokio::test]
async fn test_empty_round_waits_for_submissions() {
    let h = Harness::new();
    let round_id = h.start_round(60, 1);

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::AwaitingQuorum);
    assert_eq!(machine.round(round_id).unwrap().min_participants, 1);

    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Closed);
}

#[tokio::test]
async fn test_missing_gradient_fails_round() {
    let h = Harness::new();
    let round_id = h.start_round(60, 2);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    let (bob, bob_ref) = h.submit(round_id, "bob", vec![2.0, 2.0]).await;
    assert!(h.content.remove(&bob_ref));

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Failed);
    assert_eq!(
        machine.status(round_id).unwrap().failure,
        Some(FailureReason::FetchFailed {
            participant: bob.to_string()
        })
    );
    assert!(h.ledger.model_commits().is_empty());
    // Lease is released on failure
    assert!(h.leases.holder(round_id).is_none());
}

#[tokio::test]
async fn test_overflowing_gradient_shape_fails_round() {
    let h = Harness::new();
    let round_id = h.start_round(60, 2);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;

    // One layer of shape [65536; 4] with no values, borsh-encoded by hand
    let mut blob = Vec::new();
    blob.extend_from_slice(&1u32.to_le_bytes());
    blob.extend_from_slice(&4u32.to_le_bytes());
    for _ in 0..4 {
        blob.extend_from_slice(&65_536u32.to_le_bytes());
    }
    blob.extend_from_slice(&0u32.to_le_bytes());
    let bundle = ProofBundle {
        proof: Vec::new(),
        public_inputs: Vec::new(),
    };
    let (mallory, _) = h.submit_blob(round_id, "mallory", blob, bundle).await;

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Failed);
    assert_eq!(
        machine.status(round_id).unwrap().failure,
        Some(FailureReason::MalformedUpdate {
            participant: mallory.to_string()
        })
    );
    assert!(h.ledger.model_commits().is_empty());
}

#[tokio::test]
async fn test_shape_mismatch_fails_round() {
    let h = Harness::new();
    let round_id = h.start_round(60, 2);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    h.submit(round_id, "bob", vec![1.0, 1.0, 1.0]).await;

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Failed);
    assert_eq!(machine.status(round_id).unwrap().failure, Some(FailureReason::ShapeMismatch));
}

#[tokio::test]
async fn test_transient_ledger_faults_are_retried() {
    let h = Harness::new();
    let round_id = h.start_round(60, 1);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    h.ledger.inject_transient_failures(2);

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Closed);
}

#[tokio::test]
async fn test_exhausted_retries_stall_without_failing() {
    let h = Harness::new();
    let round_id = h.start_round(60, 2);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::AwaitingQuorum);

    h.ledger.inject_transient_failures(100);
    let err = machine.advance(round_id).await.unwrap_err();
    assert!(err.is_transient());
    assert!(matches!(err, CoordinatorError::RetriesExhausted { .. }));
    assert_eq!(machine.status(round_id).unwrap().state, RoundState::AwaitingQuorum);

    h.ledger.inject_transient_failures(0);
    h.submit(round_id, "bob", vec![3.0, 3.0]).await;
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Closed);
}

#[tokio::test]
async fn test_finalize_rejected_fails_round() {
    let h = Harness::new();
    let round_id = h.start_round(60, 1);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    h.ledger.reject_finalize(true);

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Failed);
    assert!(matches!(
        machine.status(round_id).unwrap().failure,
        Some(FailureReason::FinalizeRejected(_))
    ));
    assert!(h.leases.holder(round_id).is_none());
}

#[tokio::test]
async fn test_round_finalized_elsewhere_is_not_refinalized() {
    let h = Harness::new();
    let round_id = h.start_round(60, 1);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    h.ledger.force_finalize(round_id).unwrap();

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Closed);
    assert_eq!(h.ledger.finalize_tx_count(), 0);
}

#[tokio::test]
async fn test_commit_rejected_fails_round() {
    let h = Harness::new();
    let round_id = h.start_round(60, 1);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    h.ledger.reject_model_commit(true);

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Failed);
    assert!(matches!(
        machine.status(round_id).unwrap().failure,
        Some(FailureReason::CommitRejected(_))
    ));
    assert_eq!(h.ledger.reward_tx_count(), 0);
    assert!(h.leases.holder(round_id).is_none());
}

#[tokio::test]
async fn test_rewards_rejected_fails_round() {
    let h = Harness::new();
    let round_id = h.start_round(60, 1);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    h.ledger.reject_rewards(true);

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Failed);
    assert!(matches!(
        machine.status(round_id).unwrap().failure,
        Some(FailureReason::RewardsRejected(_))
    ));
    // The model was still committed before settlement failed
    assert_eq!(h.ledger.model_commits().len(), 1);
}

#[tokio::test]
async fn test_prover_outage_stalls_in_committing() {
    let h = Harness::new();
    let round_id = h.start_round(60, 1);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    h.prover.set_down(true);

    let mut machine = h.machine();
    let err = machine.advance(round_id).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(machine.status(round_id).unwrap().state, RoundState::Committing);
    assert!(machine.round(round_id).unwrap().model_ref.is_some());

    h.prover.set_down(false);
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Closed);
    assert_eq!(h.ledger.model_commits().len(), 1);
}

#[tokio::test]
async fn test_lease_contention_stalls_in_finalizing() {
    let h = Harness::new();
    let round_id = h.start_round(60, 1);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    h.leases
        .acquire(round_id, "coordinator-other", Duration::from_secs(600))
        .await
        .unwrap()
        .unwrap();

    let mut machine = h.machine();
    let err = machine.advance(round_id).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::LeaseContended(id) if id == round_id));
    assert_eq!(machine.status(round_id).unwrap().state, RoundState::Finalizing);

    h.leases.revoke(round_id);
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Closed);
}

#[tokio::test]
async fn test_lost_lease_fails_round() {
    let h = Harness::new();
    let round_id = h.start_round(60, 1);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;

    let deps = Collaborators {
        leases: Arc::new(LosingLeases::default()),
        ..h.deps()
    };
    let mut machine = RoundStateMachine::new(h.config.clone(), deps, h.store.clone()).unwrap();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Failed);
    assert_eq!(machine.status(round_id).unwrap().failure, Some(FailureReason::LeaseLost));
    assert!(h.ledger.model_commits().is_empty());
}

#[tokio::test]
async fn test_trimmed_mean_ignores_outlier() {
    let mut h = Harness::new();
    h.config.strategy = StrategyConfig::TrimmedMean { trim: 1 };
    let round_id = h.start_round(60, 4);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    h.submit(round_id, "bob", vec![2.0, 2.0]).await;
    h.submit(round_id, "carol", vec![3.0, 3.0]).await;
    h.submit(round_id, "mallory", vec![1000.0, -1000.0]).await;

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Closed);
    assert_eq!(h.committed_model(round_id).await, weights(vec![2.5, 1.5]));
}

#[tokio::test]
async fn test_delta_applies_to_ledger_model() {
    let mut h = Harness::new();
    h.config.step_size = 0.5;

    // Seed a global model the way a deployment does
    let seeding = ModelPublisher::new(
        Arc::new(MemoryLedger::new()),
        h.content.clone(),
        h.prover.clone(),
        RetryPolicy::new(&h.config.retry),
        1.0,
        0.0,
    );
    let global_ref = seeding.store(&weights(vec![10.0, 10.0])).await.unwrap();
    h.ledger.set_current_model(global_ref);

    let round_id = h.start_round(60, 1);
    h.submit(round_id, "alice", vec![2.0, -2.0]).await;

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Closed);
    assert_eq!(h.committed_model(round_id).await, weights(vec![11.0, 9.0]));
    assert_eq!(h.trainer.weights(), weights(vec![10.0, 10.0]));
}
