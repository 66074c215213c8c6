//! Crash/restart recovery from the sled engine store

use std::sync::Arc;

use fedchain_types::{FailureReason, RoundState};
use tempfile::tempdir;

use super::harness::{weights, Harness};
use crate::persistence::EngineStore;

fn open_harness(path: &std::path::Path) -> Harness {
    Harness::with_store(Arc::new(EngineStore::open(path).unwrap()))
}

#[tokio::test]
async fn test_restart_resumes_round_awaiting_quorum() {
    let dir = tempdir().unwrap();
    let h = open_harness(dir.path());
    let round_id = h.start_round(60, 3);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    h.submit(round_id, "bob", vec![2.0, 2.0]).await;

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::AwaitingQuorum);
    drop(machine);

    let h = h.restarted(dir.path());
    let mut machine = h.machine();
    assert_eq!(machine.unfinished_rounds(), vec![round_id]);
    assert_eq!(machine.tracker().count(round_id), 2);
    assert!(machine.tracker().is_accepting(round_id));

    h.submit(round_id, "carol", vec![6.0, 6.0]).await;
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Closed);
    assert_eq!(machine.tracker().count(round_id), 3);
    assert_eq!(h.committed_model(round_id).await, weights(vec![3.0, 3.0]));
}

#[tokio::test]
async fn test_restart_in_committing_commits_once() {
    let dir = tempdir().unwrap();
    let h = open_harness(dir.path());
    let round_id = h.start_round(60, 1);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    h.prover.set_down(true);

    let mut machine = h.machine();
    assert!(machine.advance(round_id).await.is_err());
    assert_eq!(machine.status(round_id).unwrap().state, RoundState::Committing);
    let published = machine.round(round_id).unwrap().model_ref.clone();
    drop(machine);
    assert_eq!(h.store.load_leases().unwrap().len(), 1);

    let h = h.restarted(dir.path());
    h.prover.set_down(false);
    let mut machine = h.machine();
    assert_eq!(machine.round(round_id).unwrap().model_ref, published);
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Closed);

    let commits = h.ledger.model_commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(Some(commits[0].model_ref.clone()), published);
    assert!(h.store.load_leases().unwrap().is_empty());
    assert!(h.leases.holder(round_id).is_none());
}

#[tokio::test]
async fn test_restart_after_confirmed_transactions_does_not_repeat_them() {
    let dir = tempdir().unwrap();
    let h = open_harness(dir.path());
    let round_id = h.start_round(60, 2);
    h.submit(round_id, "alice", vec![1.0, 1.0]).await;
    h.submit(round_id, "bob", vec![3.0, 3.0]).await;

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Closed);
    drop(machine);

    // Crash after both transactions confirmed but before the state was saved
    let mut record = h.store.load_round(round_id).unwrap().unwrap();
    record.round.state = RoundState::Committing;
    record.rewards.clear();
    h.store.save_round(&record).unwrap();

    let h = h.restarted(dir.path());
    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Closed);
    assert_eq!(h.ledger.model_commits().len(), 1);
    assert_eq!(h.ledger.reward_tx_count(), 1);
    assert_eq!(machine.reward_records(round_id).len(), 2);
    assert_eq!(h.ledger.balance(&fedchain_types::Address::from_label("bob")), 150);
}

#[tokio::test]
async fn test_failed_round_stays_failed_after_restart() {
    let dir = tempdir().unwrap();
    let h = open_harness(dir.path());
    let round_id = h.start_round(60, 2);

    let mut machine = h.machine();
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::AwaitingQuorum);
    h.clock.set(h.clock_now() + 120);
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Failed);
    drop(machine);

    let h = h.restarted(dir.path());
    let mut machine = h.machine();
    assert!(machine.unfinished_rounds().is_empty());
    assert_eq!(machine.advance(round_id).await.unwrap(), RoundState::Failed);
    assert_eq!(
        machine.status(round_id).unwrap().failure,
        Some(FailureReason::InsufficientParticipants { have: 0, need: 2 })
    );
    assert_eq!(h.store.last_processed_round().unwrap(), Some(round_id));
}
