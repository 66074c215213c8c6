//! Round State Machine
//!
//! Drives a round through its lifecycle:
//!
//! ```text
//! Pending -> Open -> AwaitingQuorum -> Finalizing -> Aggregating
//!         -> Committing -> Distributing -> Closed
//! ```
//!
//! with `Failed` reachable from any non-terminal state. Every transition is
//! written to the engine store before `advance` returns, and every ledger
//! transaction step first checks the ledger snapshot, so re-running a step
//! after a crash never submits the same transaction twice.

use crate::aggregation::AggregationEngine;
use crate::config::CoordinatorConfig;
use crate::context::AggregationContext;
use crate::error::{CoordinatorError, ErrorClass, Result};
use crate::persistence::{EngineStore, LeaseRecord, RoundRecord};
use crate::publisher::ModelPublisher;
use crate::retry::RetryPolicy;
use crate::rewards::RewardDistributor;
use crate::scheduler::Scheduler;
use crate::tracker::SubmissionTracker;
use fedchain_bridge::{ContentStore, Lease, LeaseProvider, LedgerClient, Prover, Trainer};
use fedchain_types::{
    FailureReason, RewardRecord, Round, RoundId, RoundSnapshot, RoundState, RoundStatus, Submission, Timestamp,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// External collaborators injected into the engine
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn LedgerClient>,
    pub store: Arc<dyn ContentStore>,
    pub prover: Arc<dyn Prover>,
    pub trainer: Arc<dyn Trainer>,
    pub leases: Arc<dyn LeaseProvider>,
    pub scheduler: Arc<dyn Scheduler>,
}

/// Outcome of running the work for one state
enum Step {
    Advance(RoundState),
    Fail(FailureReason),
    /// Nothing more to do until external state changes
    Wait,
}

pub struct RoundStateMachine {
    config: CoordinatorConfig,
    deps: Collaborators,
    retry: RetryPolicy,
    tracker: SubmissionTracker,
    engine: AggregationEngine,
    publisher: ModelPublisher,
    rewards: RewardDistributor,
    store: Arc<EngineStore>,
    rounds: BTreeMap<RoundId, RoundRecord>,
    leases: HashMap<RoundId, Lease>,
}

impl RoundStateMachine {
    /// Build the engine, restoring rounds, submissions and leases from `store`
    pub fn new(config: CoordinatorConfig, deps: Collaborators, store: Arc<EngineStore>) -> Result<Self> {
        let retry = RetryPolicy::new(&config.retry);
        let engine = config.strategy.build();
        let publisher = ModelPublisher::new(
            deps.ledger.clone(),
            deps.store.clone(),
            deps.prover.clone(),
            retry.clone(),
            config.step_size,
            config.reported_accuracy,
        );
        let rewards = RewardDistributor::new(deps.ledger.clone(), config.reward_pool, retry.clone());

        let rounds: BTreeMap<RoundId, RoundRecord> = store
            .load_rounds()?
            .into_iter()
            .map(|r| (r.round.id, r))
            .collect();

        let mut tracker = SubmissionTracker::with_store(store.clone());
        tracker.restore(store.load_submissions()?);
        for record in rounds.values() {
            if record.round.state.accepts_submissions() {
                tracker.open_round(record.round.id);
            }
        }

        let leases: HashMap<RoundId, Lease> = store
            .load_leases()?
            .into_iter()
            .map(|l| (l.round_id, Lease::from(l)))
            .collect();

        if !rounds.is_empty() {
            tracing::info!(
                "Restored {} rounds ({} unfinished), {} held leases",
                rounds.len(),
                rounds.values().filter(|r| !r.round.state.is_terminal()).count(),
                leases.len()
            );
        }

        Ok(Self {
            config,
            deps,
            retry,
            tracker,
            engine,
            publisher,
            rewards,
            store,
            rounds,
            leases,
        })
    }

    /// Start tracking a round the ledger reports; no-op if already tracked
    pub async fn observe(&mut self, round_id: RoundId) -> Result<RoundState> {
        if let Some(record) = self.rounds.get(&round_id) {
            return Ok(record.round.state);
        }
        let snapshot = self.snapshot(round_id).await?;
        let record = RoundRecord::new(Round::from_snapshot(&snapshot));
        self.store.save_round(&record)?;
        self.rounds.insert(round_id, record);
        tracing::debug!("Observed round {} (ends at {})", round_id, snapshot.end_time);
        Ok(RoundState::Pending)
    }

    /// Drive a round as far as currently possible
    ///
    /// Returns the state the round rests in. A transient error that outlived
    /// its retries is returned as `Err` and leaves the round in its prior
    /// state; the next call resumes from there.
    pub async fn advance(&mut self, round_id: RoundId) -> Result<RoundState> {
        self.observe(round_id).await?;

        loop {
            let state = self.state_of(round_id)?;
            if state.is_terminal() {
                return Ok(state);
            }

            let step = match self.step(round_id, state).await {
                Ok(step) => step,
                Err(e) if e.class() == ErrorClass::Transient => {
                    tracing::warn!("Round {} stalled in {}: {}", round_id, state, e);
                    return Err(e);
                }
                Err(e) => Step::Fail(e.failure_reason()),
            };

            match step {
                Step::Advance(next) => self.transition(round_id, next)?,
                Step::Fail(reason) => self.fail(round_id, reason).await?,
                Step::Wait => return Ok(state),
            }
        }
    }

    pub fn status(&self, round_id: RoundId) -> Result<RoundStatus> {
        self.rounds
            .get(&round_id)
            .map(|r| r.round.status())
            .ok_or(CoordinatorError::UnknownRound(round_id))
    }

    pub fn round(&self, round_id: RoundId) -> Option<&Round> {
        self.rounds.get(&round_id).map(|r| &r.round)
    }

    pub fn record(&self, round_id: RoundId) -> Option<&RoundRecord> {
        self.rounds.get(&round_id)
    }

    pub fn tracker(&self) -> &SubmissionTracker {
        &self.tracker
    }

    pub fn reward_records(&self, round_id: RoundId) -> &[RewardRecord] {
        self.rounds
            .get(&round_id)
            .map(|r| r.rewards.as_slice())
            .unwrap_or(&[])
    }

    /// Tracked rounds not yet Closed or Failed, oldest first
    pub fn unfinished_rounds(&self) -> Vec<RoundId> {
        self.rounds
            .values()
            .filter(|r| !r.round.state.is_terminal())
            .map(|r| r.round.id)
            .collect()
    }

    /// Highest round id that reached `Closed` or `Failed`, as persisted
    pub fn last_processed_round(&self) -> Result<Option<RoundId>> {
        Ok(self.store.last_processed_round()?)
    }

    pub fn is_tracked(&self, round_id: RoundId) -> bool {
        self.rounds.contains_key(&round_id)
    }

    pub fn now(&self) -> Timestamp {
        self.deps.scheduler.now()
    }

    fn state_of(&self, round_id: RoundId) -> Result<RoundState> {
        self.rounds
            .get(&round_id)
            .map(|r| r.round.state)
            .ok_or(CoordinatorError::UnknownRound(round_id))
    }

    fn record_mut(&mut self, round_id: RoundId) -> Result<&mut RoundRecord> {
        self.rounds
            .get_mut(&round_id)
            .ok_or(CoordinatorError::UnknownRound(round_id))
    }

    /// Apply `update` to the round record and persist it
    fn update_record<F>(&mut self, round_id: RoundId, update: F) -> Result<()>
    where
        F: FnOnce(&mut RoundRecord),
    {
        let record = self.record_mut(round_id)?;
        update(record);
        let record = record.clone();
        self.store.save_round(&record)?;
        Ok(())
    }

    fn transition(&mut self, round_id: RoundId, next: RoundState) -> Result<()> {
        let from = self.state_of(round_id)?;
        if !from.can_transition_to(next) {
            return Err(CoordinatorError::IllegalTransition {
                round_id,
                from,
                to: next,
            });
        }
        self.update_record(round_id, |r| r.round.state = next)?;
        tracing::info!("Round {}: {} -> {}", round_id, from, next);

        if next == RoundState::Closed {
            self.store.set_last_processed_round(round_id)?;
            tracing::info!("Round {} closed", round_id);
        }
        Ok(())
    }

    async fn fail(&mut self, round_id: RoundId, reason: FailureReason) -> Result<()> {
        let from = self.state_of(round_id)?;
        self.tracker.close_round(round_id);
        self.update_record(round_id, |r| {
            r.round.state = RoundState::Failed;
            r.round.failure = Some(reason.clone());
        })?;
        self.release_lease(round_id).await;
        self.store.set_last_processed_round(round_id)?;

        match reason {
            FailureReason::InsufficientParticipants { .. } => {
                tracing::warn!("Round {} failed in {}: {}", round_id, from, reason)
            }
            _ => tracing::error!("Round {} failed in {}: {}", round_id, from, reason),
        }
        Ok(())
    }

    async fn step(&mut self, round_id: RoundId, state: RoundState) -> Result<Step> {
        match state {
            RoundState::Pending => self.start(round_id).await,
            RoundState::Open => Ok(Step::Advance(RoundState::AwaitingQuorum)),
            RoundState::AwaitingQuorum => self.await_quorum(round_id).await,
            RoundState::Finalizing => self.finalize(round_id).await,
            RoundState::Aggregating => self.aggregate(round_id).await,
            RoundState::Committing => self.commit(round_id).await,
            RoundState::Distributing => self.distribute(round_id).await,
            RoundState::Closed | RoundState::Failed => Ok(Step::Wait),
        }
    }

    async fn snapshot(&self, round_id: RoundId) -> Result<RoundSnapshot> {
        let ledger = &self.deps.ledger;
        self.retry
            .run("ledger.round_info", move || ledger.round_info(round_id))
            .await
    }

    /// Pending: refresh round parameters and open the tracker
    async fn start(&mut self, round_id: RoundId) -> Result<Step> {
        let snapshot = self.snapshot(round_id).await?;
        self.update_record(round_id, |r| {
            r.round.start_time = snapshot.start_time;
            r.round.end_time = snapshot.end_time;
            r.round.min_participants = snapshot.min_participants;
        })?;
        self.tracker.open_round(round_id);
        tracing::info!(
            "Round {} started: window {}..{}, {} participants required",
            round_id,
            snapshot.start_time,
            snapshot.end_time,
            snapshot.min_participants
        );
        Ok(Step::Advance(RoundState::Open))
    }

    /// Record ledger submissions the tracker has not seen yet
    async fn sync_submissions(&mut self, round_id: RoundId) -> Result<usize> {
        let ledger = self.deps.ledger.clone();
        let participants = self
            .retry
            .run("ledger.participants", || ledger.participants(round_id))
            .await?;

        let mut recorded = 0;
        for participant in participants {
            if self.tracker.contains(round_id, &participant) {
                continue;
            }
            let entry = {
                let ledger = &ledger;
                let participant = &participant;
                self.retry
                    .run("ledger.submission", move || ledger.submission(round_id, participant))
                    .await?
            };
            let Some(entry) = entry else { continue };

            let submission = Submission::from_ledger(round_id, entry, self.now());
            if self.tracker.record(submission)?.accepted {
                recorded += 1;
            }
        }
        Ok(recorded)
    }

    /// AwaitingQuorum: finalize on quorum, fail once the deadline passes without it
    async fn await_quorum(&mut self, round_id: RoundId) -> Result<Step> {
        let snapshot = self.snapshot(round_id).await?;
        let round = self.state_round(round_id)?;
        if round.min_participants != snapshot.min_participants || round.end_time != snapshot.end_time {
            self.update_record(round_id, |r| {
                r.round.min_participants = snapshot.min_participants;
                r.round.end_time = snapshot.end_time;
            })?;
        }

        let new = self.sync_submissions(round_id).await?;
        let have = self.tracker.count(round_id) as u64;
        let need = snapshot.min_participants;
        let now = self.now();
        tracing::debug!(
            "Round {}: {} new submissions, {}/{} (now {}, ends {})",
            round_id,
            new,
            have,
            need,
            now,
            snapshot.end_time
        );

        if have >= need {
            self.tracker.close_round(round_id);
            tracing::info!("Round {}: quorum reached ({}/{})", round_id, have, need);
            return Ok(Step::Advance(RoundState::Finalizing));
        }
        if now >= snapshot.end_time || snapshot.finalized {
            self.tracker.close_round(round_id);
            return Ok(Step::Fail(FailureReason::InsufficientParticipants { have, need }));
        }
        Ok(Step::Wait)
    }

    fn state_round(&self, round_id: RoundId) -> Result<&Round> {
        self.round(round_id).ok_or(CoordinatorError::UnknownRound(round_id))
    }

    /// Finalizing: confirm finalization on the ledger, then take the lease
    async fn finalize(&mut self, round_id: RoundId) -> Result<Step> {
        let snapshot = self.snapshot(round_id).await?;
        if !snapshot.finalized {
            let ledger = &self.deps.ledger;
            let submitted = self
                .retry
                .run("ledger.submit_finalize", move || ledger.submit_finalize(round_id))
                .await;
            match submitted {
                Ok(tx) => tracing::info!("Round {}: finalized (tx {}, block {})", round_id, tx.tx_hash, tx.block),
                Err(e) if e.is_transaction_rejection() => {
                    // Someone else may have finalized in the meantime
                    if !self.snapshot(round_id).await?.finalized {
                        return Ok(Step::Fail(FailureReason::FinalizeRejected(e.to_string())));
                    }
                    tracing::debug!("Round {} already finalized on the ledger", round_id);
                }
                Err(e) => return Err(e),
            }
        }
        self.update_record(round_id, |r| r.round.finalized = true)?;

        self.acquire_lease(round_id).await?;
        Ok(Step::Advance(RoundState::Aggregating))
    }

    async fn acquire_lease(&mut self, round_id: RoundId) -> Result<()> {
        let leases = &self.deps.leases;
        let holder = self.config.instance_id.as_str();
        let ttl = self.config.lease_ttl();
        let lease = self
            .retry
            .run("lease.acquire", move || leases.acquire(round_id, holder, ttl))
            .await?
            .ok_or(CoordinatorError::LeaseContended(round_id))?;

        self.store.save_lease(&LeaseRecord::from(&lease))?;
        tracing::debug!("Round {}: holding lease (token {})", round_id, lease.token);
        self.leases.insert(round_id, lease);
        Ok(())
    }

    /// Fail with `LeaseLost` unless this instance still holds the round's lease
    async fn ensure_lease(&self, round_id: RoundId) -> Result<()> {
        let lease = self
            .leases
            .get(&round_id)
            .ok_or(CoordinatorError::LeaseLost(round_id))?;
        let leases = &self.deps.leases;
        let held = self
            .retry
            .run("lease.is_held", move || leases.is_held(lease))
            .await?;
        if !held {
            return Err(CoordinatorError::LeaseLost(round_id));
        }
        Ok(())
    }

    async fn release_lease(&mut self, round_id: RoundId) {
        let Some(lease) = self.leases.remove(&round_id) else {
            return;
        };
        let leases = &self.deps.leases;
        let lease_ref = &lease;
        if let Err(e) = self.retry.run("lease.release", move || leases.release(lease_ref)).await {
            // The lease still expires after its TTL
            tracing::warn!("Round {}: failed to release lease: {}", round_id, e);
        }
        if let Err(e) = self.store.remove_lease(round_id) {
            tracing::warn!("Round {}: failed to drop lease record: {}", round_id, e);
        }
    }

    /// Aggregating: merge the round's updates and publish the new model
    async fn aggregate(&mut self, round_id: RoundId) -> Result<Step> {
        self.ensure_lease(round_id).await?;

        let submissions = self.tracker.list(round_id).to_vec();
        let context = AggregationContext::new(
            round_id,
            self.deps.store.clone(),
            self.retry.clone(),
            self.config.fetch_concurrency,
        );
        let result = context.run(&submissions, &self.engine).await?;
        tracing::info!(
            "Round {}: aggregated {} updates with {}",
            round_id,
            result.participant_count,
            self.engine.strategy_name()
        );

        let base = self.publisher.resolve_base(self.deps.trainer.as_ref()).await?;
        self.ensure_lease(round_id).await?;
        let model_ref = self
            .publisher
            .publish(round_id, &base, &result.merged_weights)
            .await?;

        let count = result.participant_count as u64;
        self.update_record(round_id, |r| {
            if r.round.model_ref.is_none() {
                r.round.model_ref = Some(model_ref);
            }
            r.aggregated_participants = Some(count);
        })?;
        Ok(Step::Advance(RoundState::Committing))
    }

    /// Committing: commit the model reference unless the ledger already has it
    async fn commit(&mut self, round_id: RoundId) -> Result<Step> {
        let Some(model_ref) = self.state_round(round_id)?.model_ref.clone() else {
            return Ok(Step::Fail(FailureReason::Unrecoverable(
                "committing without a published model".to_string(),
            )));
        };

        let snapshot = self.snapshot(round_id).await?;
        match snapshot.model_ref {
            Some(ref committed) if *committed == model_ref => {
                tracing::debug!("Round {}: model {} already committed", round_id, model_ref);
            }
            Some(other) => {
                return Ok(Step::Fail(FailureReason::CommitRejected(format!(
                    "ledger holds model {} for this round",
                    other
                ))));
            }
            None => {
                self.ensure_lease(round_id).await?;
                let weights = self.publisher.load(&model_ref).await?;
                if let Err(e) = self.publisher.commit(round_id, &model_ref, &weights).await {
                    if !e.is_transaction_rejection() {
                        return Err(e);
                    }
                    if self.snapshot(round_id).await?.model_ref.as_ref() != Some(&model_ref) {
                        return Ok(Step::Fail(FailureReason::CommitRejected(e.to_string())));
                    }
                }
            }
        }

        self.release_lease(round_id).await;
        Ok(Step::Advance(RoundState::Distributing))
    }

    /// Distributing: pay the round's participants unless already paid
    async fn distribute(&mut self, round_id: RoundId) -> Result<Step> {
        let participants = self.tracker.participants(round_id);
        let records = self.rewards.distribute(round_id, &participants)?;

        let snapshot = self.snapshot(round_id).await?;
        if snapshot.rewards_distributed {
            tracing::debug!("Round {}: rewards already distributed", round_id);
        } else if let Err(e) = self.rewards.settle(round_id, &records).await {
            if !e.is_transaction_rejection() {
                return Err(e);
            }
            if !self.snapshot(round_id).await?.rewards_distributed {
                return Ok(Step::Fail(FailureReason::RewardsRejected(e.to_string())));
            }
        }

        self.update_record(round_id, |r| r.rewards = records)?;
        Ok(Step::Advance(RoundState::Closed))
    }
}
