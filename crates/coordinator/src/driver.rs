//! Coordinator driver loop
//!
//! Polls the ledger for the current round and keeps advancing it until it
//! reaches a terminal state, sleeping through the scheduler in between.

use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::persistence::EngineStore;
use crate::retry::RetryPolicy;
use crate::scheduler::{Scheduler, Shutdown};
use crate::state_machine::{Collaborators, RoundStateMachine};
use fedchain_bridge::LedgerClient;
use fedchain_types::{RoundId, RoundState, RoundStatus};
use std::sync::Arc;

pub struct Coordinator {
    machine: RoundStateMachine,
    ledger: Arc<dyn LedgerClient>,
    scheduler: Arc<dyn Scheduler>,
    retry: RetryPolicy,
    poll_interval_ms: i64,
    shutdown: Shutdown,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, deps: Collaborators, store: Arc<EngineStore>) -> Result<Self> {
        let ledger = deps.ledger.clone();
        let scheduler = deps.scheduler.clone();
        let retry = RetryPolicy::new(&config.retry);
        let poll_interval_ms = config.poll_interval_ms as i64;
        let machine = RoundStateMachine::new(config, deps, store)?;
        Ok(Self {
            machine,
            ledger,
            scheduler,
            retry,
            poll_interval_ms,
            shutdown: Shutdown::new(),
        })
    }

    /// Handle that cancels the loop's pending waits
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn machine(&self) -> &RoundStateMachine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut RoundStateMachine {
        &mut self.machine
    }

    pub fn round_status(&self, round_id: RoundId) -> Option<RoundStatus> {
        self.machine.status(round_id).ok()
    }

    /// Drive one round to `Closed` or `Failed`
    ///
    /// Unfinished rounds restored from the engine store come first; otherwise
    /// the ledger's current round is picked up once it is new.
    pub async fn advance_one_round(&mut self) -> Result<RoundStatus> {
        let round_id = self.next_round().await?;
        tracing::debug!("Driving round {}", round_id);

        loop {
            let deadline = match self.machine.advance(round_id).await {
                Ok(state) if state.is_terminal() => return self.machine.status(round_id),
                Ok(RoundState::AwaitingQuorum) => {
                    let next_poll = self.scheduler.now_millis() + self.poll_interval_ms;
                    let end_time = self
                        .machine
                        .round(round_id)
                        .map_or(next_poll, |r| r.end_time * 1000);
                    next_poll.min(end_time)
                }
                Ok(_) => self.scheduler.now_millis() + self.poll_interval_ms,
                Err(e) if e.is_transient() => {
                    tracing::warn!("Round {}: retrying next poll: {}", round_id, e);
                    self.scheduler.now_millis() + self.poll_interval_ms
                }
                Err(e) => return Err(e),
            };
            self.scheduler.wait_until(deadline, &self.shutdown).await?;
        }
    }

    /// Drive `n` consecutive rounds
    pub async fn run_for_n_rounds(&mut self, n: usize) -> Result<Vec<RoundStatus>> {
        let mut statuses = Vec::with_capacity(n);
        for _ in 0..n {
            let status = self.advance_one_round().await?;
            tracing::info!("{}", status);
            statuses.push(status);
        }
        Ok(statuses)
    }

    async fn next_round(&mut self) -> Result<RoundId> {
        if let Some(round_id) = self.machine.unfinished_rounds().first() {
            return Ok(*round_id);
        }

        // Rounds at or below this id are already settled
        let processed = self.machine.last_processed_round()?;

        loop {
            let ledger = &self.ledger;
            let current = self
                .retry
                .run("ledger.current_round_id", move || ledger.current_round_id())
                .await;
            match current {
                Ok(0) => tracing::debug!("No round started yet"),
                Ok(round_id) if !self.machine.is_tracked(round_id) && processed.map_or(true, |p| round_id > p) => {
                    return Ok(round_id)
                }
                Ok(round_id) => tracing::debug!("Round {} already processed, waiting for the next", round_id),
                Err(e) if e.is_transient() => tracing::warn!("Polling current round failed: {}", e),
                Err(e) => return Err(e),
            }
            let deadline = self.scheduler.now_millis() + self.poll_interval_ms;
            self.scheduler.wait_until(deadline, &self.shutdown).await?;
        }
    }
}
