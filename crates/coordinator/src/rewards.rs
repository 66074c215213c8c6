//! Reward Distributor - per-participant allocations for a closed round

use crate::error::Result;
use crate::retry::RetryPolicy;
use fedchain_bridge::LedgerClient;
use fedchain_types::{Address, RewardRecord, RoundId, TxHandle};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewardError {
    #[error("no participants to reward")]
    EmptyParticipantSet,

    #[error("allocations sum to {allocated}, pool is {pool}")]
    AllocationMismatch { allocated: u128, pool: u128 },
}

/// Splits a pool among participants
pub trait RewardPolicy: Send + Sync {
    /// Amounts in the same order as `participants`
    fn allocate(&self, pool: u128, participants: &[Address]) -> Result<Vec<u128>, RewardError>;
}

/// Equal shares; the remainder goes one unit each to the lowest addresses
#[derive(Debug, Default, Clone, Copy)]
pub struct EqualSplit;

impl RewardPolicy for EqualSplit {
    fn allocate(&self, pool: u128, participants: &[Address]) -> Result<Vec<u128>, RewardError> {
        if participants.is_empty() {
            return Err(RewardError::EmptyParticipantSet);
        }
        let n = participants.len() as u128;
        let share = pool / n;
        let remainder = (pool % n) as usize;

        let mut by_address: Vec<usize> = (0..participants.len()).collect();
        by_address.sort_by_key(|&i| participants[i]);

        let mut amounts = vec![share; participants.len()];
        for &i in by_address.iter().take(remainder) {
            amounts[i] += 1;
        }
        Ok(amounts)
    }
}

pub struct RewardDistributor {
    ledger: Arc<dyn LedgerClient>,
    policy: Box<dyn RewardPolicy>,
    pool: u128,
    retry: RetryPolicy,
}

impl RewardDistributor {
    pub fn new(ledger: Arc<dyn LedgerClient>, pool: u128, retry: RetryPolicy) -> Self {
        Self::with_policy(ledger, Box::new(EqualSplit), pool, retry)
    }

    pub fn with_policy(
        ledger: Arc<dyn LedgerClient>,
        policy: Box<dyn RewardPolicy>,
        pool: u128,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            policy,
            pool,
            retry,
        }
    }

    pub fn pool(&self) -> u128 {
        self.pool
    }

    /// Compute the round's allocations; they always sum to the pool
    pub fn distribute(&self, round_id: RoundId, participants: &[Address]) -> Result<Vec<RewardRecord>> {
        let amounts = self.policy.allocate(self.pool, participants)?;
        let allocated: u128 = amounts.iter().sum();
        if allocated != self.pool {
            return Err(RewardError::AllocationMismatch {
                allocated,
                pool: self.pool,
            }
            .into());
        }

        Ok(participants
            .iter()
            .zip(amounts)
            .map(|(participant, amount)| RewardRecord {
                round_id,
                participant: *participant,
                amount,
            })
            .collect())
    }

    /// Submit the reward transaction
    pub async fn settle(&self, round_id: RoundId, records: &[RewardRecord]) -> Result<TxHandle> {
        let participants: Vec<Address> = records.iter().map(|r| r.participant).collect();
        let amounts: Vec<u128> = records.iter().map(|r| r.amount).collect();

        let ledger = &self.ledger;
        let (participants, amounts) = (&participants, &amounts);
        let tx = self
            .retry
            .run("ledger.submit_rewards", move || {
                ledger.submit_rewards(round_id, participants, amounts)
            })
            .await?;

        tracing::info!(
            "Round {}: distributed {} to {} participants (tx {}, block {})",
            round_id,
            self.pool,
            records.len(),
            tx.tx_hash,
            tx.block
        );
        Ok(tx)
    }
}
