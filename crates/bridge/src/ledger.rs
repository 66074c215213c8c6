//! Ledger client - authoritative round state and settlement transactions
//!
//! `MemoryLedger` emulates the FedChain core contract in process: rounds with
//! start/end times, first-writer-wins gradient submissions, finalization,
//! model commits and token reward payouts.

use async_trait::async_trait;
use fedchain_types::{
    Address, ContentRef, LedgerSubmission, RoundId, RoundSnapshot, Timestamp, TxHandle,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger request timed out")]
    Timeout,

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("round {0} not found")]
    RoundNotFound(RoundId),

    #[error("transaction failed: {0}")]
    TransactionFailed(String),
}

impl LedgerError {
    /// Everything except a rejected transaction may succeed on retry
    ///
    /// `RoundNotFound` included: a lagging node may not see the round yet.
    pub fn is_transient(&self) -> bool {
        !matches!(self, LedgerError::TransactionFailed(_))
    }
}

/// Query and transaction interface to the ledger
///
/// Transaction methods return once the transaction is confirmed.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Id of the latest round, 0 if no round has started
    async fn current_round_id(&self) -> Result<RoundId, LedgerError>;

    async fn round_info(&self, round_id: RoundId) -> Result<RoundSnapshot, LedgerError>;

    /// Participants that submitted in a round, in submission order
    async fn participants(&self, round_id: RoundId) -> Result<Vec<Address>, LedgerError>;

    async fn submission(
        &self,
        round_id: RoundId,
        participant: &Address,
    ) -> Result<Option<LedgerSubmission>, LedgerError>;

    /// Reference of the latest committed global model
    async fn current_model(&self) -> Result<Option<ContentRef>, LedgerError>;

    async fn submit_finalize(&self, round_id: RoundId) -> Result<TxHandle, LedgerError>;

    async fn submit_model_commit(
        &self,
        round_id: RoundId,
        model_ref: &ContentRef,
        proof: &[u8],
        public_inputs: &[u8],
    ) -> Result<TxHandle, LedgerError>;

    async fn submit_rewards(
        &self,
        round_id: RoundId,
        participants: &[Address],
        amounts: &[u128],
    ) -> Result<TxHandle, LedgerError>;
}

/// A model commit as recorded on the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCommit {
    pub round_id: RoundId,
    pub model_ref: ContentRef,
    pub model_uri: String,
    pub proof: Vec<u8>,
    pub public_inputs: Vec<u8>,
}

#[derive(Debug)]
struct LedgerRound {
    snapshot: RoundSnapshot,
    submissions: Vec<LedgerSubmission>,
}

#[derive(Debug, Default)]
struct LedgerState {
    rounds: BTreeMap<RoundId, LedgerRound>,
    current_round: RoundId,
    current_model: Option<ContentRef>,
    block: u64,
    balances: HashMap<Address, u128>,
    registered: HashSet<Address>,
    commits: Vec<ModelCommit>,
    finalize_txs: u64,
    reward_txs: u64,
    /// Next N calls fail with `Unavailable`
    transient_failures: u32,
    reject_finalize: bool,
    reject_model_commit: bool,
    reject_rewards: bool,
}

impl LedgerState {
    fn next_tx(&mut self, kind: &str, round_id: RoundId) -> TxHandle {
        self.block += 1;
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.as_bytes());
        hasher.update(&round_id.to_le_bytes());
        hasher.update(&self.block.to_le_bytes());
        TxHandle {
            tx_hash: format!("0x{}", hasher.finalize().to_hex()),
            block: self.block,
        }
    }

    fn take_fault(&mut self) -> Result<(), LedgerError> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(LedgerError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }

    fn round_mut(&mut self, round_id: RoundId) -> Result<&mut LedgerRound, LedgerError> {
        self.rounds
            .get_mut(&round_id)
            .ok_or(LedgerError::RoundNotFound(round_id))
    }
}

/// In-process ledger emulating the FedChain core contract
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the next round, returning its id
    pub fn start_round(&self, start_time: Timestamp, end_time: Timestamp, min_participants: u64) -> RoundId {
        let mut state = self.state.lock();
        let round_id = state.current_round + 1;
        state.current_round = round_id;
        state.rounds.insert(
            round_id,
            LedgerRound {
                snapshot: RoundSnapshot {
                    id: round_id,
                    start_time,
                    end_time,
                    min_participants,
                    finalized: false,
                    model_ref: None,
                    rewards_distributed: false,
                },
                submissions: Vec::new(),
            },
        );
        tracing::debug!("Ledger started round {} (ends at {})", round_id, end_time);
        round_id
    }

    /// Add a participant to the registry; only registered participants may submit
    pub fn register(&self, participant: Address) -> Result<TxHandle, LedgerError> {
        let mut state = self.state.lock();
        if !state.registered.insert(participant) {
            return Err(LedgerError::TransactionFailed(format!("{} already registered", participant)));
        }
        tracing::debug!("Ledger registered participant {}", participant);
        Ok(state.next_tx("register", 0))
    }

    pub fn is_registered(&self, participant: &Address) -> bool {
        self.state.lock().registered.contains(participant)
    }

    /// Participant-side gradient submission; a second submission is rejected
    pub fn submit_gradient(&self, round_id: RoundId, submission: LedgerSubmission) -> Result<TxHandle, LedgerError> {
        let mut state = self.state.lock();
        if !state.registered.contains(&submission.participant) {
            return Err(LedgerError::TransactionFailed(format!(
                "{} is not a registered participant",
                submission.participant
            )));
        }
        let round = state.round_mut(round_id)?;
        if round.snapshot.finalized {
            return Err(LedgerError::TransactionFailed(format!("round {} is finalized", round_id)));
        }
        if round.submissions.iter().any(|s| s.participant == submission.participant) {
            return Err(LedgerError::TransactionFailed(format!(
                "{} already submitted for round {}",
                submission.participant, round_id
            )));
        }
        round.submissions.push(submission);
        Ok(state.next_tx("submitGradient", round_id))
    }

    /// Seed the global model pointer (deployment-time initial model)
    pub fn set_current_model(&self, model_ref: ContentRef) {
        self.state.lock().current_model = Some(model_ref);
    }

    /// Mark a round finalized as if another party had done it
    pub fn force_finalize(&self, round_id: RoundId) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        state.round_mut(round_id)?.snapshot.finalized = true;
        Ok(())
    }

    /// Make the next `count` calls fail with a transient error
    pub fn inject_transient_failures(&self, count: u32) {
        self.state.lock().transient_failures = count;
    }

    pub fn reject_finalize(&self, reject: bool) {
        self.state.lock().reject_finalize = reject;
    }

    pub fn reject_model_commit(&self, reject: bool) {
        self.state.lock().reject_model_commit = reject;
    }

    pub fn reject_rewards(&self, reject: bool) {
        self.state.lock().reject_rewards = reject;
    }

    pub fn balance(&self, participant: &Address) -> u128 {
        self.state.lock().balances.get(participant).copied().unwrap_or(0)
    }

    pub fn model_commits(&self) -> Vec<ModelCommit> {
        self.state.lock().commits.clone()
    }

    pub fn finalize_tx_count(&self) -> u64 {
        self.state.lock().finalize_txs
    }

    pub fn reward_tx_count(&self) -> u64 {
        self.state.lock().reward_txs
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn current_round_id(&self) -> Result<RoundId, LedgerError> {
        let mut state = self.state.lock();
        state.take_fault()?;
        Ok(state.current_round)
    }

    async fn round_info(&self, round_id: RoundId) -> Result<RoundSnapshot, LedgerError> {
        let mut state = self.state.lock();
        state.take_fault()?;
        Ok(state.round_mut(round_id)?.snapshot.clone())
    }

    async fn participants(&self, round_id: RoundId) -> Result<Vec<Address>, LedgerError> {
        let mut state = self.state.lock();
        state.take_fault()?;
        Ok(state
            .round_mut(round_id)?
            .submissions
            .iter()
            .map(|s| s.participant)
            .collect())
    }

    async fn submission(
        &self,
        round_id: RoundId,
        participant: &Address,
    ) -> Result<Option<LedgerSubmission>, LedgerError> {
        let mut state = self.state.lock();
        state.take_fault()?;
        Ok(state
            .round_mut(round_id)?
            .submissions
            .iter()
            .find(|s| &s.participant == participant)
            .cloned())
    }

    async fn current_model(&self) -> Result<Option<ContentRef>, LedgerError> {
        let mut state = self.state.lock();
        state.take_fault()?;
        Ok(state.current_model.clone())
    }

    async fn submit_finalize(&self, round_id: RoundId) -> Result<TxHandle, LedgerError> {
        let mut state = self.state.lock();
        state.take_fault()?;
        if state.reject_finalize {
            return Err(LedgerError::TransactionFailed("finalizeRound reverted".to_string()));
        }
        let round = state.round_mut(round_id)?;
        if round.snapshot.finalized {
            return Err(LedgerError::TransactionFailed(format!("round {} already finalized", round_id)));
        }
        round.snapshot.finalized = true;
        state.finalize_txs += 1;
        Ok(state.next_tx("finalizeRound", round_id))
    }

    async fn submit_model_commit(
        &self,
        round_id: RoundId,
        model_ref: &ContentRef,
        proof: &[u8],
        public_inputs: &[u8],
    ) -> Result<TxHandle, LedgerError> {
        let mut state = self.state.lock();
        state.take_fault()?;
        if state.reject_model_commit {
            return Err(LedgerError::TransactionFailed("updateModel reverted".to_string()));
        }
        let round = state.round_mut(round_id)?;
        if !round.snapshot.finalized {
            return Err(LedgerError::TransactionFailed(format!("round {} not finalized", round_id)));
        }
        if round.snapshot.model_ref.is_some() {
            return Err(LedgerError::TransactionFailed(format!("round {} model already committed", round_id)));
        }
        round.snapshot.model_ref = Some(model_ref.clone());
        state.current_model = Some(model_ref.clone());
        state.commits.push(ModelCommit {
            round_id,
            model_ref: model_ref.clone(),
            model_uri: model_ref.uri(),
            proof: proof.to_vec(),
            public_inputs: public_inputs.to_vec(),
        });
        Ok(state.next_tx("updateModel", round_id))
    }

    async fn submit_rewards(
        &self,
        round_id: RoundId,
        participants: &[Address],
        amounts: &[u128],
    ) -> Result<TxHandle, LedgerError> {
        let mut state = self.state.lock();
        state.take_fault()?;
        if state.reject_rewards {
            return Err(LedgerError::TransactionFailed("distributeRewards reverted".to_string()));
        }
        if participants.len() != amounts.len() {
            return Err(LedgerError::TransactionFailed("participant/amount length mismatch".to_string()));
        }
        let round = state.round_mut(round_id)?;
        if !round.snapshot.finalized {
            return Err(LedgerError::TransactionFailed(format!("round {} not finalized", round_id)));
        }
        if round.snapshot.rewards_distributed {
            return Err(LedgerError::TransactionFailed(format!("round {} rewards already distributed", round_id)));
        }
        round.snapshot.rewards_distributed = true;
        for (participant, amount) in participants.iter().zip(amounts) {
            *state.balances.entry(*participant).or_insert(0) += amount;
        }
        state.reward_txs += 1;
        Ok(state.next_tx("distributeRewards", round_id))
    }
}
