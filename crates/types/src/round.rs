//! Round lifecycle types

use crate::{ContentRef, RoundId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle state of a round
///
/// States are strictly ordered; a round only ever moves to a state of higher
/// rank. `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoundState {
    Pending,
    Open,
    AwaitingQuorum,
    Finalizing,
    Aggregating,
    Committing,
    Distributing,
    Closed,
    Failed,
}

impl RoundState {
    fn rank(self) -> u8 {
        match self {
            RoundState::Pending => 0,
            RoundState::Open => 1,
            RoundState::AwaitingQuorum => 2,
            RoundState::Finalizing => 3,
            RoundState::Aggregating => 4,
            RoundState::Committing => 5,
            RoundState::Distributing => 6,
            RoundState::Closed => 7,
            RoundState::Failed => 8,
        }
    }

    /// `Closed` and `Failed` are never left
    pub fn is_terminal(self) -> bool {
        matches!(self, RoundState::Closed | RoundState::Failed)
    }

    /// Whether submissions may still be recorded in this state
    pub fn accepts_submissions(self) -> bool {
        matches!(self, RoundState::Open | RoundState::AwaitingQuorum)
    }

    /// Whether `next` is a legal forward transition from `self`
    pub fn can_transition_to(self, next: RoundState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == RoundState::Failed {
            return true;
        }
        next.rank() == self.rank() + 1
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a round ended in `Failed`
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    #[error("insufficient participants: {have} of {need} required")]
    InsufficientParticipants { have: u64, need: u64 },

    #[error("participant updates do not share layer shapes")]
    ShapeMismatch,

    #[error("no updates to aggregate")]
    NoUpdates,

    #[error("gradient blob for {participant} could not be fetched")]
    FetchFailed { participant: String },

    #[error("gradient blob for {participant} is malformed")]
    MalformedUpdate { participant: String },

    #[error("finalize transaction rejected: {0}")]
    FinalizeRejected(String),

    #[error("model commit rejected: {0}")]
    CommitRejected(String),

    #[error("reward distribution rejected: {0}")]
    RewardsRejected(String),

    #[error("aggregation lease lost")]
    LeaseLost,

    #[error("no participants to reward")]
    EmptyParticipantSet,

    #[error("base model unavailable: {0}")]
    BaseModelUnavailable(String),

    #[error("aggregated model is invalid: {0}")]
    InvalidModel(String),

    #[error("engine storage error: {0}")]
    Storage(String),

    #[error("unrecoverable error: {0}")]
    Unrecoverable(String),
}

/// Round information as reported by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub id: RoundId,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub min_participants: u64,
    pub finalized: bool,
    /// Model reference committed for this round, if any
    pub model_ref: Option<ContentRef>,
    pub rewards_distributed: bool,
}

/// A round as tracked by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub min_participants: u64,
    pub state: RoundState,
    /// Set once when the aggregated model is published, never overwritten
    pub model_ref: Option<ContentRef>,
    pub finalized: bool,
    pub failure: Option<FailureReason>,
}

impl Round {
    /// A freshly observed round
    pub fn from_snapshot(snapshot: &RoundSnapshot) -> Self {
        Self {
            id: snapshot.id,
            start_time: snapshot.start_time,
            end_time: snapshot.end_time,
            min_participants: snapshot.min_participants,
            state: RoundState::Pending,
            model_ref: None,
            finalized: snapshot.finalized,
            failure: None,
        }
    }

    pub fn status(&self) -> RoundStatus {
        RoundStatus {
            round_id: self.id,
            state: self.state,
            failure: self.failure.clone(),
        }
    }
}

/// Driver-facing view of a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStatus {
    pub round_id: RoundId,
    pub state: RoundState,
    pub failure: Option<FailureReason>,
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            Some(reason) => write!(f, "round {}: {} ({})", self.round_id, self.state, reason),
            None => write!(f, "round {}: {}", self.round_id, self.state),
        }
    }
}
