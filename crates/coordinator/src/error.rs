//! Coordinator errors and their failure classes

use crate::aggregation::AggregationError;
use crate::rewards::RewardError;
use fedchain_bridge::{LeaseError, LedgerError, ProverError, StoreError};
use fedchain_types::{Address, FailureReason, RoundId, RoundState, TensorError};
use thiserror::Error;

/// How the engine reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff; the round keeps its state
    Transient,
    /// Round outcome, not a malfunction (e.g. quorum not reached)
    SoftFail,
    /// Bad or missing data; the round fails
    DataFail,
    /// The round fails and is never re-entered
    Fatal,
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("content store: {0}")]
    Store(#[from] StoreError),

    #[error("prover: {0}")]
    Prover(#[from] ProverError),

    #[error("lease: {0}")]
    Lease(#[from] LeaseError),

    #[error("aggregation: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("rewards: {0}")]
    Reward(#[from] RewardError),

    #[error("model encoding: {0}")]
    Tensor(#[from] TensorError),

    #[error("gradient of {participant} unavailable: {source}")]
    FetchFailed {
        participant: Address,
        #[source]
        source: Box<CoordinatorError>,
    },

    #[error("gradient of {participant} is malformed: {source}")]
    MalformedUpdate {
        participant: Address,
        #[source]
        source: TensorError,
    },

    #[error("base model unavailable: {0}")]
    BaseModel(#[source] Box<CoordinatorError>),

    #[error("lease for round {0} is held by another instance")]
    LeaseContended(RoundId),

    #[error("lease for round {0} lost")]
    LeaseLost(RoundId),

    #[error("{op} timed out after {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    #[error("{op} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        #[source]
        last: Box<CoordinatorError>,
    },

    #[error("round {0} is not tracked")]
    UnknownRound(RoundId),

    #[error("round {round_id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        round_id: RoundId,
        from: RoundState,
        to: RoundState,
    },

    #[error("engine storage: {0}")]
    Storage(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<anyhow::Error> for CoordinatorError {
    fn from(e: anyhow::Error) -> Self {
        CoordinatorError::Storage(format!("{:#}", e))
    }
}

impl CoordinatorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CoordinatorError::Ledger(e) if e.is_transient() => ErrorClass::Transient,
            CoordinatorError::Ledger(_) => ErrorClass::Fatal,
            CoordinatorError::Store(e) if e.is_transient() => ErrorClass::Transient,
            CoordinatorError::Store(_) => ErrorClass::DataFail,
            CoordinatorError::Prover(e) if e.is_transient() => ErrorClass::Transient,
            CoordinatorError::Prover(_) => ErrorClass::DataFail,
            CoordinatorError::Lease(_) => ErrorClass::Transient,
            CoordinatorError::Aggregation(_) => ErrorClass::DataFail,
            CoordinatorError::Reward(_) => ErrorClass::DataFail,
            CoordinatorError::Tensor(_) => ErrorClass::DataFail,
            CoordinatorError::FetchFailed { .. } => ErrorClass::DataFail,
            CoordinatorError::MalformedUpdate { .. } => ErrorClass::DataFail,
            CoordinatorError::BaseModel(inner) => match inner.class() {
                ErrorClass::Transient => ErrorClass::Transient,
                _ => ErrorClass::DataFail,
            },
            CoordinatorError::LeaseContended(_) => ErrorClass::Transient,
            CoordinatorError::LeaseLost(_) => ErrorClass::Fatal,
            CoordinatorError::Timeout { .. } => ErrorClass::Transient,
            CoordinatorError::RetriesExhausted { last, .. } => last.class(),
            CoordinatorError::UnknownRound(_) => ErrorClass::Fatal,
            CoordinatorError::IllegalTransition { .. } => ErrorClass::Fatal,
            CoordinatorError::Storage(_) => ErrorClass::Fatal,
            CoordinatorError::Cancelled => ErrorClass::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// A ledger transaction was rejected, or never confirmed within its retries
    pub fn is_transaction_rejection(&self) -> bool {
        match self {
            CoordinatorError::Ledger(LedgerError::TransactionFailed(_)) => true,
            CoordinatorError::RetriesExhausted { op, .. } => op.starts_with("ledger.submit_"),
            _ => false,
        }
    }

    /// Failure reason recorded when this error ends a round
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            CoordinatorError::FetchFailed { participant, .. } => FailureReason::FetchFailed {
                participant: participant.to_string(),
            },
            CoordinatorError::MalformedUpdate { participant, .. } => FailureReason::MalformedUpdate {
                participant: participant.to_string(),
            },
            CoordinatorError::Aggregation(AggregationError::NoUpdates) => FailureReason::NoUpdates,
            CoordinatorError::Aggregation(AggregationError::ShapeMismatch { .. }) => FailureReason::ShapeMismatch,
            CoordinatorError::Reward(RewardError::EmptyParticipantSet) => FailureReason::EmptyParticipantSet,
            CoordinatorError::LeaseLost(_) => FailureReason::LeaseLost,
            CoordinatorError::BaseModel(inner) => FailureReason::BaseModelUnavailable(inner.to_string()),
            CoordinatorError::Tensor(e) => FailureReason::InvalidModel(e.to_string()),
            CoordinatorError::Storage(msg) => FailureReason::Storage(msg.clone()),
            other => FailureReason::Unrecoverable(other.to_string()),
        }
    }
}

pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;
