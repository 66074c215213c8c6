//! Participant submissions, aggregation output and reward records

use crate::{Address, ContentRef, RoundId, TensorSet, Timestamp};
use serde::{Deserialize, Serialize};

/// A participant's gradient submission as recorded on the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSubmission {
    pub participant: Address,
    pub gradient_ref: ContentRef,
    /// Opaque correctness proof
    pub proof: Vec<u8>,
    /// Opaque public inputs for the proof
    pub public_inputs: Vec<u8>,
}

/// A submission observed by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub round_id: RoundId,
    pub participant: Address,
    pub gradient_ref: ContentRef,
    pub proof: Vec<u8>,
    pub public_inputs: Vec<u8>,
    pub observed_at: Timestamp,
}

impl Submission {
    pub fn from_ledger(round_id: RoundId, record: LedgerSubmission, observed_at: Timestamp) -> Self {
        Self {
            round_id,
            participant: record.participant,
            gradient_ref: record.gradient_ref,
            proof: record.proof,
            public_inputs: record.public_inputs,
            observed_at,
        }
    }
}

/// Result of merging a round's updates
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationResult {
    pub round_id: RoundId,
    pub merged_weights: TensorSet,
    pub participant_count: usize,
}

/// A participant's reward allocation for a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardRecord {
    pub round_id: RoundId,
    pub participant: Address,
    /// Amount in token base units
    pub amount: u128,
}
