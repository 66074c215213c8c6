//! Submission tracker - per-round deduplication and counting
//!
//! First writer wins: once a participant has a submission for a round, later
//! submissions for the same pair are ignored, mirroring the ledger which
//! rejects a second on-chain submission.

use crate::error::Result;
use crate::persistence::EngineStore;
use fedchain_types::{Address, RoundId, Submission};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Why a submission was or was not recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordReason {
    Accepted,
    Duplicate,
    RoundNotAcceptingSubmissions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub accepted: bool,
    pub reason: RecordReason,
}

impl RecordOutcome {
    fn rejected(reason: RecordReason) -> Self {
        Self {
            accepted: false,
            reason,
        }
    }
}

#[derive(Debug, Default)]
struct RoundSubmissions {
    accepting: bool,
    order: Vec<Submission>,
    seen: HashSet<Address>,
}

/// Tracks accepted submissions per round
///
/// Only the driver loop mutates the tracker, so it is a plain owned value.
/// With a backing store every accepted submission is written through.
#[derive(Default)]
pub struct SubmissionTracker {
    rounds: BTreeMap<RoundId, RoundSubmissions>,
    store: Option<Arc<EngineStore>>,
}

impl SubmissionTracker {
    /// In-memory tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker that persists accepted submissions
    pub fn with_store(store: Arc<EngineStore>) -> Self {
        Self {
            rounds: BTreeMap::new(),
            store: Some(store),
        }
    }

    /// Rebuild from persisted submissions without re-writing them
    pub fn restore(&mut self, submissions: Vec<Submission>) {
        for submission in submissions {
            let entry = self.rounds.entry(submission.round_id).or_default();
            if entry.seen.insert(submission.participant) {
                entry.order.push(submission);
            }
        }
    }

    /// Start accepting submissions for a round
    pub fn open_round(&mut self, round_id: RoundId) {
        self.rounds.entry(round_id).or_default().accepting = true;
    }

    /// Stop accepting submissions for a round
    pub fn close_round(&mut self, round_id: RoundId) {
        if let Some(entry) = self.rounds.get_mut(&round_id) {
            entry.accepting = false;
        }
    }

    pub fn is_accepting(&self, round_id: RoundId) -> bool {
        self.rounds.get(&round_id).is_some_and(|r| r.accepting)
    }

    pub fn record(&mut self, submission: Submission) -> Result<RecordOutcome> {
        let Some(entry) = self.rounds.get_mut(&submission.round_id) else {
            return Ok(RecordOutcome::rejected(RecordReason::RoundNotAcceptingSubmissions));
        };
        if !entry.accepting {
            return Ok(RecordOutcome::rejected(RecordReason::RoundNotAcceptingSubmissions));
        }
        if entry.seen.contains(&submission.participant) {
            return Ok(RecordOutcome::rejected(RecordReason::Duplicate));
        }

        if let Some(store) = &self.store {
            store.append_submission(&submission, entry.order.len() as u64)?;
        }
        tracing::debug!(
            "Round {}: recorded submission from {} ({})",
            submission.round_id,
            submission.participant,
            submission.gradient_ref
        );
        entry.seen.insert(submission.participant);
        entry.order.push(submission);

        Ok(RecordOutcome {
            accepted: true,
            reason: RecordReason::Accepted,
        })
    }

    pub fn contains(&self, round_id: RoundId, participant: &Address) -> bool {
        self.rounds
            .get(&round_id)
            .is_some_and(|r| r.seen.contains(participant))
    }

    pub fn count(&self, round_id: RoundId) -> usize {
        self.rounds.get(&round_id).map_or(0, |r| r.order.len())
    }

    /// Accepted submissions in observation order
    pub fn list(&self, round_id: RoundId) -> &[Submission] {
        self.rounds
            .get(&round_id)
            .map(|r| r.order.as_slice())
            .unwrap_or(&[])
    }

    pub fn participants(&self, round_id: RoundId) -> Vec<Address> {
        self.list(round_id).iter().map(|s| s.participant).collect()
    }
}
