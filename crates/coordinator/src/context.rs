//! Per-round aggregation context
//!
//! Built fresh for every round so nothing (buffers, partial fetches) leaks
//! from one round into the next.

use crate::aggregation::AggregationEngine;
use crate::error::{CoordinatorError, Result};
use crate::retry::RetryPolicy;
use fedchain_bridge::ContentStore;
use fedchain_types::{AggregationResult, RoundId, Submission, TensorSet};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;

pub struct AggregationContext {
    round_id: RoundId,
    store: Arc<dyn ContentStore>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl AggregationContext {
    pub fn new(round_id: RoundId, store: Arc<dyn ContentStore>, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            round_id,
            store,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    async fn fetch_one(&self, submission: &Submission) -> Result<TensorSet> {
        let store = &self.store;
        let reference = &submission.gradient_ref;
        let bytes = self
            .retry
            .run("content_store.get", move || store.get(reference))
            .await
            .map_err(|e| {
                // Still-transient failures stall the round instead of failing it
                if e.is_transient() {
                    e
                } else {
                    CoordinatorError::FetchFailed {
                        participant: submission.participant,
                        source: Box::new(e),
                    }
                }
            })?;

        TensorSet::decode(&bytes).map_err(|source| CoordinatorError::MalformedUpdate {
            participant: submission.participant,
            source,
        })
    }

    /// Fetch and decode every submitted gradient, at most `concurrency` at a time
    ///
    /// Any failure aborts the whole fetch; there is no partial aggregation.
    pub async fn fetch_updates(&self, submissions: &[Submission]) -> Result<Vec<TensorSet>> {
        tracing::debug!(
            "Round {}: fetching {} gradients (concurrency {})",
            self.round_id,
            submissions.len(),
            self.concurrency
        );
        stream::iter(submissions)
            .map(|s| self.fetch_one(s))
            .buffered(self.concurrency)
            .try_collect()
            .await
    }

    pub async fn run(self, submissions: &[Submission], engine: &AggregationEngine) -> Result<AggregationResult> {
        let updates = self.fetch_updates(submissions).await?;
        let merged_weights = engine.aggregate(&updates)?;
        Ok(AggregationResult {
            round_id: self.round_id,
            merged_weights,
            participant_count: updates.len(),
        })
    }
}
