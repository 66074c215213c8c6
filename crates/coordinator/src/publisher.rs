//! Model Publisher - applies the aggregated delta and commits the new model

use crate::aggregation::AggregationError;
use crate::error::{CoordinatorError, Result};
use crate::retry::RetryPolicy;
use fedchain_bridge::{ContentStore, LedgerClient, Prover, Trainer};
use fedchain_types::{ContentRef, RoundId, TensorSet, TxHandle};
use std::sync::Arc;

pub struct ModelPublisher {
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn ContentStore>,
    prover: Arc<dyn Prover>,
    retry: RetryPolicy,
    step_size: f32,
    accuracy: f32,
}

impl ModelPublisher {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn ContentStore>,
        prover: Arc<dyn Prover>,
        retry: RetryPolicy,
        step_size: f32,
        accuracy: f32,
    ) -> Self {
        Self {
            ledger,
            store,
            prover,
            retry,
            step_size,
            accuracy,
        }
    }

    /// `base + step_size * delta`, elementwise
    pub fn apply_delta(&self, base: &TensorSet, delta: &TensorSet) -> Result<TensorSet> {
        if !base.same_shape(delta) {
            return Err(AggregationError::ShapeMismatch { index: 1 }.into());
        }
        let mut next = base.clone();
        for (layer, delta_layer) in next.layers_mut().iter_mut().zip(delta.layers()) {
            for (w, d) in layer.values_mut().iter_mut().zip(delta_layer.values()) {
                *w += self.step_size * d;
            }
        }
        Ok(next)
    }

    /// Store a weight set; identical weights always yield the same reference
    pub async fn store(&self, weights: &TensorSet) -> Result<ContentRef> {
        let encoded = weights.encode()?;
        let store = &self.store;
        let encoded = &encoded;
        let model_ref = self
            .retry
            .run("content_store.put", move || store.put(encoded.clone()))
            .await?;
        Ok(model_ref)
    }

    /// Apply `delta` to `base` and store the result
    pub async fn publish(&self, round_id: RoundId, base: &TensorSet, delta: &TensorSet) -> Result<ContentRef> {
        let next = self.apply_delta(base, delta)?;
        let model_ref = self.store(&next).await?;
        tracing::info!("Round {}: published model {}", round_id, model_ref);
        Ok(model_ref)
    }

    /// Fetch and decode a stored model
    pub async fn load(&self, model_ref: &ContentRef) -> Result<TensorSet> {
        let store = &self.store;
        let bytes = self
            .retry
            .run("content_store.get", move || store.get(model_ref))
            .await?;
        Ok(TensorSet::decode(&bytes)?)
    }

    /// Current global model
    ///
    /// The ledger's latest model is fetched and seeded into the trainer; with
    /// no committed model yet the trainer's own weights are the base.
    pub async fn resolve_base(&self, trainer: &dyn Trainer) -> Result<TensorSet> {
        let ledger = &self.ledger;
        let current = self
            .retry
            .run("ledger.current_model", move || ledger.current_model())
            .await
            .map_err(|e| CoordinatorError::BaseModel(Box::new(e)))?;

        match current {
            Some(model_ref) => {
                let weights = self
                    .load(&model_ref)
                    .await
                    .map_err(|e| CoordinatorError::BaseModel(Box::new(e)))?;
                tracing::debug!("Seeding trainer with global model {}", model_ref);
                trainer.set_weights(weights.clone());
                Ok(weights)
            }
            None => Ok(trainer.weights()),
        }
    }

    /// Prove the new weights and commit their reference to the ledger
    pub async fn commit(&self, round_id: RoundId, model_ref: &ContentRef, weights: &TensorSet) -> Result<TxHandle> {
        let prover = &self.prover;
        let accuracy = self.accuracy;
        let bundle = self
            .retry
            .run("prover.prove_training", move || prover.prove_training(weights, accuracy))
            .await?;

        let ledger = &self.ledger;
        let bundle = &bundle;
        let tx = self
            .retry
            .run("ledger.submit_model_commit", move || {
                ledger.submit_model_commit(round_id, model_ref, &bundle.proof, &bundle.public_inputs)
            })
            .await?;

        tracing::info!(
            "Round {}: committed model {} (tx {}, block {})",
            round_id,
            model_ref.uri(),
            tx.tx_hash,
            tx.block
        );
        Ok(tx)
    }
}
