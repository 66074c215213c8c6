//! Simulated participants
//!
//! Each round every participant either sits the round out or trains for a
//! random share of the round, then uploads a random gradient and records it
//! on the in-memory ledger the way a real client would.

use crate::config::SimulationConfig;
use anyhow::Context;
use fedchain_bridge::{ContentStore, DigestProver, MemoryContentStore, MemoryLedger, Prover};
use fedchain_types::{Address, ContentRef, LedgerSubmission, RoundId, Tensor, TensorSet, Timestamp};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct Simulation {
    config: SimulationConfig,
    ledger: Arc<MemoryLedger>,
    content: Arc<MemoryContentStore>,
    prover: Arc<DigestProver>,
    participants: Vec<Address>,
    rng: StdRng,
}

impl Simulation {
    pub fn new(
        config: SimulationConfig,
        ledger: Arc<MemoryLedger>,
        content: Arc<MemoryContentStore>,
        prover: Arc<DigestProver>,
    ) -> Self {
        let participants = (0..config.participants)
            .map(|i| Address::from_label(&format!("participant-{}", i)))
            .collect();
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            ledger,
            content,
            prover,
            participants,
            rng,
        }
    }

    pub fn participants(&self) -> &[Address] {
        &self.participants
    }

    /// Add every simulated participant to the ledger's registry
    pub fn register_participants(&self) -> anyhow::Result<()> {
        for participant in &self.participants {
            if !self.ledger.is_registered(participant) {
                self.ledger
                    .register(*participant)
                    .with_context(|| format!("registering {}", participant))?;
            }
        }
        tracing::info!("Registered {} participants", self.participants.len());
        Ok(())
    }

    fn random_tensors(&mut self, scale: f32) -> TensorSet {
        let weights = (0..self.config.model_dim)
            .map(|_| self.rng.gen_range(-scale..scale))
            .collect();
        let bias = self.rng.gen_range(-scale..scale);
        TensorSet::new(vec![Tensor::from_vec(weights), Tensor::scalar(bias)])
    }

    /// Upload a random initial model and point the ledger at it
    pub async fn seed_base_model(&mut self) -> anyhow::Result<ContentRef> {
        let model = self.random_tensors(1.0);
        let bytes = model.encode().context("encoding initial model")?;
        let model_ref = self.content.put(bytes).await.context("uploading initial model")?;
        self.ledger.set_current_model(model_ref.clone());
        tracing::info!("Seeded initial model {}", model_ref);
        Ok(model_ref)
    }

    /// Open a round on the ledger and launch this round's participants
    pub fn start_round(&mut self, now: Timestamp) -> (RoundId, Vec<JoinHandle<()>>) {
        let round_id = self
            .ledger
            .start_round(now, now + self.config.round_secs, self.config.min_participants);
        let window_ms = self.config.round_secs as u64 * 1000;

        let mut handles = Vec::new();
        for participant in self.participants.clone() {
            if self.rng.gen_bool(self.config.dropout) {
                tracing::debug!("Round {}: {} sits out", round_id, participant);
                continue;
            }
            let delay = Duration::from_millis(self.rng.gen_range(0..window_ms));
            let gradient = self.random_tensors(0.1);
            let ledger = self.ledger.clone();
            let content = self.content.clone();
            let prover = self.prover.clone();

            handles.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match submit(&ledger, content.as_ref(), prover.as_ref(), round_id, participant, gradient).await {
                    Ok(()) => tracing::debug!("Round {}: {} submitted", round_id, participant),
                    Err(e) => tracing::debug!("Round {}: {} missed the round: {:#}", round_id, participant, e),
                }
            }));
        }

        tracing::info!(
            "Round {} started: {} of {} participants training, {} required",
            round_id,
            handles.len(),
            self.participants.len(),
            self.config.min_participants
        );
        (round_id, handles)
    }
}

async fn submit(
    ledger: &MemoryLedger,
    content: &dyn ContentStore,
    prover: &dyn Prover,
    round_id: RoundId,
    participant: Address,
    gradient: TensorSet,
) -> anyhow::Result<()> {
    let bundle = prover.prove_gradient(&gradient).await?;
    let gradient_ref = content.put(gradient.encode()?).await?;
    ledger.submit_gradient(
        round_id,
        LedgerSubmission {
            participant,
            gradient_ref,
            proof: bundle.proof,
            public_inputs: bundle.public_inputs,
        },
    )?;
    Ok(())
}
