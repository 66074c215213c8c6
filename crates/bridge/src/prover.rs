//! Prover - opaque correctness proofs for training and gradients
//!
//! The coordinator never inspects proof contents; it only forwards them to
//! the ledger alongside the model reference.

use async_trait::async_trait;
use fedchain_types::TensorSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProverError {
    #[error("prover input could not be encoded: {0}")]
    Encoding(String),

    #[error("prover unavailable: {0}")]
    Unavailable(String),
}

impl ProverError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProverError::Unavailable(_))
    }
}

/// Proof blob plus its public inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofBundle {
    pub proof: Vec<u8>,
    pub public_inputs: Vec<u8>,
}

#[async_trait]
pub trait Prover: Send + Sync {
    /// Prove that `weights` reached `accuracy`
    async fn prove_training(&self, weights: &TensorSet, accuracy: f32) -> Result<ProofBundle, ProverError>;

    /// Prove a participant gradient (participant side)
    async fn prove_gradient(&self, gradient: &TensorSet) -> Result<ProofBundle, ProverError>;
}

/// Digest-based stand-in prover
///
/// The proof is the blake3 digest of the encoded input; the public inputs are
/// the first four digest bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestProver;

impl DigestProver {
    pub fn new() -> Self {
        Self
    }

    fn bundle(hasher: blake3::Hasher) -> ProofBundle {
        let digest = hasher.finalize();
        let proof = digest.as_bytes().to_vec();
        let public_inputs = proof[..4].to_vec();
        ProofBundle { proof, public_inputs }
    }
}

#[async_trait]
impl Prover for DigestProver {
    async fn prove_training(&self, weights: &TensorSet, accuracy: f32) -> Result<ProofBundle, ProverError> {
        let encoded = weights.encode().map_err(|e| ProverError::Encoding(e.to_string()))?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&encoded);
        hasher.update(&accuracy.to_le_bytes());
        Ok(Self::bundle(hasher))
    }

    async fn prove_gradient(&self, gradient: &TensorSet) -> Result<ProofBundle, ProverError> {
        let encoded = gradient.encode().map_err(|e| ProverError::Encoding(e.to_string()))?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&encoded);
        Ok(Self::bundle(hasher))
    }
}
