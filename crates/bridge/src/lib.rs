//! FedChain Bridge - external collaborators of the coordinator
//!
//! Defines the interfaces the coordinator consumes:
//! - `LedgerClient`: round registry, submissions, finalize/commit/reward transactions
//! - `ContentStore`: content-addressed blob storage for gradients and models
//! - `Prover`: opaque training proofs
//! - `Trainer`: base model weights
//! - `LeaseProvider`: round-scoped exclusivity across coordinator instances
//!
//! Each interface ships an in-memory implementation used by tests and the
//! local simulation.

pub mod content_store;
pub mod lease;
pub mod ledger;
pub mod prover;
pub mod trainer;

pub use content_store::{ContentStore, MemoryContentStore, StoreError};
pub use lease::{Lease, LeaseError, LeaseProvider, LocalLeaseProvider};
pub use ledger::{LedgerClient, LedgerError, MemoryLedger, ModelCommit};
pub use prover::{DigestProver, ProofBundle, Prover, ProverError};
pub use trainer::{StaticTrainer, Trainer};
