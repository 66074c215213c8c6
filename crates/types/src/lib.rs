//! Shared types for FedChain round coordination
//!
//! This crate contains the data model shared between the coordinator engine
//! and the ledger/content-store adapters:
//! - Rounds, their lifecycle states and failure reasons
//! - Participant submissions and reward allocations
//! - Tensor sets (model weights and gradients) with a deterministic encoding
//! - Content references and participant addresses

pub mod ids;
pub mod round;
pub mod submission;
pub mod tensor;

pub use ids::{Address, ContentRef, TxHandle};
pub use round::{FailureReason, Round, RoundSnapshot, RoundState, RoundStatus};
pub use submission::{AggregationResult, LedgerSubmission, RewardRecord, Submission};
pub use tensor::{Tensor, TensorError, TensorSet};

/// Unix timestamp in seconds (matches on-chain `block.timestamp`)
pub type Timestamp = i64;

/// Round identifier assigned by the ledger
pub type RoundId = u64;

/// Token base units per whole token (18 decimals, matches the FED token)
pub const TOKEN_DECIMALS: u128 = 1_000_000_000_000_000_000;
