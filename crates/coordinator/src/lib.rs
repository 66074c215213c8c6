//! FedChain Coordinator - round coordination and aggregation engine
//!
//! Drives federated-learning rounds recorded on a ledger:
//! - Tracks participant submissions per round (first writer wins)
//! - Gates aggregation on a participant quorum or the round deadline
//! - Fetches gradients from the content store and merges them deterministically
//! - Publishes and commits the new global model, then settles rewards
//!
//! All progress is persisted in a sled store so a restarted coordinator
//! resumes every round without repeating ledger transactions.

pub mod aggregation;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod persistence;
pub mod publisher;
pub mod retry;
pub mod rewards;
pub mod scheduler;
pub mod state_machine;
pub mod tracker;

#[cfg(test)]
mod tests;

pub use aggregation::{AggregationEngine, AggregationError, AggregationStrategy, CoordinateMedian, FedAvg, TrimmedMean};
pub use config::{CoordinatorConfig, RetryConfig, StrategyConfig};
pub use context::AggregationContext;
pub use driver::Coordinator;
pub use error::{CoordinatorError, ErrorClass, Result};
pub use persistence::{EngineStore, LeaseRecord, RoundRecord};
pub use publisher::ModelPublisher;
pub use retry::RetryPolicy;
pub use rewards::{EqualSplit, RewardDistributor, RewardError, RewardPolicy};
pub use scheduler::{ManualScheduler, Scheduler, Shutdown, SystemScheduler};
pub use state_machine::{Collaborators, RoundStateMachine};
pub use tracker::{RecordOutcome, RecordReason, SubmissionTracker};
