//! Coordinator configuration

use crate::aggregation::{AggregationEngine, CoordinateMedian, FedAvg, TrimmedMean};
use anyhow::Context;
use fedchain_types::TOKEN_DECIMALS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Aggregation strategy selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    FedAvg,
    TrimmedMean { trim: usize },
    Median,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig::FedAvg
    }
}

impl StrategyConfig {
    pub fn build(&self) -> AggregationEngine {
        match self {
            StrategyConfig::FedAvg => AggregationEngine::new(Box::new(FedAvg)),
            StrategyConfig::TrimmedMean { trim } => AggregationEngine::new(Box::new(TrimmedMean::new(*trim))),
            StrategyConfig::Median => AggregationEngine::new(Box::new(CoordinateMedian)),
        }
    }
}

/// Retry policy for network operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per operation, including the first
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles each attempt
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff
    pub max_delay_ms: u64,
    /// Deadline for a single attempt
    pub op_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            op_timeout_ms: 15_000,
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Lease holder identity; must be stable across restarts
    pub instance_id: String,
    /// Ledger polling interval
    pub poll_interval_ms: u64,
    /// Concurrent gradient fetches during aggregation
    pub fetch_concurrency: usize,
    /// Tokens distributed per closed round (base units)
    pub reward_pool: u128,
    /// Scale applied to the aggregated delta
    pub step_size: f32,
    /// Accuracy reported to the prover with each model commit
    pub reported_accuracy: f32,
    /// Aggregation lease time-to-live
    pub lease_ttl_secs: u64,
    pub strategy: StrategyConfig,
    pub retry: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            instance_id: "coordinator-0".to_string(),
            poll_interval_ms: 30_000,
            fetch_concurrency: 4,
            reward_pool: 300 * TOKEN_DECIMALS,
            step_size: 1.0,
            reported_accuracy: 85.0,
            lease_ttl_secs: 600,
            strategy: StrategyConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {:?}", path.as_ref()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {:?}", path.as_ref()))?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}
