//! Node Configuration

use anyhow::Context;
use fedchain_coordinator::CoordinatorConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Local simulation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Simulated participants per round
    pub participants: usize,
    /// Round duration in seconds
    pub round_secs: i64,
    /// Minimum participants recorded on the ledger for each round
    pub min_participants: u64,
    /// Probability that a participant skips a round
    pub dropout: f64,
    /// Values per model layer
    pub model_dim: usize,
    /// Seed for gradients, delays and dropouts
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            participants: 5,
            round_secs: 10,
            min_participants: 3,
            dropout: 0.2,
            model_dim: 8,
            seed: 7,
        }
    }
}

/// Node configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub coordinator: CoordinatorConfig,
    pub simulation: SimulationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            // Simulated rounds last seconds, not hours
            coordinator: CoordinatorConfig {
                instance_id: "fedchain-node".to_string(),
                poll_interval_ms: 1_000,
                ..CoordinatorConfig::default()
            },
            simulation: SimulationConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading node config {:?}", path.as_ref()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing node config {:?}", path.as_ref()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let sim = &self.simulation;
        anyhow::ensure!(sim.participants > 0, "at least one participant is required");
        anyhow::ensure!(sim.round_secs > 0, "round duration must be positive");
        anyhow::ensure!(sim.model_dim > 0, "model dimension must be positive");
        anyhow::ensure!((0.0..1.0).contains(&sim.dropout), "dropout must be in [0, 1)");
        anyhow::ensure!(self.coordinator.poll_interval_ms > 0, "poll interval must be positive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"simulation":{"participants":9},"coordinator":{"step_size":0.5}}"#).unwrap();
        assert_eq!(config.simulation.participants, 9);
        assert_eq!(config.simulation.round_secs, 10);
        assert_eq!(config.coordinator.step_size, 0.5);
        assert_eq!(config.coordinator.poll_interval_ms, 30_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_coordinator_section_uses_node_defaults() {
        let config: NodeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.coordinator.poll_interval_ms, 1_000);
        assert_eq!(config.coordinator.instance_id, "fedchain-node");
    }

    #[test]
    fn test_validate_rejects_bad_dropout() {
        let mut config = NodeConfig::default();
        config.simulation.dropout = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"simulation":{"seed":42}}"#).unwrap();
        assert_eq!(NodeConfig::load(&path).unwrap().simulation.seed, 42);
    }
}
