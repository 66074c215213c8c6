//! Trainer - holder of the local model weights

use fedchain_types::TensorSet;
use parking_lot::RwLock;

/// Read/seed access to a model's weights
pub trait Trainer: Send + Sync {
    fn weights(&self) -> TensorSet;

    fn set_weights(&self, weights: TensorSet);
}

/// Trainer that simply holds a weight set
#[derive(Debug, Default)]
pub struct StaticTrainer {
    weights: RwLock<TensorSet>,
}

impl StaticTrainer {
    pub fn new(initial: TensorSet) -> Self {
        Self {
            weights: RwLock::new(initial),
        }
    }
}

impl Trainer for StaticTrainer {
    fn weights(&self) -> TensorSet {
        self.weights.read().clone()
    }

    fn set_weights(&self, weights: TensorSet) {
        *self.weights.write() = weights;
    }
}
