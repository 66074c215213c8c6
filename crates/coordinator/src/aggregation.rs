//! Aggregation Engine - merges participant updates into one delta
//!
//! Every shipped strategy is an elementwise reduction: for each layer and
//! each element, the values contributed by all participants are gathered,
//! put in a total order, and reduced to one value. Sorting before reducing
//! makes the output bit-identical under any permutation of the inputs;
//! summation happens in f64.

use fedchain_types::TensorSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("no updates to aggregate")]
    NoUpdates,

    #[error("update {index} does not match the layer shapes of update 0")]
    ShapeMismatch { index: usize },
}

/// A way of merging updates; all strategies share this signature
pub trait AggregationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn aggregate(&self, updates: &[TensorSet]) -> Result<TensorSet, AggregationError>;
}

/// Fail unless every update has the first update's layer shapes
pub fn check_shapes(updates: &[TensorSet]) -> Result<(), AggregationError> {
    let first = updates.first().ok_or(AggregationError::NoUpdates)?;
    match updates.iter().position(|u| !u.same_shape(first)) {
        Some(index) => Err(AggregationError::ShapeMismatch { index }),
        None => Ok(()),
    }
}

/// Apply `reduce` to the sorted column of values at every element position
fn reduce_elementwise<F>(updates: &[TensorSet], reduce: F) -> Result<TensorSet, AggregationError>
where
    F: Fn(&[f32]) -> f32,
{
    check_shapes(updates)?;

    let template = &updates[0];
    let mut column = Vec::with_capacity(updates.len());
    let mut layers = Vec::with_capacity(template.len());

    for (layer_idx, layer) in template.layers().iter().enumerate() {
        let mut merged = layer.zeros_like();
        for (elem_idx, out) in merged.values_mut().iter_mut().enumerate() {
            column.clear();
            column.extend(updates.iter().map(|u| u.layers()[layer_idx].values()[elem_idx]));
            column.sort_by(f32::total_cmp);
            *out = reduce(&column);
        }
        layers.push(merged);
    }

    Ok(TensorSet::new(layers))
}

fn mean(sorted: &[f32]) -> f32 {
    let sum: f64 = sorted.iter().map(|v| *v as f64).sum();
    (sum / sorted.len() as f64) as f32
}

/// Federated averaging: unweighted elementwise mean
#[derive(Debug, Default, Clone, Copy)]
pub struct FedAvg;

impl AggregationStrategy for FedAvg {
    fn name(&self) -> &'static str {
        "fedavg"
    }

    fn aggregate(&self, updates: &[TensorSet]) -> Result<TensorSet, AggregationError> {
        reduce_elementwise(updates, mean)
    }
}

/// Mean after discarding the `trim` lowest and highest values per element
///
/// With `2 * trim >= k` updates nothing can be discarded and the plain mean
/// is used.
#[derive(Debug, Clone, Copy)]
pub struct TrimmedMean {
    trim: usize,
}

impl TrimmedMean {
    pub fn new(trim: usize) -> Self {
        Self { trim }
    }
}

impl AggregationStrategy for TrimmedMean {
    fn name(&self) -> &'static str {
        "trimmed_mean"
    }

    fn aggregate(&self, updates: &[TensorSet]) -> Result<TensorSet, AggregationError> {
        let trim = self.trim;
        reduce_elementwise(updates, |sorted| {
            if sorted.len() > 2 * trim {
                mean(&sorted[trim..sorted.len() - trim])
            } else {
                mean(sorted)
            }
        })
    }
}

/// Coordinate-wise median
#[derive(Debug, Default, Clone, Copy)]
pub struct CoordinateMedian;

impl AggregationStrategy for CoordinateMedian {
    fn name(&self) -> &'static str {
        "median"
    }

    fn aggregate(&self, updates: &[TensorSet]) -> Result<TensorSet, AggregationError> {
        reduce_elementwise(updates, |sorted| {
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 1 {
                sorted[mid]
            } else {
                mean(&sorted[mid - 1..=mid])
            }
        })
    }
}

/// Strategy holder used by the state machine
pub struct AggregationEngine {
    strategy: Box<dyn AggregationStrategy>,
}

impl AggregationEngine {
    pub fn new(strategy: Box<dyn AggregationStrategy>) -> Self {
        Self { strategy }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn aggregate(&self, updates: &[TensorSet]) -> Result<TensorSet, AggregationError> {
        let merged = self.strategy.aggregate(updates)?;
        tracing::debug!(
            "Aggregated {} updates with {} ({} layers)",
            updates.len(),
            self.strategy.name(),
            merged.len()
        );
        Ok(merged)
    }
}

impl Default for AggregationEngine {
    fn default() -> Self {
        Self::new(Box::new(FedAvg))
    }
}
