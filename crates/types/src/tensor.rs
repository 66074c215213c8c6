//! Tensor sets: per-layer model weights and gradients
//!
//! Encoding uses borsh, which is deterministic: two sets with identical
//! shapes and bit-identical values always produce identical bytes, and
//! therefore the same content reference.

use crate::ContentRef;
use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("shape {shape:?} holds {expected} values, got {actual}")]
    ShapeValueMismatch {
        shape: Vec<u32>,
        expected: usize,
        actual: usize,
    },

    #[error("shape {shape:?} overflows the addressable element count")]
    ShapeOverflow { shape: Vec<u32> },

    #[error("encoding failed: {0}")]
    Encode(#[source] std::io::Error),

    #[error("decoding failed: {0}")]
    Decode(#[source] std::io::Error),
}

/// A single dense layer tensor in row-major order
#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Tensor {
    shape: Vec<u32>,
    values: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<u32>, values: Vec<f32>) -> Result<Self, TensorError> {
        let tensor = Self { shape, values };
        tensor.validate()?;
        Ok(tensor)
    }

    /// One-dimensional tensor
    pub fn from_vec(values: Vec<f32>) -> Self {
        Self {
            shape: vec![values.len() as u32],
            values,
        }
    }

    /// Single-element layer
    pub fn scalar(value: f32) -> Self {
        Self::from_vec(vec![value])
    }

    pub fn zeros(shape: Vec<u32>) -> Result<Self, TensorError> {
        let len = element_count(&shape).ok_or_else(|| TensorError::ShapeOverflow { shape: shape.clone() })?;
        Ok(Self {
            shape,
            values: vec![0.0; len],
        })
    }

    /// Zero tensor with this tensor's shape
    pub fn zeros_like(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            values: vec![0.0; self.values.len()],
        }
    }

    pub fn shape(&self) -> &[u32] {
        &self.shape
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn validate(&self) -> Result<(), TensorError> {
        let expected = element_count(&self.shape).ok_or_else(|| TensorError::ShapeOverflow {
            shape: self.shape.clone(),
        })?;
        if expected != self.values.len() {
            return Err(TensorError::ShapeValueMismatch {
                shape: self.shape.clone(),
                expected,
                actual: self.values.len(),
            });
        }
        Ok(())
    }
}

/// `None` when the product of the dimensions does not fit in `usize`
fn element_count(shape: &[u32]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d as usize))
}

/// Ordered collection of layer tensors
#[derive(Debug, Clone, PartialEq, Default, BorshSerialize, BorshDeserialize)]
pub struct TensorSet {
    layers: Vec<Tensor>,
}

impl TensorSet {
    pub fn new(layers: Vec<Tensor>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[Tensor] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Tensor] {
        &mut self.layers
    }

    pub fn into_layers(self) -> Vec<Tensor> {
        self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// True when both sets have the same layer count and per-layer shapes
    pub fn same_shape(&self, other: &TensorSet) -> bool {
        self.layers.len() == other.layers.len()
            && self
                .layers
                .iter()
                .zip(&other.layers)
                .all(|(a, b)| a.shape == b.shape)
    }

    /// A set of zero tensors with this set's shapes
    pub fn zeros_like(&self) -> Self {
        Self {
            layers: self.layers.iter().map(Tensor::zeros_like).collect(),
        }
    }

    /// Serialize for the content store (fails on NaN values)
    pub fn encode(&self) -> Result<Vec<u8>, TensorError> {
        borsh::to_vec(self).map_err(TensorError::Encode)
    }

    /// Deserialize and validate every layer
    pub fn decode(data: &[u8]) -> Result<Self, TensorError> {
        let set: TensorSet = borsh::from_slice(data).map_err(TensorError::Decode)?;
        for layer in &set.layers {
            layer.validate()?;
        }
        Ok(set)
    }

    /// Content reference this set will be stored under
    pub fn content_ref(&self) -> Result<ContentRef, TensorError> {
        Ok(ContentRef::for_bytes(&self.encode()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_preserves_layers() {
        let set = TensorSet::new(vec![
            Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
            Tensor::scalar(0.5),
        ]);
        let bytes = set.encode().unwrap();
        let decoded = TensorSet::decode(&bytes).unwrap();
        assert_eq!(decoded, set);
        assert_eq!(set.content_ref().unwrap(), decoded.content_ref().unwrap());
    }

    #[test]
    fn test_shape_validation() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 5]).is_err());

        let a = TensorSet::new(vec![Tensor::zeros(vec![3]).unwrap()]);
        let b = TensorSet::new(vec![Tensor::zeros(vec![1, 3]).unwrap()]);
        assert!(!a.same_shape(&b));
        assert!(a.same_shape(&a.zeros_like()));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(TensorSet::decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_decode_rejects_overflowing_shape() {
        // Four dimensions of 2^16 wrap a 64-bit product to zero
        let huge = Tensor {
            shape: vec![65_536; 4],
            values: Vec::new(),
        };
        let bytes = borsh::to_vec(&TensorSet::new(vec![huge])).unwrap();
        assert!(matches!(
            TensorSet::decode(&bytes),
            Err(TensorError::ShapeOverflow { .. })
        ));
        assert!(Tensor::zeros(vec![u32::MAX; 4]).is_err());
    }

    #[test]
    fn test_nan_cannot_be_encoded() {
        let set = TensorSet::new(vec![Tensor::scalar(f32::NAN)]);
        assert!(set.encode().is_err());
    }
}
