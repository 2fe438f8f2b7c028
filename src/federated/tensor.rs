//! Model parameters exchanged between the coordinator and participants.
//!
//! A [`ParameterVector`] is an ordered list of dense tensors. The protocol
//! treats it as opaque apart from its shapes, which are fixed for the
//! lifetime of a training session.

use crate::core::{Error, Hash256, Result};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

/// Ordered collection of numeric tensors holding model weights.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterVector {
    tensors: Vec<ArrayD<f32>>,
}

impl ParameterVector {
    /// Wrap existing tensors.
    pub fn new(tensors: Vec<ArrayD<f32>>) -> Self {
        Self { tensors }
    }

    /// Build from `(shape, row-major values)` pairs.
    pub fn from_shaped(parts: Vec<(Vec<usize>, Vec<f32>)>) -> Result<Self> {
        let mut tensors = Vec::with_capacity(parts.len());
        for (index, (shape, values)) in parts.into_iter().enumerate() {
            let actual = vec![values.len()];
            let tensor =
                ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|_| Error::ShapeMismatch {
                    index,
                    expected: Some(shape.clone()),
                    actual: Some(actual),
                })?;
            tensors.push(tensor);
        }
        Ok(Self { tensors })
    }

    /// One single-element tensor per value.
    pub fn from_scalars(values: &[f32]) -> Self {
        let tensors = values
            .iter()
            .map(|v| ArrayD::from_elem(IxDyn(&[1]), *v))
            .collect();
        Self { tensors }
    }

    /// Zero-filled tensors with the given shapes.
    pub fn zeros(shapes: &[Vec<usize>]) -> Self {
        let tensors = shapes
            .iter()
            .map(|shape| ArrayD::zeros(IxDyn(shape)))
            .collect();
        Self { tensors }
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Borrow the tensors.
    pub fn tensors(&self) -> &[ArrayD<f32>] {
        &self.tensors
    }

    /// Take ownership of the tensors.
    pub fn into_tensors(self) -> Vec<ArrayD<f32>> {
        self.tensors
    }

    /// Shape of every tensor, in order.
    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.tensors.iter().map(|t| t.shape().to_vec()).collect()
    }

    /// Total number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.tensors.iter().map(|t| t.len()).sum()
    }

    /// Whether every value is finite.
    pub fn is_finite(&self) -> bool {
        self.tensors.iter().all(|t| t.iter().all(|v| v.is_finite()))
    }

    /// Check that `other` has the same tensor count and the same shape at
    /// every index as `self`.
    ///
    /// A differing tensor count is reported at the first index only one
    /// side has a tensor for.
    pub fn check_shapes(&self, other: &ParameterVector) -> Result<()> {
        let count = self.tensors.len().max(other.tensors.len());
        for index in 0..count {
            let ours = self.tensors.get(index).map(|t| t.shape());
            let theirs = other.tensors.get(index).map(|t| t.shape());
            if ours != theirs {
                return Err(Error::ShapeMismatch {
                    index,
                    expected: ours.map(<[usize]>::to_vec),
                    actual: theirs.map(<[usize]>::to_vec),
                });
            }
        }
        Ok(())
    }

    /// SHA3-256 over shapes and little-endian values.
    pub fn fingerprint(&self) -> Hash256 {
        let mut hasher = Sha3_256::new();
        hasher.update((self.tensors.len() as u64).to_le_bytes());
        for tensor in &self.tensors {
            hasher.update((tensor.ndim() as u64).to_le_bytes());
            for dim in tensor.shape() {
                hasher.update((*dim as u64).to_le_bytes());
            }
            for value in tensor.iter() {
                hasher.update(value.to_le_bytes());
            }
        }
        Hash256::new(hasher.finalize().into())
    }
}
