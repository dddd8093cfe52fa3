//! Host-side tensor copies.
//!
//! Epoch buffers must not pin accelerator memory or keep autodiff graphs
//! alive, so everything captured for epoch-end reduction goes through
//! [`HostTensor::capture`], which detaches and reads the data back first.

use burn::tensor::{backend::Backend, Tensor};

use super::error::{ProbeError, Result, ResultExt};

/// A detached, host-resident copy of a float tensor
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl HostTensor {
    /// Detach `tensor` from any graph and copy it to host memory
    pub fn capture<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let values = to_host_vec(tensor.detach())?;
        Ok(Self { shape, values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of entries along the leading (batch) axis
    pub fn batch_size(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Concatenate along the leading axis. All parts must agree on the
    /// trailing dimensions.
    pub fn cat(parts: &[HostTensor]) -> Result<HostTensor> {
        let first = parts
            .first()
            .ok_or_else(|| ProbeError::Data("cannot concatenate zero tensors".to_string()))?;
        let trailing = &first.shape[1.min(first.shape.len())..];

        let mut batch = 0;
        let mut values = Vec::with_capacity(parts.iter().map(HostTensor::len).sum());
        for part in parts {
            let part_trailing = &part.shape[1.min(part.shape.len())..];
            if part.shape.len() != first.shape.len() || part_trailing != trailing {
                return Err(ProbeError::ShapeMismatch {
                    stage: "epoch buffer concatenation",
                    expected: first.shape.clone(),
                    actual: part.shape.clone(),
                });
            }
            batch += part.batch_size();
            values.extend_from_slice(&part.values);
        }

        let mut shape = first.shape.clone();
        if let Some(lead) = shape.first_mut() {
            *lead = batch;
        }
        Ok(HostTensor { shape, values })
    }
}

/// Read a float tensor back as a flat `Vec<f32>`, whatever the backend's
/// float element type is.
pub fn to_host_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .context("Failed to read tensor data")
}
