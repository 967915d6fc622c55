//! Device communicator for collective operations.
//!
//! Collectives are expressed on host `f32` buffers; the tensor-level helpers
//! stage device tensors through host memory and restore dtype and device.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use super::error::Result;
use super::process_group::ProcessGroup;

/// Reduction operations for collective primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise product.
    Product,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
    /// Average (sum / world_size).
    Average,
}

impl ReduceOp {
    /// Reduce `contributions` element-wise. All slices must share a length.
    pub fn reduce(self, contributions: &[&[f32]]) -> Vec<f32> {
        let Some((first, rest)) = contributions.split_first() else {
            return Vec::new();
        };
        let mut acc = first.to_vec();
        for other in rest {
            for (a, &b) in acc.iter_mut().zip(other.iter()) {
                *a = match self {
                    ReduceOp::Sum | ReduceOp::Average => *a + b,
                    ReduceOp::Product => *a * b,
                    ReduceOp::Min => a.min(b),
                    ReduceOp::Max => a.max(b),
                };
            }
        }
        if self == ReduceOp::Average {
            let n = contributions.len() as f32;
            acc.iter_mut().for_each(|a| *a /= n);
        }
        acc
    }
}

/// Trait for inter-process communication.
///
/// Implementations talk to peers over a transport, or are no-ops for a
/// single-member group.
pub trait DeviceCommunicator: Send + Sync {
    /// Get the underlying process group.
    fn process_group(&self) -> &dyn ProcessGroup;

    /// All-reduce a host buffer; every member receives the same result.
    fn all_reduce_host(&self, data: Vec<f32>, op: ReduceOp) -> Result<Vec<f32>>;

    /// All-to-all on a host buffer.
    ///
    /// The buffer is split into `world_size` equal chunks. Chunk `i` goes to
    /// member `i`; the result holds the chunk addressed to this member from
    /// every member, in group order.
    fn all_to_all_host(&self, data: Vec<f32>) -> Result<Vec<f32>>;

    /// Barrier: synchronize all members.
    fn barrier(&self) -> Result<()>;

    /// All-reduce a tensor, keeping its shape, dtype and device.
    ///
    /// For a single-member group this is identity.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        if self.process_group().is_single() {
            return Ok(tensor.clone());
        }
        let host = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let reduced = self.all_reduce_host(host, op)?;
        let out = Tensor::from_vec(reduced, tensor.dims(), tensor.device())?;
        Ok(out.to_dtype(tensor.dtype())?)
    }
}

/// Communicator for a single-member group.
///
/// All collective operations are identity/no-ops since there's only one rank.
pub struct LocalCommunicator<P: ProcessGroup> {
    process_group: P,
}

impl<P: ProcessGroup> LocalCommunicator<P> {
    /// Create a new local communicator with the given process group.
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }
}

impl<P: ProcessGroup + Send + Sync> DeviceCommunicator for LocalCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce_host(&self, data: Vec<f32>, op: ReduceOp) -> Result<Vec<f32>> {
        Ok(op.reduce(&[&data]))
    }

    fn all_to_all_host(&self, data: Vec<f32>) -> Result<Vec<f32>> {
        Ok(data)
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}
