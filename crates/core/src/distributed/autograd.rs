//! Differentiable collectives.
//!
//! The all-to-all exchange is a permutation of chunks across ranks, so its
//! adjoint is the same exchange applied to the incoming gradient. Every rank
//! builds the same graph, which keeps the backward-pass collectives in
//! lockstep.

use std::sync::Arc;

use candle_core::{bail, CpuStorage, CustomOp1, Device, Layout, Result, Shape, Tensor};
use half::{bf16, f16};

use super::communicator::DeviceCommunicator;

struct AllToAllOp {
    comm: Arc<dyn DeviceCommunicator>,
}

impl AllToAllOp {
    fn exchange(&self, data: Vec<f32>) -> Result<Vec<f32>> {
        self.comm
            .all_to_all_host(data)
            .map_err(candle_core::Error::wrap)
    }
}

impl CustomOp1 for AllToAllOp {
    fn name(&self) -> &'static str {
        "all_to_all"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let Some((start, end)) = layout.contiguous_offsets() else {
            bail!("all_to_all: input must be contiguous")
        };
        let shape = layout.shape().clone();

        let out = match storage {
            CpuStorage::F32(v) => CpuStorage::F32(self.exchange(v[start..end].to_vec())?),
            CpuStorage::F16(v) => {
                let host = v[start..end].iter().map(|x| x.to_f32()).collect();
                let out = self.exchange(host)?;
                CpuStorage::F16(out.into_iter().map(f16::from_f32).collect())
            }
            CpuStorage::BF16(v) => {
                let host = v[start..end].iter().map(|x| x.to_f32()).collect();
                let out = self.exchange(host)?;
                CpuStorage::BF16(out.into_iter().map(bf16::from_f32).collect())
            }
            _ => bail!("all_to_all: only f32, f16 and bf16 tensors are supported"),
        };
        Ok((out, shape))
    }

    fn bwd(&self, _arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        Ok(Some(all_to_all(grad_res, &self.comm)?))
    }
}

/// All-to-all over `comm` that participates in backpropagation.
///
/// Dimension 0 of `xs` is split into `world_size` equal chunks; chunk `i`
/// goes to member `i`. The result has the same shape, holding the chunks
/// addressed to this member in group order. Tensors on accelerators are
/// staged through host memory.
pub fn all_to_all(xs: &Tensor, comm: &Arc<dyn DeviceCommunicator>) -> Result<Tensor> {
    let world_size = comm.process_group().world_size();
    if world_size == 1 {
        return Ok(xs.clone());
    }
    let rows = xs.dim(0)?;
    if rows % world_size != 0 {
        bail!("all_to_all: dim 0 ({rows}) is not divisible by group size {world_size}")
    }

    let op = AllToAllOp {
        comm: Arc::clone(comm),
    };
    match xs.device() {
        Device::Cpu => xs.contiguous()?.apply_op1(op),
        device => {
            let host = xs.to_device(&Device::Cpu)?.contiguous()?.apply_op1(op)?;
            host.to_device(device)
        }
    }
}
