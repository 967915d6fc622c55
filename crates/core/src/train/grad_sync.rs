//! Gradient synchronization between backward and the optimizer step.
//!
//! - Gate parameters are replicated on every rank: their gradients are
//!   divided by the global size and summed over the global group.
//! - Local expert parameters exist once per model group: their gradients are
//!   divided by the group count and summed over the data group.
//!
//! Each class travels as one flattened bucket. A parameter without a
//! gradient contributes zeros so every rank sends buckets of equal length.

use std::sync::Arc;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};

use super::error::Result;
use crate::distributed::{DeviceCommunicator, DistributedError, ParallelEnv, ReduceOp};
use crate::moe::{NamedParam, ParamKind};

struct Bucket {
    vars: Vec<Var>,
    comm: Arc<dyn DeviceCommunicator>,
    divisor: f32,
}

pub struct GradSync {
    buckets: Vec<Bucket>,
}

impl GradSync {
    pub fn new(params: &[NamedParam], env: &ParallelEnv) -> Self {
        Self::with_groups(params, Arc::clone(&env.global_group), Arc::clone(&env.data_group))
    }

    /// Build from explicit groups. The divisors are the group sizes.
    pub fn with_groups(
        params: &[NamedParam],
        global_group: Arc<dyn DeviceCommunicator>,
        data_group: Arc<dyn DeviceCommunicator>,
    ) -> Self {
        let pick = |kind: ParamKind| -> Vec<Var> {
            params
                .iter()
                .filter(|p| p.kind == kind)
                .map(|p| p.var.clone())
                .collect()
        };
        let global_size = global_group.process_group().world_size();
        let group_count = data_group.process_group().world_size();
        Self {
            buckets: vec![
                Bucket {
                    vars: pick(ParamKind::Gate),
                    comm: global_group,
                    divisor: global_size as f32,
                },
                Bucket {
                    vars: pick(ParamKind::LocalExperts),
                    comm: data_group,
                    divisor: group_count as f32,
                },
            ],
        }
    }

    /// Replace the gradients in `grads` with their synchronized values.
    pub fn synchronize(&self, grads: &mut GradStore) -> Result<()> {
        for bucket in &self.buckets {
            reduce_bucket(bucket, grads)?;
        }
        Ok(())
    }
}

fn reduce_bucket(bucket: &Bucket, grads: &mut GradStore) -> Result<()> {
    if bucket.vars.is_empty() || bucket.comm.process_group().is_single() {
        return Ok(());
    }

    let total: usize = bucket.vars.iter().map(|v| v.elem_count()).sum();
    let mut flat = Vec::with_capacity(total);
    for var in &bucket.vars {
        match grads.get(var.as_tensor()) {
            Some(grad) => flat.extend(grad.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?),
            None => flat.extend(std::iter::repeat(0f32).take(var.elem_count())),
        }
    }
    for value in flat.iter_mut() {
        *value /= bucket.divisor;
    }

    let reduced = bucket.comm.all_reduce_host(flat, ReduceOp::Sum)?;
    if reduced.len() != total {
        return Err(DistributedError::ShapeMismatch {
            expected: vec![total],
            actual: vec![reduced.len()],
        }
        .into());
    }

    let mut offset = 0;
    for var in &bucket.vars {
        let len = var.elem_count();
        let grad = Tensor::from_slice(&reduced[offset..offset + len], var.shape(), &Device::Cpu)?
            .to_dtype(var.dtype())?
            .to_device(var.device())?;
        grads.insert(var.as_tensor(), grad);
        offset += len;
    }
    Ok(())
}
