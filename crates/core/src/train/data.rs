//! Synthetic benchmark batch.

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use super::error::Result;

/// Fixed inputs reused for every step.
#[derive(Debug)]
pub struct SyntheticBatch {
    /// `[batch_size, num_tokens, model_dim]`, standard normal.
    pub x: Tensor,
    /// `[batch_size]` class targets, all zero.
    pub y: Tensor,
}

impl SyntheticBatch {
    /// Draw the batch from a generator seeded with `seed` (the global rank),
    /// so every rank sees different data and reruns are reproducible.
    pub fn generate(
        batch_size: usize,
        num_tokens: usize,
        model_dim: usize,
        seed: u64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let len = batch_size * num_tokens * model_dim;
        let data: Vec<f32> = (0..len).map(|_| StandardNormal.sample(&mut rng)).collect();
        let x = Tensor::from_vec(data, (batch_size, num_tokens, model_dim), &Device::Cpu)?
            .to_dtype(dtype)?
            .to_device(device)?;
        let y = Tensor::zeros(batch_size, DType::U32, device)?;
        Ok(Self { x, y })
    }
}
