//! Batched FFN experts held by one model rank.

use candle_core::{DType, Device, Result, Tensor, Var};
use rand::rngs::StdRng;

use super::config::{Activation, ExpertConfig};
use super::init::uniform_var;
use super::ops::matmul;

/// `L` independent two-layer FFNs evaluated as one batched matmul.
///
/// Weights are stored stacked along a leading expert dimension:
/// `fc1_w [L, D, H]`, `fc1_b [L, 1, H]`, `fc2_w [L, H, D]`, `fc2_b [L, 1, D]`.
pub struct FfnExperts {
    fc1_w: Var,
    fc1_b: Var,
    fc2_w: Var,
    fc2_b: Var,
    activation: Activation,
    num_local_experts: usize,
    hidden_size: usize,
}

impl FfnExperts {
    pub fn new(
        model_dim: usize,
        config: &ExpertConfig,
        dtype: DType,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let l = config.count_per_node;
        let h = config.hidden_size_per_expert;
        let fc1_w = uniform_var(&[l, model_dim, h], model_dim, rng, dtype, device)?;
        let fc1_b = uniform_var(&[l, 1, h], model_dim, rng, dtype, device)?;
        let fc2_w = uniform_var(&[l, h, model_dim], h, rng, dtype, device)?;
        let fc2_b = uniform_var(&[l, 1, model_dim], h, rng, dtype, device)?;
        Ok(Self {
            fc1_w,
            fc1_b,
            fc2_w,
            fc2_b,
            activation: config.activation,
            num_local_experts: l,
            hidden_size: h,
        })
    }

    /// `xs`: `[L, M, D]` with row `l` feeding local expert `l`. Returns `[L, M, D]`.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs.contiguous()?;
        let hidden = matmul(&xs, self.fc1_w.as_tensor())?.broadcast_add(self.fc1_b.as_tensor())?;
        let hidden = self.activation.apply(&hidden)?;
        matmul(&hidden, self.fc2_w.as_tensor())?.broadcast_add(self.fc2_b.as_tensor())
    }

    pub fn num_local_experts(&self) -> usize {
        self.num_local_experts
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Named parameters in a stable order.
    pub fn named_vars(&self) -> Vec<(&'static str, Var)> {
        vec![
            ("fc1_w", self.fc1_w.clone()),
            ("fc1_b", self.fc1_b.clone()),
            ("fc2_w", self.fc2_w.clone()),
            ("fc2_b", self.fc2_b.clone()),
        ]
    }
}
