//! Top-k gate.
//!
//! Scores every token against every global expert with a bias-free linear
//! projection followed by softmax, keeps the `k` best experts per token and
//! reports the GShard load-balancing loss.

use candle_core::{DType, Device, Result, Tensor, Var, D};
use rand::rngs::StdRng;

use super::config::GateConfig;
use super::init::uniform_var;
use super::ops::matmul;

/// Routing decision for a flattened batch of `N` tokens.
#[derive(Debug)]
pub struct GateOutput {
    /// Softmax scores `[N, E]` in the gate dtype.
    pub scores: Tensor,
    /// Selected experts, row-major `[N, k]`, best first.
    pub top_ids: Vec<u32>,
    /// Weights of the selected experts `[N, k]`, differentiable.
    pub gates: Tensor,
    /// Load-balancing loss (scalar, gate dtype).
    pub l_aux: Tensor,
}

/// Linear top-k gate over `num_global_experts` experts.
pub struct TopKGate {
    /// `[E, D]`
    weight: Var,
    num_global_experts: usize,
    top_k: usize,
    normalize_gate: bool,
    dtype: DType,
}

impl TopKGate {
    /// Create the gate, drawing its weight from `rng`.
    ///
    /// `top_k` is clamped to the number of experts.
    pub fn new(
        model_dim: usize,
        num_global_experts: usize,
        config: &GateConfig,
        dtype: DType,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let weight = uniform_var(&[num_global_experts, model_dim], model_dim, rng, dtype, device)?;
        Ok(Self {
            weight,
            num_global_experts,
            top_k: config.top_k.min(num_global_experts),
            normalize_gate: config.normalize_gate,
            dtype,
        })
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn num_global_experts(&self) -> usize {
        self.num_global_experts
    }

    /// Route `xs` of shape `[N, D]`.
    pub fn forward(&self, xs: &Tensor) -> Result<GateOutput> {
        let (num_tokens, _) = xs.dims2()?;
        let xs = xs.to_dtype(self.dtype)?;
        let logits = matmul(&xs, &self.weight.as_tensor().t()?)?;
        let scores = candle_nn::ops::softmax(&logits, D::Minus1)?;

        let top = scores
            .arg_sort_last_dim(false)?
            .narrow(1, 0, self.top_k)?
            .contiguous()?;
        let gates = scores.contiguous()?.gather(&top, 1)?;
        let gates = if self.normalize_gate && self.top_k > 1 {
            let eps = Tensor::new(epsilon(self.dtype), xs.device())?.to_dtype(self.dtype)?;
            let denom = gates.sum_keepdim(1)?.broadcast_maximum(&eps)?;
            gates.broadcast_div(&denom)?
        } else {
            gates
        };

        let top_ids = top.flatten_all()?.to_vec1::<u32>()?;
        let l_aux = self.load_balancing_loss(&scores, &top_ids, num_tokens)?;

        Ok(GateOutput {
            scores,
            top_ids,
            gates,
            l_aux,
        })
    }

    /// `E / N^2 * sum_e(score_sum[e] * top1_count[e])`
    fn load_balancing_loss(&self, scores: &Tensor, top_ids: &[u32], num_tokens: usize) -> Result<Tensor> {
        let mut counts = vec![0f32; self.num_global_experts];
        for token in top_ids.chunks(self.top_k) {
            counts[token[0] as usize] += 1.0;
        }
        let ce = Tensor::from_vec(counts, self.num_global_experts, scores.device())?
            .to_dtype(scores.dtype())?;
        let me = scores.sum(0)?;
        let scale = self.num_global_experts as f64 / (num_tokens * num_tokens).max(1) as f64;
        (me * ce)?.sum_all()?.affine(scale, 0.0)
    }
}

fn epsilon(dtype: DType) -> f32 {
    match dtype {
        DType::F16 => 9.765_625e-4,
        DType::BF16 => 7.812_5e-3,
        _ => f32::EPSILON,
    }
}
