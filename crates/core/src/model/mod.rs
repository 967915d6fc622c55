//! Benchmark model: one MoE layer followed by a token reduction and a
//! log-softmax over the sample dimension.

use std::fmt;
use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::distributed::ParallelEnv;
use crate::moe::{MoeError, MoeLayer, MoeLayerConfig, SeedConfig};

/// Outputs of [`ExampleModel::forward`].
#[derive(Debug)]
pub struct ModelOutput {
    /// `[batch, tokens]` log-probabilities, normalized over the token dimension.
    pub log_probs: Tensor,
    /// Load-balancing loss from the MoE layer (f32 scalar).
    pub l_aux: Tensor,
}

pub struct ExampleModel {
    moe_layer: MoeLayer,
}

impl ExampleModel {
    pub fn new(moe_layer: MoeLayer) -> Self {
        Self { moe_layer }
    }

    /// Build the model for this rank: the gate is seeded identically on every
    /// rank and the experts with `model_rank + 1`, so data-parallel replicas
    /// of an expert shard start equal.
    pub fn for_env(mut config: MoeLayerConfig, env: &ParallelEnv) -> std::result::Result<Self, MoeError> {
        config.seeds = SeedConfig {
            gate: 1,
            experts: env.model_rank as u64 + 1,
        };
        let moe_layer = MoeLayer::new(config, Arc::clone(&env.model_group), &env.local_device)?;
        Ok(Self::new(moe_layer))
    }

    pub fn moe_layer(&self) -> &MoeLayer {
        &self.moe_layer
    }

    /// `xs`: `[batch, tokens, model_dim]`.
    pub fn forward(&self, xs: &Tensor) -> Result<ModelOutput> {
        let out = self.moe_layer.forward(xs)?;
        let summed = out.output.sum(2)?;
        let log_probs = candle_nn::ops::log_softmax(&summed, 1)?;
        Ok(ModelOutput {
            log_probs,
            l_aux: out.l_aux,
        })
    }
}

impl fmt::Display for ExampleModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ExampleModel(")?;
        writeln!(f, "  (moe_layer): {}", self.moe_layer)?;
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{local_communicator, tiny_layer_config};
    use candle_core::{DType, Device};

    #[test]
    fn log_probs_normalized_over_tokens() {
        let moe = MoeLayer::new(tiny_layer_config(), local_communicator(), &Device::Cpu).unwrap();
        let model = ExampleModel::new(moe);
        let xs = Tensor::randn(0f32, 1.0, (3, 5, 8), &Device::Cpu).unwrap();
        let out = model.forward(&xs).unwrap();
        assert_eq!(out.log_probs.dims(), &[3, 5]);

        let sums = out
            .log_probs
            .exp()
            .unwrap()
            .sum(1)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-4);
        }
        assert_eq!(out.l_aux.dtype(), DType::F32);
    }

    #[test]
    fn display_wraps_moe_layer() {
        let moe = MoeLayer::new(tiny_layer_config(), local_communicator(), &Device::Cpu).unwrap();
        let s = ExampleModel::new(moe).to_string();
        assert!(s.starts_with("ExampleModel("));
        assert!(s.contains("(moe_layer): MoeLayer("));
    }
}
