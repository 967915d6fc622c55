use candle_core::DType;

use crate::moe::{Activation, ExpertConfig, GateConfig, MoeLayerConfig, SeedConfig};
use crate::train::BenchmarkSettings;

/// Tiny MoE layer: model_dim 8, two experts per rank of hidden size 16, top-2.
pub fn tiny_layer_config() -> MoeLayerConfig {
    MoeLayerConfig {
        model_dim: 8,
        gate: GateConfig {
            top_k: 2,
            fp32_gate: true,
            capacity_factor: 0.0,
            normalize_gate: true,
        },
        experts: ExpertConfig {
            count_per_node: 2,
            hidden_size_per_expert: 16,
            activation: Activation::Relu,
        },
        seeds: SeedConfig { gate: 1, experts: 1 },
        dtype: DType::F32,
    }
}

/// Benchmark run of `num_steps` steps with a non-zero l_aux weight.
pub fn tiny_bench_settings(num_steps: usize) -> BenchmarkSettings {
    BenchmarkSettings {
        num_steps,
        l_aux_wt: 0.01,
        ..BenchmarkSettings::default()
    }
}
