//! MoE layer configuration.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Result as CandleResult, Tensor};

use super::error::{MoeError, Result};

/// Top-k gate settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    /// Number of experts each token is routed to.
    pub top_k: usize,
    /// Compute the gate projection and softmax in f32 regardless of model dtype.
    pub fp32_gate: bool,
    /// Per-expert capacity factor.
    ///
    /// - `> 0`: fixed capacity `top_k * floor(factor * ceil(tokens / experts))`
    /// - `0`: capacity grows to the busiest expert (no drops)
    /// - `< 0`: like `0`, capped at the fixed capacity for `-factor`
    pub capacity_factor: f32,
    /// Renormalize the selected gate values to sum to one when `top_k > 1`.
    pub normalize_gate: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            top_k: 2,
            fp32_gate: false,
            capacity_factor: 0.0,
            normalize_gate: true,
        }
    }
}

/// Expert FFN activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    Relu,
    Gelu,
    Silu,
}

impl Activation {
    pub fn apply(self, xs: &Tensor) -> CandleResult<Tensor> {
        match self {
            Activation::Relu => xs.relu(),
            Activation::Gelu => xs.gelu(),
            Activation::Silu => xs.silu(),
        }
    }
}

impl FromStr for Activation {
    type Err = MoeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "gelu" => Ok(Activation::Gelu),
            "silu" | "swish" => Ok(Activation::Silu),
            _ => Err(MoeError::UnknownActivation(s.to_string())),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Activation::Relu => "relu",
            Activation::Gelu => "gelu",
            Activation::Silu => "silu",
        })
    }
}

/// Expert FFN settings, per model rank.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpertConfig {
    /// Experts held by each model rank.
    pub count_per_node: usize,
    /// FFN hidden width of every expert.
    pub hidden_size_per_expert: usize,
    pub activation: Activation,
}

/// Initialization seeds.
///
/// The gate seed must be identical on every rank so the replicated gate
/// starts equal everywhere; the expert seed differs per model rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedConfig {
    pub gate: u64,
    pub experts: u64,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            gate: 1,
            experts: 1,
        }
    }
}

/// Full MoE layer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MoeLayerConfig {
    pub model_dim: usize,
    pub gate: GateConfig,
    pub experts: ExpertConfig,
    pub seeds: SeedConfig,
    /// Parameter and activation dtype. The gate stays in f32 with `fp32_gate`.
    pub dtype: DType,
}

impl MoeLayerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model_dim == 0 {
            return Err(MoeError::InvalidConfig("model_dim must be > 0".to_string()));
        }
        if self.gate.top_k == 0 {
            return Err(MoeError::InvalidConfig("top_k must be > 0".to_string()));
        }
        if self.experts.count_per_node == 0 {
            return Err(MoeError::InvalidConfig(
                "count_per_node must be > 0".to_string(),
            ));
        }
        if self.experts.hidden_size_per_expert == 0 {
            return Err(MoeError::InvalidConfig(
                "hidden_size_per_expert must be > 0".to_string(),
            ));
        }
        if !self.gate.capacity_factor.is_finite() {
            return Err(MoeError::InvalidConfig(format!(
                "capacity_factor must be finite, got {}",
                self.gate.capacity_factor
            )));
        }
        if !matches!(self.dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(MoeError::InvalidConfig(format!(
                "unsupported dtype {:?}",
                self.dtype
            )));
        }
        Ok(())
    }

    /// Dtype of the gate weight and routing scores.
    pub fn gate_dtype(&self) -> DType {
        if self.gate.fp32_gate {
            DType::F32
        } else {
            self.dtype
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MoeLayerConfig {
        MoeLayerConfig {
            model_dim: 8,
            gate: GateConfig::default(),
            experts: ExpertConfig {
                count_per_node: 2,
                hidden_size_per_expert: 16,
                activation: Activation::Relu,
            },
            seeds: SeedConfig::default(),
            dtype: DType::F32,
        }
    }

    #[test]
    fn valid_config_passes() {
        config().validate().unwrap();
    }

    #[test]
    fn zero_sizes_rejected() {
        let mut c = config();
        c.gate.top_k = 0;
        assert!(matches!(c.validate(), Err(MoeError::InvalidConfig(_))));

        let mut c = config();
        c.experts.count_per_node = 0;
        assert!(c.validate().is_err());

        let mut c = config();
        c.model_dim = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn non_float_dtype_rejected() {
        let mut c = config();
        c.dtype = DType::U32;
        assert!(c.validate().is_err());
    }

    #[test]
    fn gate_dtype_follows_fp32_flag() {
        let mut c = config();
        c.dtype = DType::BF16;
        assert_eq!(c.gate_dtype(), DType::BF16);
        c.gate.fp32_gate = true;
        assert_eq!(c.gate_dtype(), DType::F32);
    }

    #[test]
    fn activation_parsing() {
        assert_eq!("ReLU".parse::<Activation>().unwrap(), Activation::Relu);
        assert_eq!("swish".parse::<Activation>().unwrap(), Activation::Silu);
        assert_eq!(Activation::Gelu.to_string(), "gelu");
        assert!(matches!(
            "tanh".parse::<Activation>(),
            Err(MoeError::UnknownActivation(_))
        ));
    }
}
