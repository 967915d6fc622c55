//! Expert-parallel MoE layer.
//!
//! Experts are spread across the model group: with `W` model ranks and `L`
//! experts per rank there are `E = W * L` global experts, and global expert
//! `e` lives on model rank `e / L` as local expert `e % L`.
//!
//! ## Forward pass
//!
//! ```text
//! 1. Gate (replicated): top-k experts per token, l_aux
//! 2. Capacity: fixed from the factor, or the busiest expert across the model group
//! 3. Encode: tokens -> [E * C, D] slots, grouped by owning rank
//! 4. all_to_all: every rank receives the slots of its own L experts
//! 5. Local FFN over [L, W * C, D]
//! 6. all_to_all back, then decode with gate weights
//! ```
//!
//! Both exchanges are differentiable, so the backward pass runs the mirrored
//! exchanges in the same order on every rank.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use candle_core::{bail, Device, Result as CandleResult, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::config::MoeLayerConfig;
use super::dispatch::{expert_loads, resolve_capacity, DispatchPlan};
use super::error::Result;
use super::experts::FfnExperts;
use super::gate::TopKGate;
use crate::distributed::{all_to_all, DeviceCommunicator, ReduceOp};

/// Parameter class, deciding how gradients are synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// Replicated on every rank.
    Gate,
    /// Sharded over the model group; replicated only across the data group.
    LocalExperts,
}

impl ParamKind {
    /// Whether the parameter is excluded from the global all-reduce.
    pub fn skip_allreduce(self) -> bool {
        matches!(self, ParamKind::LocalExperts)
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParamKind::Gate => "gate",
            ParamKind::LocalExperts => "local_experts",
        })
    }
}

/// A trainable tensor together with its class.
#[derive(Debug, Clone)]
pub struct NamedParam {
    pub name: String,
    pub var: Var,
    pub kind: ParamKind,
}

/// Result of one MoE forward pass.
#[derive(Debug)]
pub struct MoeOutput {
    /// Same shape and dtype as the input.
    pub output: Tensor,
    /// Load-balancing loss (f32 scalar).
    pub l_aux: Tensor,
    pub capacity: usize,
    /// Assignments dropped for lack of capacity on this rank.
    pub dropped: usize,
}

pub struct MoeLayer {
    gate: TopKGate,
    experts: FfnExperts,
    config: MoeLayerConfig,
    model_group: Arc<dyn DeviceCommunicator>,
    model_rank: usize,
    model_size: usize,
}

impl MoeLayer {
    /// Build the layer for this rank's position in `model_group`.
    ///
    /// The gate is drawn from `config.seeds.gate`, the local experts from
    /// `config.seeds.experts`.
    pub fn new(
        config: MoeLayerConfig,
        model_group: Arc<dyn DeviceCommunicator>,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let model_size = model_group.process_group().world_size();
        let model_rank = model_group.process_group().rank();
        let num_global_experts = config.experts.count_per_node * model_size;

        let gate = TopKGate::new(
            config.model_dim,
            num_global_experts,
            &config.gate,
            config.gate_dtype(),
            device,
            &mut StdRng::seed_from_u64(config.seeds.gate),
        )?;
        let experts = FfnExperts::new(
            config.model_dim,
            &config.experts,
            config.dtype,
            device,
            &mut StdRng::seed_from_u64(config.seeds.experts),
        )?;

        tracing::debug!(
            model_rank,
            model_size,
            num_global_experts,
            local_experts = ?(model_rank * config.experts.count_per_node
                ..(model_rank + 1) * config.experts.count_per_node),
            "MoE layer initialized"
        );

        Ok(Self {
            gate,
            experts,
            config,
            model_group,
            model_rank,
            model_size,
        })
    }

    pub fn config(&self) -> &MoeLayerConfig {
        &self.config
    }

    pub fn num_global_experts(&self) -> usize {
        self.gate.num_global_experts()
    }

    pub fn num_local_experts(&self) -> usize {
        self.experts.num_local_experts()
    }

    pub fn top_k(&self) -> usize {
        self.gate.top_k()
    }

    /// Model rank that owns global expert `expert`.
    pub fn expert_owner(&self, expert: usize) -> usize {
        expert / self.num_local_experts()
    }

    /// Global ids of the experts held by this rank.
    pub fn local_expert_range(&self) -> Range<usize> {
        let l = self.num_local_experts();
        self.model_rank * l..(self.model_rank + 1) * l
    }

    /// Parameters of class `kind`.
    pub fn parameters(&self, kind: ParamKind) -> Vec<NamedParam> {
        match kind {
            ParamKind::Gate => vec![NamedParam {
                name: "gate.wg".to_string(),
                var: self.gate.weight().clone(),
                kind,
            }],
            ParamKind::LocalExperts => self
                .experts
                .named_vars()
                .into_iter()
                .map(|(name, var)| NamedParam {
                    name: format!("experts.{name}"),
                    var,
                    kind,
                })
                .collect(),
        }
    }

    /// Gate parameters followed by local expert parameters.
    pub fn all_parameters(&self) -> Vec<NamedParam> {
        let mut params = self.parameters(ParamKind::Gate);
        params.extend(self.parameters(ParamKind::LocalExperts));
        params
    }

    /// Element count of all parameters of class `kind`.
    pub fn param_count(&self, kind: ParamKind) -> usize {
        self.parameters(kind).iter().map(|p| p.var.elem_count()).sum()
    }

    /// Run the layer on `xs` of shape `[..., model_dim]`.
    pub fn forward(&self, xs: &Tensor) -> CandleResult<MoeOutput> {
        let dims = xs.dims().to_vec();
        let Some(&model_dim) = dims.last() else {
            bail!("MoE input must have at least one dimension")
        };
        if model_dim != self.config.model_dim {
            bail!(
                "MoE input last dim {model_dim} does not match model_dim {}",
                self.config.model_dim
            )
        }
        let num_tokens = xs.elem_count() / model_dim;
        let flat = xs.reshape((num_tokens, model_dim))?;

        let routing = self.gate.forward(&flat)?;
        let capacity = self.capacity(&routing.top_ids, num_tokens)?;
        let plan = DispatchPlan::new(
            &routing.top_ids,
            num_tokens,
            self.top_k(),
            self.num_global_experts(),
            capacity,
        );
        if plan.dropped > 0 {
            tracing::trace!(dropped = plan.dropped, capacity, "assignments over capacity");
        }

        let w = self.model_size;
        let l = self.num_local_experts();
        let dispatched = plan.encode(&flat.to_dtype(self.config.dtype)?)?;
        let received = all_to_all(&dispatched, &self.model_group)?;
        let expert_in = received
            .reshape((w, l, capacity, model_dim))?
            .transpose(0, 1)?
            .contiguous()?
            .reshape((l, w * capacity, model_dim))?;

        let expert_out = self.experts.forward(&expert_in)?;

        let returning = expert_out
            .reshape((l, w, capacity, model_dim))?
            .transpose(0, 1)?
            .contiguous()?
            .reshape((w * l * capacity, model_dim))?;
        let returned = all_to_all(&returning, &self.model_group)?;
        let combined = plan.decode(&returned, &routing.gates)?;

        Ok(MoeOutput {
            output: combined.to_dtype(xs.dtype())?.reshape(dims)?,
            l_aux: routing.l_aux.to_dtype(candle_core::DType::F32)?,
            capacity,
            dropped: plan.dropped,
        })
    }

    /// Per-expert capacity for this step, identical on every model rank.
    fn capacity(&self, top_ids: &[u32], num_tokens: usize) -> CandleResult<usize> {
        let factor = self.config.gate.capacity_factor;
        let top_k = self.top_k();
        let experts = self.num_global_experts();
        if factor > 0.0 {
            return Ok(resolve_capacity(factor, top_k, num_tokens, experts, 0));
        }
        let local_max = expert_loads(top_ids, experts).into_iter().max().unwrap_or(0);
        let reduced = self
            .model_group
            .all_reduce_host(vec![local_max as f32], ReduceOp::Max)
            .map_err(candle_core::Error::wrap)?;
        let global_max = reduced.first().map_or(local_max, |&m| m as usize);
        Ok(resolve_capacity(factor, top_k, num_tokens, experts, global_max))
    }
}

impl fmt::Display for MoeLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MoeLayer(model_dim={}, num_global_experts={}, num_local_experts={}, \
             hidden_size_per_expert={}, top_k={}, fp32_gate={}, capacity_factor={}, \
             activation={}, dtype={:?})",
            self.config.model_dim,
            self.num_global_experts(),
            self.num_local_experts(),
            self.experts.hidden_size(),
            self.top_k(),
            self.config.gate.fp32_gate,
            self.config.gate.capacity_factor,
            self.experts.activation(),
            self.config.dtype,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{LocalCommunicator, LocalProcessGroup};
    use crate::moe::{Activation, ExpertConfig, GateConfig, SeedConfig};
    use candle_core::DType;

    fn layer(top_k: usize, capacity_factor: f32, dtype: DType) -> MoeLayer {
        build(layer_config(top_k, capacity_factor, dtype))
    }

    fn layer_config(top_k: usize, capacity_factor: f32, dtype: DType) -> MoeLayerConfig {
        MoeLayerConfig {
            model_dim: 8,
            gate: GateConfig {
                top_k,
                fp32_gate: true,
                capacity_factor,
                normalize_gate: true,
            },
            experts: ExpertConfig {
                count_per_node: 3,
                hidden_size_per_expert: 16,
                activation: Activation::Relu,
            },
            seeds: SeedConfig { gate: 1, experts: 1 },
            dtype,
        }
    }

    fn build(config: MoeLayerConfig) -> MoeLayer {
        let comm: Arc<dyn DeviceCommunicator> =
            Arc::new(LocalCommunicator::new(LocalProcessGroup::new()));
        MoeLayer::new(config, comm, &Device::Cpu).unwrap()
    }

    #[test]
    fn forward_preserves_shape() {
        let moe = layer(2, 0.0, DType::F32);
        let xs = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu).unwrap();
        let out = moe.forward(&xs).unwrap();
        assert_eq!(out.output.dims(), &[2, 5, 8]);
        assert_eq!(out.dropped, 0);
        assert_eq!(out.l_aux.dims(), &[] as &[usize]);
    }

    #[test]
    fn tight_capacity_drops_assignments() {
        // 10 tokens, 3 experts, top-1: fixed capacity floor(0.1 * 4) = 0 -> 1
        let moe = layer(1, 0.1, DType::F32);
        let xs = Tensor::randn(0f32, 1.0, (10, 8), &Device::Cpu).unwrap();
        let out = moe.forward(&xs).unwrap();
        assert_eq!(out.capacity, 1);
        assert!(out.dropped >= 7);
    }

    #[test]
    fn rejects_wrong_model_dim() {
        let moe = layer(2, 0.0, DType::F32);
        let xs = Tensor::zeros((4, 7), DType::F32, &Device::Cpu).unwrap();
        assert!(moe.forward(&xs).is_err());
    }

    #[test]
    fn parameter_classes() {
        let moe = layer(2, 0.0, DType::F32);
        assert_eq!(moe.param_count(ParamKind::Gate), 3 * 8);
        assert_eq!(
            moe.param_count(ParamKind::LocalExperts),
            3 * (8 * 16 + 16 + 16 * 8 + 8)
        );
        let params = moe.all_parameters();
        assert_eq!(params.len(), 5);
        assert_eq!(params[0].name, "gate.wg");
        assert!(params[1..].iter().all(|p| p.kind.skip_allreduce()));
        assert!(!ParamKind::Gate.skip_allreduce());
    }

    #[test]
    fn expert_placement_is_contiguous() {
        let moe = layer(2, 0.0, DType::F32);
        assert_eq!(moe.local_expert_range(), 0..3);
        assert_eq!(moe.expert_owner(2), 0);
    }

    #[test]
    fn half_precision_forward_keeps_dtype() {
        let moe = layer(2, 0.0, DType::F16);
        let xs = Tensor::randn(0f32, 1.0, (4, 8), &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        let out = moe.forward(&xs).unwrap();
        assert_eq!(out.output.dtype(), DType::F16);
        assert_eq!(out.l_aux.dtype(), DType::F32);
    }

    #[test]
    fn bf16_forward_and_backward_on_cpu() {
        for fp32_gate in [true, false] {
            let mut config = layer_config(2, 0.0, DType::BF16);
            config.gate.fp32_gate = fp32_gate;
            let moe = build(config);
            let xs = Tensor::randn(0f32, 1.0, (2, 3, 8), &Device::Cpu)
                .unwrap()
                .to_dtype(DType::BF16)
                .unwrap();
            let out = moe.forward(&xs).unwrap();
            assert_eq!(out.output.dtype(), DType::BF16);
            assert_eq!(out.output.dims(), &[2, 3, 8]);

            let loss = (out
                .output
                .to_dtype(DType::F32)
                .unwrap()
                .sqr()
                .unwrap()
                .sum_all()
                .unwrap()
                + out.l_aux)
                .unwrap();
            let grads = loss.backward().unwrap();
            for p in moe.all_parameters() {
                let grad = grads.get(p.var.as_tensor()).unwrap();
                assert_eq!(grad.dtype(), p.var.dtype(), "{} (fp32_gate={fp32_gate})", p.name);
            }
        }
    }

    #[test]
    fn every_parameter_gets_a_gradient() {
        let moe = layer(2, 0.0, DType::F32);
        let xs = Tensor::randn(0f32, 1.0, (6, 8), &Device::Cpu).unwrap();
        let out = moe.forward(&xs).unwrap();
        let loss = (out.output.sqr().unwrap().sum_all().unwrap() + out.l_aux).unwrap();
        let grads = loss.backward().unwrap();
        for p in moe.all_parameters() {
            assert!(grads.get(p.var.as_tensor()).is_some(), "{} has no grad", p.name);
        }
    }

    #[test]
    fn display_summarizes_layer() {
        let moe = layer(2, 0.0, DType::F32);
        let s = moe.to_string();
        assert!(s.contains("num_global_experts=3"));
        assert!(s.contains("activation=relu"));
    }
}
