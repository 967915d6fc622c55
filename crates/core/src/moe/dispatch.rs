//! Capacity-bounded token dispatch and combine.
//!
//! ```text
//! tokens [N, D] --encode--> expert slots [E * C, D]   (slot = expert * C + position)
//! expert slots [E * C, D] --decode(gates)--> tokens [N, D]
//! ```
//!
//! Slots are filled in priority order: every token's first choice before any
//! token's second choice, tokens in order within a choice. Assignments that
//! find their expert full are dropped and contribute nothing to the output.

use candle_core::{Device, Result, Tensor};

/// Number of assignments per expert in `top_ids`.
pub fn expert_loads(top_ids: &[u32], num_experts: usize) -> Vec<usize> {
    let mut loads = vec![0usize; num_experts];
    for &e in top_ids {
        loads[e as usize] += 1;
    }
    loads
}

/// Fixed capacity for a positive factor: `top_k * floor(factor * ceil(N / E))`.
pub fn fixed_capacity(factor: f32, top_k: usize, num_tokens: usize, num_experts: usize) -> usize {
    let per_expert = num_tokens.div_ceil(num_experts.max(1));
    top_k * (factor * per_expert as f32).floor() as usize
}

/// Resolve the per-expert capacity.
///
/// `global_max_load` is the busiest expert's load across the model group and
/// is only consulted for non-positive factors. The result is at least 1.
pub fn resolve_capacity(
    factor: f32,
    top_k: usize,
    num_tokens: usize,
    num_experts: usize,
    global_max_load: usize,
) -> usize {
    let capacity = if factor > 0.0 {
        fixed_capacity(factor, top_k, num_tokens, num_experts)
    } else if factor < 0.0 {
        global_max_load.min(fixed_capacity(-factor, top_k, num_tokens, num_experts))
    } else {
        global_max_load
    };
    capacity.max(1)
}

/// Slot assignment for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPlan {
    pub num_tokens: usize,
    pub top_k: usize,
    pub num_experts: usize,
    pub capacity: usize,
    /// Source token of each kept assignment.
    pub token_ids: Vec<u32>,
    /// Destination slot of each kept assignment.
    pub slot_ids: Vec<u32>,
    /// Index into the flattened `[N, k]` gate tensor.
    pub gate_ids: Vec<u32>,
    /// Assignments rejected because their expert was full.
    pub dropped: usize,
}

impl DispatchPlan {
    pub fn new(
        top_ids: &[u32],
        num_tokens: usize,
        top_k: usize,
        num_experts: usize,
        capacity: usize,
    ) -> Self {
        let mut fill = vec![0usize; num_experts];
        let mut token_ids = Vec::with_capacity(top_ids.len());
        let mut slot_ids = Vec::with_capacity(top_ids.len());
        let mut gate_ids = Vec::with_capacity(top_ids.len());
        let mut dropped = 0;

        for k in 0..top_k {
            for n in 0..num_tokens {
                let gate_id = n * top_k + k;
                let expert = top_ids[gate_id] as usize;
                let position = fill[expert];
                if position >= capacity {
                    dropped += 1;
                    continue;
                }
                fill[expert] += 1;
                token_ids.push(n as u32);
                slot_ids.push((expert * capacity + position) as u32);
                gate_ids.push(gate_id as u32);
            }
        }

        Self {
            num_tokens,
            top_k,
            num_experts,
            capacity,
            token_ids,
            slot_ids,
            gate_ids,
            dropped,
        }
    }

    pub fn kept(&self) -> usize {
        self.token_ids.len()
    }

    fn index(ids: &[u32], device: &Device) -> Result<Tensor> {
        Tensor::from_vec(ids.to_vec(), ids.len(), device)
    }

    /// Scatter tokens `[N, D]` into expert slots `[E * C, D]`. Empty slots are zero.
    pub fn encode(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, dim) = xs.dims2()?;
        let slots = Tensor::zeros((self.num_experts * self.capacity, dim), xs.dtype(), xs.device())?;
        if self.token_ids.is_empty() {
            return Ok(slots);
        }
        let tokens = Self::index(&self.token_ids, xs.device())?;
        let dest = Self::index(&self.slot_ids, xs.device())?;
        slots.index_add(&dest, &xs.index_select(&tokens, 0)?, 0)
    }

    /// Gather expert outputs `[E * C, D]` back to tokens `[N, D]`, weighting
    /// each assignment by its gate value.
    pub fn decode(&self, expert_out: &Tensor, gates: &Tensor) -> Result<Tensor> {
        let (_, dim) = expert_out.dims2()?;
        let device = expert_out.device();
        let out = Tensor::zeros((self.num_tokens, dim), expert_out.dtype(), device)?;
        if self.token_ids.is_empty() {
            return Ok(out);
        }
        let tokens = Self::index(&self.token_ids, device)?;
        let slots = Self::index(&self.slot_ids, device)?;
        let gate_ids = Self::index(&self.gate_ids, device)?;

        let picked = expert_out.index_select(&slots, 0)?;
        let weights = gates
            .flatten_all()?
            .index_select(&gate_ids, 0)?
            .to_dtype(expert_out.dtype())?
            .unsqueeze(1)?;
        out.index_add(&tokens, &picked.broadcast_mul(&weights)?, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn loads_count_every_assignment() {
        assert_eq!(expert_loads(&[0, 1, 1, 2, 1, 0], 4), vec![2, 3, 1, 0]);
    }

    #[test]
    fn capacity_resolution() {
        // ceil(10 / 4) = 3; floor(1.5 * 3) = 4; top_k 2 -> 8
        assert_eq!(fixed_capacity(1.5, 2, 10, 4), 8);
        assert_eq!(resolve_capacity(1.5, 2, 10, 4, 100), 8);
        assert_eq!(resolve_capacity(0.0, 2, 10, 4, 7), 7);
        assert_eq!(resolve_capacity(-1.5, 2, 10, 4, 100), 8);
        assert_eq!(resolve_capacity(-1.5, 2, 10, 4, 5), 5);
        assert_eq!(resolve_capacity(0.0, 2, 10, 4, 0), 1);
        assert_eq!(resolve_capacity(0.01, 1, 1, 4, 0), 1);
    }

    #[test]
    fn first_choices_take_priority() {
        // Three tokens, top-2, everyone picks expert 0 first.
        let top_ids = [0, 1, 0, 1, 0, 1];
        let plan = DispatchPlan::new(&top_ids, 3, 2, 2, 2);
        assert_eq!(plan.token_ids, vec![0, 1, 0, 1]);
        assert_eq!(plan.slot_ids, vec![0, 1, 2, 3]);
        assert_eq!(plan.gate_ids, vec![0, 2, 1, 3]);
        assert_eq!(plan.dropped, 2);
        assert_eq!(plan.kept(), 4);
    }

    #[test]
    fn encode_places_tokens_in_slots() {
        let xs = Tensor::new(&[[1f32, 1.0], [2.0, 2.0], [3.0, 3.0]], &Device::Cpu).unwrap();
        let plan = DispatchPlan::new(&[1, 0, 1], 3, 1, 2, 2);
        let slots = plan.encode(&xs).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(
            slots,
            vec![
                vec![2.0, 2.0],
                vec![0.0, 0.0],
                vec![1.0, 1.0],
                vec![3.0, 3.0],
            ]
        );
    }

    #[test]
    fn decode_weights_and_sums_assignments() {
        let xs = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let plan = DispatchPlan::new(&[0, 1, 1, 0], 2, 2, 2, 4);
        let slots = plan.encode(&xs).unwrap();
        let gates = Tensor::new(&[[0.75f32, 0.25], [0.5, 0.5]], &Device::Cpu).unwrap();
        // Identity experts with gates summing to one reproduce the input.
        let out = plan.decode(&slots, &gates).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(out, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
    }

    #[test]
    fn dropped_tokens_decode_to_zero() {
        let xs = Tensor::ones((3, 2), DType::F32, &Device::Cpu).unwrap();
        let plan = DispatchPlan::new(&[0, 0, 0], 3, 1, 1, 1);
        let slots = plan.encode(&xs).unwrap();
        let gates = Tensor::ones((3, 1), DType::F32, &Device::Cpu).unwrap();
        let out = plan.decode(&slots, &gates).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(out[0], vec![1.0, 1.0]);
        assert_eq!(out[1], vec![0.0, 0.0]);
        assert_eq!(out[2], vec![0.0, 0.0]);
        assert_eq!(plan.dropped, 2);
    }
}
