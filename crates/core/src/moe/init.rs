//! Seeded parameter initialization.

use candle_core::{DType, Device, Result, Tensor, Var};
use rand::rngs::StdRng;
use rand::Rng;

/// Variable of `shape` drawn from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
///
/// Values are generated on the host in f32 so the same seed yields the same
/// parameters regardless of dtype or device.
pub(crate) fn uniform_var(
    shape: &[usize],
    fan_in: usize,
    rng: &mut StdRng,
    dtype: DType,
    device: &Device,
) -> Result<Var> {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    let len: usize = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|_| rng.gen_range(-bound..bound)).collect();
    let tensor = Tensor::from_vec(data, shape, &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)?;
    Var::from_tensor(&tensor)
}
