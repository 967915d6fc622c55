//! Tensor helpers shared by the gate and the experts.

use candle_core::{DType, Result, Tensor};

/// `a.matmul(b)`.
///
/// The CPU backend has no BF16 matmul kernel, so BF16 operands on CPU are
/// multiplied in f32 and the product is narrowed back. Gradients flow through
/// both casts.
pub(crate) fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    if a.dtype() == DType::BF16 && a.device().is_cpu() {
        let product = a.to_dtype(DType::F32)?.matmul(&b.to_dtype(DType::F32)?)?;
        return product.to_dtype(DType::BF16);
    }
    a.matmul(b)
}
