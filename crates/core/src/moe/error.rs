//! Error types for MoE layer construction.

use thiserror::Error;

use crate::distributed::DistributedError;

#[derive(Error, Debug)]
pub enum MoeError {
    /// A configuration value is out of range.
    #[error("invalid MoE configuration: {0}")]
    InvalidConfig(String),

    /// Unknown expert activation name.
    #[error("unknown activation {0:?}; expected one of relu, gelu, silu")]
    UnknownActivation(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Distributed(#[from] DistributedError),
}

pub type Result<T> = std::result::Result<T, MoeError>;
