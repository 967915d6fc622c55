use thiserror::Error;

use crate::distributed::DistributedError;
use crate::moe::MoeError;

/// Errors raised while running the benchmark loop.
#[derive(Error, Debug)]
pub enum TrainError {
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Distributed(#[from] DistributedError),

    #[error(transparent)]
    Moe(#[from] MoeError),

    #[error("failed to write benchmark output: {0}")]
    Output(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TrainError>;
