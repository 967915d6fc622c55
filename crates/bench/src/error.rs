use moe_core::distributed::DistributedError;
use moe_core::dtype::UnrecognizedDType;
use moe_core::moe::MoeError;
use moe_core::train::TrainError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that abort a benchmark run.
#[derive(Error, Debug)]
pub enum BenchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error(transparent)]
    DType(#[from] UnrecognizedDType),

    #[error(transparent)]
    Distributed(#[from] DistributedError),

    #[error(transparent)]
    Moe(#[from] MoeError),

    #[error(transparent)]
    Train(#[from] TrainError),

    #[error("failed to write report: {0}")]
    Output(#[from] std::io::Error),
}
