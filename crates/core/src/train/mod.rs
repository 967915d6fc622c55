//! Distributed training benchmark: synthetic data, gradient
//! synchronization and the timed SGD loop.

mod benchmark;
mod data;
mod error;
mod grad_sync;

pub use benchmark::{
    device_banner, statistics_line, trailing_mean, Benchmark, BenchmarkHeader, BenchmarkReport,
    BenchmarkSettings, StepRecord,
};
pub use data::SyntheticBatch;
pub use error::TrainError;
pub use grad_sync::GradSync;
