//! Distributed MoE training benchmark: CLI, config file, logging and the
//! process launcher around `moe-core`.

pub mod cli;
pub mod config;
mod error;
pub mod launcher;
pub mod logging;
pub mod run;

pub use error::BenchError;
