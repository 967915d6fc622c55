//! Shared test utilities for moe-core.
//!
//! This module provides tiny layer configurations and an in-process
//! cluster harness that runs several ranks as threads against a real
//! rendezvous hub on the loopback interface.

mod cluster;
mod tiny_config;

pub use cluster::{local_communicator, run_cluster};
pub use tiny_config::{tiny_bench_settings, tiny_layer_config};
