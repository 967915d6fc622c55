//! Distributed computing abstractions for SPMD expert-parallel training.
//!
//! This module provides:
//! - [`ProcessGroup`] - Process group management (ranks, world size)
//! - [`DeviceCommunicator`] - Collective operations (all_reduce, all_to_all, barrier)
//! - [`ParallelEnv`] - Global, model and data groups for one process
//!
//! # Architecture
//!
//! - Single member groups: all operations are identity/no-op
//! - Multi member groups: collectives are executed by a rendezvous hub hosted
//!   by global rank 0 and reached over TCP
//!
//! # Usage
//!
//! ```ignore
//! use moe_core::distributed::{DistributedConfig, ParallelEnv};
//!
//! let config = DistributedConfig::from_env()?;
//! let env = ParallelEnv::init(&config, 1)?;
//! env.dist_print(format!("world size = {}", env.global_size));
//! ```

mod autograd;
mod communicator;
mod error;
mod launcher;
mod parallel_env;
mod process_group;
mod rendezvous;
mod transport;
mod wire;

pub use autograd::all_to_all;
pub use communicator::{DeviceCommunicator, LocalCommunicator, ReduceOp};
pub use error::DistributedError;
pub use launcher::DistributedConfig;
pub use parallel_env::{select_device, DeviceLabel, ParallelEnv};
pub use process_group::{GroupLayout, LocalProcessGroup, ProcessGroup};
pub use rendezvous::RendezvousServer;
pub use transport::{GroupCommunicator, TcpTransport};
pub use wire::CollectiveKind;
