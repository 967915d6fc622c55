//! Mixture of Experts (MoE) layer with expert parallelism.
//!
//! ## Submodules
//!
//! - [`config`]: Gate, expert and seed configuration
//! - [`gate`]: Top-k softmax gate with load-balancing loss
//! - [`dispatch`]: Capacity resolution and token dispatch/combine
//! - [`experts`]: Batched FFN experts held by one rank
//! - [`layer`]: Expert-parallel layer tying the pieces together

pub mod config;
pub mod dispatch;
mod error;
pub mod experts;
pub mod gate;
mod init;
pub mod layer;
mod ops;

pub use config::{Activation, ExpertConfig, GateConfig, MoeLayerConfig, SeedConfig};
pub use dispatch::{expert_loads, fixed_capacity, resolve_capacity, DispatchPlan};
pub use error::MoeError;
pub use experts::FfnExperts;
pub use gate::{GateOutput, TopKGate};
pub use layer::{MoeLayer, MoeOutput, NamedParam, ParamKind};
