//! Error types for distributed operations.

use thiserror::Error;

/// Errors that can occur during distributed operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// The process was started without a distributed launcher.
    #[error(
        "the current session is not launched in distributed mode; \
         run the program with: moe-launch --nproc_per_node <N> -- <program> ..."
    )]
    NotLaunched,

    /// A launcher environment variable holds a value that cannot be used.
    #[error("invalid value {value:?} for environment variable {name}")]
    InvalidEnv { name: String, value: String },

    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Devices cannot be split evenly into the requested number of groups.
    #[error("world size {world_size} cannot be evenly divided into {group_count} groups")]
    UnevenGroups {
        world_size: usize,
        group_count: usize,
    },

    /// Tensor shape mismatch for collective operation.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Peers disagreed on the collective or sent malformed frames.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The rendezvous hub reported a failed collective.
    #[error("collective failed: {0}")]
    CollectiveFailed(String),

    /// Communication timeout.
    #[error("communication timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Socket level failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
