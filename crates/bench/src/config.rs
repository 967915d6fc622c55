//! Configuration file for the benchmark.
//!
//! Settings are resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (`--config <path>`, else ~/.config/moe-bench/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Benchmark settings read from a TOML file. Unset keys fall through to
/// the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BenchFileConfig {
    pub batch_size: Option<usize>,

    /// Tokens per sample.
    pub num_tokens: Option<usize>,

    pub model_dim: Option<usize>,

    /// FFN hidden size of every expert.
    pub hidden_size: Option<usize>,

    /// Experts held by each model rank.
    pub num_local_experts: Option<usize>,

    /// float32, float16 or bfloat16.
    pub dtype: Option<String>,

    pub fp32_gate: Option<bool>,

    /// Experts per token.
    pub top: Option<usize>,

    /// Weight of the load-balancing loss.
    pub l_aux_wt: Option<f64>,

    /// Number of model groups.
    pub group_count: Option<usize>,

    pub num_steps: Option<usize>,

    pub capacity_factor: Option<f32>,

    /// relu, gelu or silu.
    pub activation: Option<String>,

    pub log_level: Option<String>,
}

impl BenchFileConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("moe-bench").join("config.toml"))
    }

    /// Load from the default path, or defaults when it is absent or unreadable.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &BenchFileConfig) {
        fn take<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
            if other.is_some() {
                slot.clone_from(other);
            }
        }
        take(&mut self.batch_size, &other.batch_size);
        take(&mut self.num_tokens, &other.num_tokens);
        take(&mut self.model_dim, &other.model_dim);
        take(&mut self.hidden_size, &other.hidden_size);
        take(&mut self.num_local_experts, &other.num_local_experts);
        take(&mut self.dtype, &other.dtype);
        take(&mut self.fp32_gate, &other.fp32_gate);
        take(&mut self.top, &other.top);
        take(&mut self.l_aux_wt, &other.l_aux_wt);
        take(&mut self.group_count, &other.group_count);
        take(&mut self.num_steps, &other.num_steps);
        take(&mut self.capacity_factor, &other.capacity_factor);
        take(&mut self.activation, &other.activation);
        take(&mut self.log_level, &other.log_level);
    }
}

/// Configuration file errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot access config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse error: {0}")]
    Parse(toml::de::Error),
}
