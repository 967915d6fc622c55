//! Command line flags and their resolution against the config file.

use std::path::PathBuf;

use clap::Parser;
use moe_core::dtype::DataType;
use moe_core::moe::Activation;

use crate::config::BenchFileConfig;
use crate::error::BenchError;

/// Distributed MoE training benchmark.
///
/// Must be started by a launcher (e.g. `moe-launch --nproc_per_node 2 -- moe-bench`).
#[derive(Parser, Debug)]
#[command(name = "moe-bench", version, about)]
pub struct Args {
    /// Device ordinal, used when the launcher does not set LOCAL_RANK.
    #[arg(long = "local_rank", default_value_t = -1, allow_hyphen_values = true)]
    pub local_rank: i64,

    #[arg(long = "batch_size")]
    pub batch_size: Option<usize>,

    #[arg(long = "num_tokens")]
    pub num_tokens: Option<usize>,

    #[arg(long = "model_dim")]
    pub model_dim: Option<usize>,

    #[arg(long = "hidden_size")]
    pub hidden_size: Option<usize>,

    #[arg(long = "num_local_experts")]
    pub num_local_experts: Option<usize>,

    /// float32, float16 or bfloat16.
    #[arg(long = "dtype")]
    pub dtype: Option<String>,

    /// Run the gate in f32 regardless of --dtype.
    #[arg(long = "fp32_gate")]
    pub fp32_gate: bool,

    /// Experts per token.
    #[arg(long = "top")]
    pub top: Option<usize>,

    #[arg(long = "l_aux_wt", allow_hyphen_values = true)]
    pub l_aux_wt: Option<f64>,

    /// Number of model groups the ranks are split into.
    #[arg(long = "group_count")]
    pub group_count: Option<usize>,

    #[arg(long = "num_steps")]
    pub num_steps: Option<usize>,

    /// Per-expert capacity factor; 0 grows capacity to the busiest expert.
    #[arg(long = "capacity_factor", allow_hyphen_values = true)]
    pub capacity_factor: Option<f32>,

    /// relu, gelu or silu.
    #[arg(long = "activation")]
    pub activation: Option<String>,

    /// TOML config file (default: ~/.config/moe-bench/config.toml when present).
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset.
    #[arg(long = "log_level")]
    pub log_level: Option<String>,
}

impl Args {
    /// Flags given on the command line, as a config overlay.
    fn as_overlay(&self) -> BenchFileConfig {
        BenchFileConfig {
            batch_size: self.batch_size,
            num_tokens: self.num_tokens,
            model_dim: self.model_dim,
            hidden_size: self.hidden_size,
            num_local_experts: self.num_local_experts,
            dtype: self.dtype.clone(),
            fp32_gate: self.fp32_gate.then_some(true),
            top: self.top,
            l_aux_wt: self.l_aux_wt,
            group_count: self.group_count,
            num_steps: self.num_steps,
            capacity_factor: self.capacity_factor,
            activation: self.activation.clone(),
            log_level: self.log_level.clone(),
        }
    }

    /// Load the config file named by `--config`, or the default one.
    ///
    /// An explicit path must exist; the default path is optional.
    pub fn file_config(&self) -> Result<BenchFileConfig, BenchError> {
        match &self.config {
            Some(path) => Ok(BenchFileConfig::load_from(path)?),
            None => Ok(BenchFileConfig::load()),
        }
    }

    /// Resolve CLI over `file` over defaults.
    ///
    /// `dtype` is kept as text; see [`BenchOptions::data_type`].
    pub fn resolve(&self, file: BenchFileConfig) -> Result<BenchOptions, BenchError> {
        let mut merged = file;
        merged.merge(&self.as_overlay());

        let activation = match merged.activation.as_deref() {
            Some(name) => name.parse::<Activation>()?,
            None => Activation::Relu,
        };
        let options = BenchOptions {
            local_rank: self.local_rank,
            batch_size: merged.batch_size.unwrap_or(16),
            num_tokens: merged.num_tokens.unwrap_or(1024),
            model_dim: merged.model_dim.unwrap_or(2048),
            hidden_size: merged.hidden_size.unwrap_or(2048),
            num_local_experts: merged.num_local_experts.unwrap_or(2),
            dtype: merged.dtype.unwrap_or_else(|| DataType::default().to_string()),
            fp32_gate: merged.fp32_gate.unwrap_or(false),
            top: merged.top.unwrap_or(2),
            l_aux_wt: merged.l_aux_wt.unwrap_or(0.0),
            group_count: merged.group_count.unwrap_or(1),
            num_steps: merged.num_steps.unwrap_or(100),
            capacity_factor: merged.capacity_factor.unwrap_or(0.0),
            activation,
            log_level: merged.log_level,
        };
        options.validate()?;
        Ok(options)
    }
}

/// Fully resolved benchmark settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchOptions {
    pub local_rank: i64,
    pub batch_size: usize,
    pub num_tokens: usize,
    pub model_dim: usize,
    pub hidden_size: usize,
    pub num_local_experts: usize,
    pub dtype: String,
    pub fp32_gate: bool,
    pub top: usize,
    pub l_aux_wt: f64,
    pub group_count: usize,
    pub num_steps: usize,
    pub capacity_factor: f32,
    pub activation: Activation,
    pub log_level: Option<String>,
}

impl BenchOptions {
    fn validate(&self) -> Result<(), BenchError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("num_tokens", self.num_tokens),
            ("model_dim", self.model_dim),
            ("hidden_size", self.hidden_size),
            ("num_local_experts", self.num_local_experts),
            ("top", self.top),
            ("group_count", self.group_count),
            ("num_steps", self.num_steps),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(BenchError::InvalidOption(format!("--{name} must be at least 1")));
            }
        }
        if !self.l_aux_wt.is_finite() {
            return Err(BenchError::InvalidOption("--l_aux_wt must be finite".to_string()));
        }
        Ok(())
    }

    /// Parse `--dtype`. Unknown names are fatal.
    pub fn data_type(&self) -> Result<DataType, BenchError> {
        Ok(self.dtype.parse::<DataType>()?)
    }

    pub fn samples(&self) -> usize {
        self.batch_size * self.num_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("moe-bench").chain(args.iter().copied()))
    }

    #[test]
    fn defaults() {
        let options = parse(&[]).resolve(BenchFileConfig::default()).unwrap();
        assert_eq!(options.local_rank, -1);
        assert_eq!(options.batch_size, 16);
        assert_eq!(options.num_tokens, 1024);
        assert_eq!(options.model_dim, 2048);
        assert_eq!(options.hidden_size, 2048);
        assert_eq!(options.num_local_experts, 2);
        assert_eq!(options.dtype, "float32");
        assert!(!options.fp32_gate);
        assert_eq!(options.top, 2);
        assert_eq!(options.l_aux_wt, 0.0);
        assert_eq!(options.group_count, 1);
        assert_eq!(options.num_steps, 100);
        assert_eq!(options.capacity_factor, 0.0);
        assert_eq!(options.activation, Activation::Relu);
    }

    #[test]
    fn underscore_flags() {
        let options = parse(&[
            "--local_rank",
            "3",
            "--batch_size",
            "4",
            "--num_local_experts",
            "8",
            "--fp32_gate",
            "--l_aux_wt",
            "0.01",
            "--group_count",
            "2",
            "--dtype",
            "bfloat16",
        ])
        .resolve(BenchFileConfig::default())
        .unwrap();
        assert_eq!(options.local_rank, 3);
        assert_eq!(options.batch_size, 4);
        assert_eq!(options.num_local_experts, 8);
        assert!(options.fp32_gate);
        assert_eq!(options.l_aux_wt, 0.01);
        assert_eq!(options.group_count, 2);
        assert_eq!(options.data_type().unwrap(), DataType::Bfloat16);
    }

    #[test]
    fn cli_overrides_file() {
        let file = BenchFileConfig {
            batch_size: Some(8),
            model_dim: Some(512),
            fp32_gate: Some(true),
            ..Default::default()
        };
        let options = parse(&["--batch_size", "2"]).resolve(file).unwrap();
        assert_eq!(options.batch_size, 2);
        assert_eq!(options.model_dim, 512);
        assert!(options.fp32_gate);
    }

    #[test]
    fn unknown_dtype_is_an_error() {
        let options = parse(&["--dtype", "float64"])
            .resolve(BenchFileConfig::default())
            .unwrap();
        assert!(matches!(options.data_type(), Err(BenchError::DType(_))));
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(matches!(
            parse(&["--top", "0"]).resolve(BenchFileConfig::default()),
            Err(BenchError::InvalidOption(_))
        ));
        assert!(matches!(
            parse(&["--activation", "tanh"]).resolve(BenchFileConfig::default()),
            Err(BenchError::Moe(_))
        ));
    }

    #[test]
    fn negative_capacity_factor_parses() {
        let options = parse(&["--capacity_factor", "-1.5"])
            .resolve(BenchFileConfig::default())
            .unwrap();
        assert_eq!(options.capacity_factor, -1.5);
    }

    #[test]
    fn samples_is_batch_times_tokens() {
        let options = parse(&["--batch_size", "3", "--num_tokens", "5"])
            .resolve(BenchFileConfig::default())
            .unwrap();
        assert_eq!(options.samples(), 15);
    }
}
