//! Benchmark driver: join the session, build the model, train, report.

use std::io::Write;

use moe_core::distributed::{DeviceLabel, DistributedConfig, ParallelEnv};
use moe_core::model::ExampleModel;
use moe_core::moe::{ExpertConfig, GateConfig, MoeLayerConfig, SeedConfig};
use moe_core::train::{
    device_banner, statistics_line, Benchmark, BenchmarkHeader, BenchmarkReport,
    BenchmarkSettings, SyntheticBatch,
};

use crate::cli::BenchOptions;
use crate::error::BenchError;

/// Whether the launcher chose the device ordinal.
pub fn launcher_sets_local_rank() -> bool {
    ["LOCAL_RANK", "OMPI_COMM_WORLD_LOCAL_RANK"]
        .iter()
        .any(|name| std::env::var_os(name).is_some())
}

/// Use `--local_rank` as the device ordinal when the launcher left it unset.
pub fn apply_local_rank_flag(config: &mut DistributedConfig, flag: i64, launcher_set: bool) {
    if !launcher_set {
        if let Ok(local_rank) = usize::try_from(flag) {
            config.local_rank = local_rank;
        }
    }
}

/// Run the whole benchmark on this rank, writing report lines to `out`.
///
/// `Device-*` lines are written by every rank, everything else by global
/// rank 0 only.
pub fn run(
    options: &BenchOptions,
    config: &DistributedConfig,
    out: &mut dyn Write,
) -> Result<BenchmarkReport, BenchError> {
    let env = ParallelEnv::init(config, options.group_count)?;
    let _span = tracing::info_span!("rank", rank = env.global_rank).entered();
    let report = run_with_env(options, &env, out)?;
    out.flush()?;
    env.shutdown()?;
    Ok(report)
}

/// Everything after joining the session.
pub fn run_with_env(
    options: &BenchOptions,
    env: &ParallelEnv,
    out: &mut dyn Write,
) -> Result<BenchmarkReport, BenchError> {
    writeln!(out, "{}", device_banner(env))?;

    let data_type = options.data_type()?;
    let layer_config = MoeLayerConfig {
        model_dim: options.model_dim,
        gate: GateConfig {
            top_k: options.top,
            fp32_gate: options.fp32_gate,
            capacity_factor: options.capacity_factor,
            normalize_gate: true,
        },
        experts: ExpertConfig {
            count_per_node: options.num_local_experts,
            hidden_size_per_expert: options.hidden_size,
            activation: options.activation,
        },
        seeds: SeedConfig::default(),
        dtype: data_type.dtype(),
    };
    let model = ExampleModel::for_env(layer_config, env)?;

    if env.is_coordinator() {
        writeln!(out, "{}", statistics_line(model.moe_layer()))?;
        writeln!(out, "{model}")?;
        let header = BenchmarkHeader {
            world_size: env.global_size,
            dtype: data_type,
            model_dim: options.model_dim,
            hidden_size: options.hidden_size,
            samples: options.samples(),
            num_local_experts: options.num_local_experts,
            top_k: options.top,
            device: DeviceLabel(&env.local_device).to_string(),
            group_count: env.group_count,
        };
        writeln!(out, "{header}")?;
    }

    let batch = SyntheticBatch::generate(
        options.batch_size,
        options.num_tokens,
        options.model_dim,
        env.global_rank as u64,
        data_type.dtype(),
        &env.local_device,
    )
    .map_err(moe_core::train::TrainError::from)?;

    let settings = BenchmarkSettings {
        num_steps: options.num_steps,
        l_aux_wt: options.l_aux_wt,
        ..BenchmarkSettings::default()
    };
    tracing::info!(
        num_steps = settings.num_steps,
        learning_rate = settings.learning_rate,
        "starting benchmark"
    );
    let mut bench = Benchmark::new(&model, env, batch, settings)?;
    let report = bench.run(out)?;
    tracing::info!(
        average_step_time = report.average_step_time,
        "benchmark finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Args;
    use crate::config::BenchFileConfig;
    use clap::Parser;

    #[test]
    fn local_rank_flag_only_fills_gaps() {
        let mut config = DistributedConfig::single_process();
        apply_local_rank_flag(&mut config, 3, false);
        assert_eq!(config.local_rank, 3);

        apply_local_rank_flag(&mut config, 5, true);
        assert_eq!(config.local_rank, 3);

        apply_local_rank_flag(&mut config, -1, false);
        assert_eq!(config.local_rank, 3);
    }

    #[test]
    fn run_requires_launcher() {
        let options = Args::parse_from(["moe-bench"])
            .resolve(BenchFileConfig::default())
            .unwrap();
        let err = run(&options, &DistributedConfig::single_process(), &mut Vec::new()).unwrap_err();
        assert!(matches!(err, BenchError::Distributed(_)));
        assert!(err.to_string().contains("not launched in distributed mode"));
    }
}
