use std::io::{self, Write};

use clap::Parser;
use moe_bench::cli::Args;
use moe_bench::logging::{self, LogFormat};
use moe_bench::run::{apply_local_rank_flag, launcher_sets_local_rank, run};
use moe_core::distributed::DistributedConfig;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let file = args.file_config()?;
    let options = args.resolve(file)?;

    logging::init(options.log_level.as_deref(), LogFormat::from_env());

    let mut config = DistributedConfig::from_env()?;
    apply_local_rank_flag(&mut config, options.local_rank, launcher_sets_local_rank());
    tracing::debug!(?config, "launch environment");

    let stdout = io::stdout();
    let mut out = stdout.lock();
    run(&options, &config, &mut out)?;
    out.flush()?;
    Ok(())
}
