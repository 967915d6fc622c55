//! Start one benchmark process per device:
//!
//! ```text
//! moe-launch --nproc_per_node 4 -- moe-bench --num_local_experts 2
//! ```

use std::ffi::OsString;

use clap::Parser;
use moe_bench::launcher::{spawn_workers, wait_for_workers, LaunchPlan};
use moe_bench::logging::{self, LogFormat};

#[derive(Parser, Debug)]
#[command(name = "moe-launch", version, about = "Launch a distributed MoE benchmark session")]
struct LaunchArgs {
    /// Processes to start on this node, one per device.
    #[arg(long = "nproc_per_node")]
    nproc_per_node: usize,

    #[arg(long = "nnodes", default_value_t = 1)]
    nnodes: usize,

    #[arg(long = "node_rank", default_value_t = 0)]
    node_rank: usize,

    /// Address of the node running global rank 0.
    #[arg(long = "master_addr", default_value = "127.0.0.1")]
    master_addr: String,

    #[arg(long = "master_port", default_value_t = 29500)]
    master_port: u16,

    /// Program and its arguments.
    #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
    command: Vec<OsString>,
}

fn main() -> anyhow::Result<()> {
    let args = LaunchArgs::parse();
    logging::init(None, LogFormat::from_env());

    let mut command = args.command.into_iter();
    let program = command
        .next()
        .ok_or_else(|| anyhow::anyhow!("no program given to launch"))?;
    let plan = LaunchPlan {
        nproc_per_node: args.nproc_per_node,
        nnodes: args.nnodes,
        node_rank: args.node_rank,
        master_addr: args.master_addr,
        master_port: args.master_port,
        program,
        args: command.collect(),
    };

    let workers = spawn_workers(&plan)?;
    let code = wait_for_workers(workers);
    if code != 0 {
        tracing::error!(code, "at least one worker failed");
        std::process::exit(code);
    }
    Ok(())
}
