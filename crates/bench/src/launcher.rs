//! Single- and multi-node process launcher.
//!
//! Starts `nproc_per_node` copies of a program on this node, each told its
//! place in the session through the standard distributed environment
//! variables:
//!
//! | Variable      | Value |
//! |---------------|-------|
//! | `RANK`        | `node_rank * nproc_per_node + local_rank` |
//! | `WORLD_SIZE`  | `nnodes * nproc_per_node` |
//! | `LOCAL_RANK`  | `0..nproc_per_node` |
//! | `LOCAL_SIZE`  | `nproc_per_node` |
//! | `MASTER_ADDR` | address of the node running global rank 0 |
//! | `MASTER_PORT` | rendezvous port |

use std::ffi::OsString;
use std::process::{Child, Command, ExitStatus};

/// What to launch and where it sits in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub nproc_per_node: usize,
    pub nnodes: usize,
    pub node_rank: usize,
    pub master_addr: String,
    pub master_port: u16,
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl LaunchPlan {
    pub fn world_size(&self) -> usize {
        self.nnodes * self.nproc_per_node
    }

    pub fn global_rank(&self, local_rank: usize) -> usize {
        self.node_rank * self.nproc_per_node + local_rank
    }

    /// Environment for the worker with `local_rank` on this node.
    pub fn worker_env(&self, local_rank: usize) -> Vec<(&'static str, String)> {
        vec![
            ("RANK", self.global_rank(local_rank).to_string()),
            ("WORLD_SIZE", self.world_size().to_string()),
            ("LOCAL_RANK", local_rank.to_string()),
            ("LOCAL_SIZE", self.nproc_per_node.to_string()),
            ("MASTER_ADDR", self.master_addr.clone()),
            ("MASTER_PORT", self.master_port.to_string()),
        ]
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.nproc_per_node == 0 {
            anyhow::bail!("--nproc_per_node must be at least 1");
        }
        if self.nnodes == 0 {
            anyhow::bail!("--nnodes must be at least 1");
        }
        if self.node_rank >= self.nnodes {
            anyhow::bail!(
                "--node_rank {} out of range for {} node(s)",
                self.node_rank,
                self.nnodes
            );
        }
        Ok(())
    }
}

/// Spawn every worker of this node.
///
/// If a spawn fails, already started workers are killed before returning
/// the error.
pub fn spawn_workers(plan: &LaunchPlan) -> anyhow::Result<Vec<Child>> {
    plan.validate()?;
    let mut workers = Vec::with_capacity(plan.nproc_per_node);
    for local_rank in 0..plan.nproc_per_node {
        tracing::info!(
            rank = plan.global_rank(local_rank),
            local_rank,
            world_size = plan.world_size(),
            master_addr = %plan.master_addr,
            master_port = plan.master_port,
            "spawning worker"
        );
        let spawned = Command::new(&plan.program)
            .args(&plan.args)
            .envs(plan.worker_env(local_rank))
            .spawn();
        match spawned {
            Ok(child) => workers.push(child),
            Err(e) => {
                for mut child in workers {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                anyhow::bail!(
                    "failed to spawn worker local_rank {local_rank} ({}): {e}",
                    plan.program.to_string_lossy()
                );
            }
        }
    }
    tracing::info!(count = workers.len(), "all workers spawned");
    Ok(workers)
}

/// Wait for every worker and return the exit code for the launcher:
/// 0 when all succeeded, otherwise the first failing worker's code (1 when
/// it was killed by a signal or could not be waited on).
pub fn wait_for_workers(mut workers: Vec<Child>) -> i32 {
    let mut exit_code = 0;
    for (local_rank, child) in workers.iter_mut().enumerate() {
        match child.wait() {
            Ok(status) if status.success() => {
                tracing::debug!(local_rank, "worker exited cleanly");
            }
            Ok(status) => {
                tracing::warn!(local_rank, ?status, "worker exited with non-zero status");
                if exit_code == 0 {
                    exit_code = failure_code(status);
                }
            }
            Err(e) => {
                tracing::warn!(local_rank, error = %e, "error waiting for worker");
                if exit_code == 0 {
                    exit_code = 1;
                }
            }
        }
    }
    exit_code
}

fn failure_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(0) | None => 1,
        Some(code) => code,
    }
}
