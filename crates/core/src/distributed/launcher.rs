//! Launch context detection.
//!
//! The benchmark must run under a process launcher that starts one process
//! per device. The launcher communicates the layout through environment
//! variables:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `RANK` | global rank | 0 |
//! | `WORLD_SIZE` | number of processes; marks a launched session | 1 |
//! | `LOCAL_RANK` | device ordinal on this node | `RANK` |
//! | `LOCAL_SIZE` | processes on this node | `WORLD_SIZE` |
//! | `MASTER_ADDR` | address of the rank 0 rendezvous | `127.0.0.1` |
//! | `MASTER_PORT` | port of the rank 0 rendezvous | 29500 |
//!
//! `mpiexec` sessions are recognized through `OMPI_COMM_WORLD_RANK`,
//! `OMPI_COMM_WORLD_SIZE`, `OMPI_COMM_WORLD_LOCAL_RANK` and
//! `OMPI_COMM_WORLD_LOCAL_SIZE` when the variables above are absent.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use super::error::{DistributedError, Result};

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: u16 = 29500;
const DEFAULT_COLLECTIVE_TIMEOUT_SECS: u64 = 600;

/// Distributed configuration from the launcher environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedConfig {
    /// Global rank of this process.
    pub rank: usize,
    /// Total number of processes.
    pub world_size: usize,
    /// Local rank on this node.
    pub local_rank: usize,
    /// Number of processes on this node.
    pub local_size: usize,
    /// Master address for the rendezvous.
    pub master_addr: String,
    /// Master port for the rendezvous.
    pub master_port: u16,
    /// Whether a launcher started this process.
    pub launched: bool,
    /// Upper bound on a single blocking collective.
    pub collective_timeout: Duration,
}

impl DistributedConfig {
    /// Create from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Create from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| -> Option<(String, String)> {
            names
                .iter()
                .find_map(|name| lookup(name).map(|v| (name.to_string(), v)))
        };

        let launched = first(&["WORLD_SIZE", "OMPI_COMM_WORLD_SIZE"]).is_some();

        let rank = parse_var(first(&["RANK", "OMPI_COMM_WORLD_RANK"]))?.unwrap_or(0);
        let world_size =
            parse_var(first(&["WORLD_SIZE", "OMPI_COMM_WORLD_SIZE"]))?.unwrap_or(1);
        let local_rank =
            parse_var(first(&["LOCAL_RANK", "OMPI_COMM_WORLD_LOCAL_RANK"]))?.unwrap_or(rank);
        let local_size = parse_var(first(&["LOCAL_SIZE", "OMPI_COMM_WORLD_LOCAL_SIZE"]))?
            .unwrap_or(world_size);
        let master_addr = lookup("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());
        let master_port =
            parse_var(lookup("MASTER_PORT").map(|v| ("MASTER_PORT".to_string(), v)))?
                .unwrap_or(DEFAULT_MASTER_PORT);
        let timeout_secs = parse_var(
            lookup("MOE_COLLECTIVE_TIMEOUT_SECS")
                .map(|v| ("MOE_COLLECTIVE_TIMEOUT_SECS".to_string(), v)),
        )?
        .unwrap_or(DEFAULT_COLLECTIVE_TIMEOUT_SECS);

        if world_size == 0 {
            return Err(DistributedError::InvalidEnv {
                name: "WORLD_SIZE".to_string(),
                value: "0".to_string(),
            });
        }
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }

        Ok(Self {
            rank,
            world_size,
            local_rank,
            local_size,
            master_addr,
            master_port,
            launched,
            collective_timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Configuration of an unlaunched, single-process session.
    pub fn single_process() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
            local_size: 1,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
            launched: false,
            collective_timeout: Duration::from_secs(DEFAULT_COLLECTIVE_TIMEOUT_SECS),
        }
    }

    /// Address every rank connects to.
    pub fn rendezvous_addr(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }

    /// Address rank 0 binds the hub on.
    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.master_port)
    }

    /// Device ordinal for this rank.
    pub fn device_ordinal(&self) -> usize {
        self.local_rank
    }
}

fn parse_var<T: FromStr>(entry: Option<(String, String)>) -> Result<Option<T>> {
    match entry {
        None => Ok(None),
        Some((name, value)) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| DistributedError::InvalidEnv { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_not_launched() {
        let config = DistributedConfig::from_lookup(lookup(&[])).unwrap();
        assert!(!config.launched);
        assert_eq!(config.rank, 0);
        assert_eq!(config.world_size, 1);
        assert_eq!(config.local_rank, 0);
        assert_eq!(config.master_addr, "127.0.0.1");
        assert_eq!(config.master_port, 29500);
        assert_eq!(config, DistributedConfig::single_process());
    }

    #[test]
    fn torchrun_style_variables() {
        let config = DistributedConfig::from_lookup(lookup(&[
            ("RANK", "5"),
            ("WORLD_SIZE", "8"),
            ("LOCAL_RANK", "1"),
            ("LOCAL_SIZE", "4"),
            ("MASTER_ADDR", "10.0.0.2"),
            ("MASTER_PORT", "12345"),
        ]))
        .unwrap();
        assert!(config.launched);
        assert_eq!(config.world_size, 8);
        assert_eq!(config.rank, 5);
        assert_eq!(config.device_ordinal(), 1);
        assert_eq!(config.local_size, 4);
        assert_eq!(config.rendezvous_addr(), "10.0.0.2:12345");
        assert_eq!(config.bind_addr(), "0.0.0.0:12345");
    }

    #[test]
    fn single_process_launch_counts_as_launched() {
        let config = DistributedConfig::from_lookup(lookup(&[("WORLD_SIZE", "1")])).unwrap();
        assert!(config.launched);
        assert_eq!(config.world_size, 1);
    }

    #[test]
    fn mpi_variables_fallback() {
        let config = DistributedConfig::from_lookup(lookup(&[
            ("OMPI_COMM_WORLD_RANK", "3"),
            ("OMPI_COMM_WORLD_SIZE", "4"),
            ("OMPI_COMM_WORLD_LOCAL_RANK", "1"),
        ]))
        .unwrap();
        assert!(config.launched);
        assert_eq!(config.rank, 3);
        assert_eq!(config.world_size, 4);
        assert_eq!(config.local_rank, 1);
        assert_eq!(config.local_size, 4);
    }

    #[test]
    fn local_rank_defaults_to_rank() {
        let config =
            DistributedConfig::from_lookup(lookup(&[("RANK", "2"), ("WORLD_SIZE", "3")])).unwrap();
        assert_eq!(config.local_rank, 2);
    }

    #[test]
    fn unparsable_value_rejected() {
        let err = DistributedConfig::from_lookup(lookup(&[("WORLD_SIZE", "many")])).unwrap_err();
        match err {
            DistributedError::InvalidEnv { name, value } => {
                assert_eq!(name, "WORLD_SIZE");
                assert_eq!(value, "many");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rank_out_of_range_rejected() {
        let err = DistributedConfig::from_lookup(lookup(&[("RANK", "4"), ("WORLD_SIZE", "4")]))
            .unwrap_err();
        assert!(matches!(err, DistributedError::InvalidRank { .. }));
    }

    #[test]
    fn collective_timeout_override() {
        let config = DistributedConfig::from_lookup(lookup(&[
            ("WORLD_SIZE", "1"),
            ("MOE_COLLECTIVE_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.collective_timeout, Duration::from_secs(5));
    }
}
