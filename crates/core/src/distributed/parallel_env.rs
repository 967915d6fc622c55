//! Data/model parallel environment for one SPMD process.
//!
//! Every process calls [`ParallelEnv::init`] at start-up. Rank 0 hosts the
//! rendezvous; all ranks join it and derive three communicators:
//!
//! - **global**: every rank, used for replicated (gate) gradients;
//! - **model**: the ranks that together hold every expert, used for the
//!   all-to-all token exchange;
//! - **data**: the ranks holding replicas of this rank's expert shard.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use candle_core::{Device, DeviceLocation};

use super::communicator::DeviceCommunicator;
use super::error::{DistributedError, Result};
use super::launcher::DistributedConfig;
use super::process_group::GroupLayout;
use super::rendezvous::RendezvousServer;
use super::transport::{GroupCommunicator, TcpTransport};

/// Parallel environment shared by the model and the training loop.
pub struct ParallelEnv {
    pub global_rank: usize,
    pub global_size: usize,
    pub local_rank: usize,
    pub group_count: usize,
    /// Index of this rank's model group.
    pub data_rank: usize,
    /// Position inside the model group.
    pub model_rank: usize,
    /// Number of ranks per model group.
    pub model_size: usize,
    /// Device selected for this rank.
    pub local_device: Device,
    /// Whether the session was started by a launcher.
    pub is_distributed: bool,
    pub global_group: Arc<dyn DeviceCommunicator>,
    pub model_group: Arc<dyn DeviceCommunicator>,
    pub data_group: Arc<dyn DeviceCommunicator>,
    transport: Arc<TcpTransport>,
    /// Rendezvous hub thread, on the rank that hosts it.
    hub: Option<JoinHandle<()>>,
}

impl ParallelEnv {
    /// Join the distributed session described by `config`.
    ///
    /// Fails with [`DistributedError::NotLaunched`] when no launcher started
    /// this process.
    pub fn init(config: &DistributedConfig, group_count: usize) -> Result<Self> {
        if !config.launched {
            return Err(DistributedError::NotLaunched);
        }
        let layout = GroupLayout::new(config.world_size, group_count, config.rank)?;

        let hub = if config.rank == 0 {
            let server = RendezvousServer::bind(config.bind_addr(), config.world_size)?;
            tracing::info!(
                addr = %server.local_addr()?,
                world_size = config.world_size,
                "rendezvous hub listening"
            );
            Some(server.spawn()?)
        } else {
            None
        };

        let transport = Arc::new(TcpTransport::connect(
            &config.rendezvous_addr(),
            config.rank,
            config.world_size,
            config.local_rank,
            config.collective_timeout,
        )?);

        let device = select_device(config.device_ordinal());
        let mut env = Self::from_transport(transport, layout, device)?;
        env.hub = hub;
        Ok(env)
    }

    /// Build the environment from an already connected transport.
    pub fn from_transport(
        transport: Arc<TcpTransport>,
        layout: GroupLayout,
        local_device: Device,
    ) -> Result<Self> {
        if transport.rank() != layout.global_rank || transport.world_size() != layout.global_size
        {
            return Err(DistributedError::InvalidRank {
                rank: transport.rank(),
                world_size: layout.global_size,
            });
        }

        let global_group: Arc<dyn DeviceCommunicator> = Arc::new(GroupCommunicator::new(
            Arc::clone(&transport),
            layout.global_group_ranks(),
        )?);
        let model_group: Arc<dyn DeviceCommunicator> = Arc::new(GroupCommunicator::new(
            Arc::clone(&transport),
            layout.model_group_ranks(),
        )?);
        let data_group: Arc<dyn DeviceCommunicator> = Arc::new(GroupCommunicator::new(
            Arc::clone(&transport),
            layout.data_group_ranks(),
        )?);

        tracing::info!(
            global_rank = layout.global_rank,
            global_size = layout.global_size,
            data_rank = layout.data_rank,
            model_rank = layout.model_rank,
            device = %DeviceLabel(&local_device),
            "parallel environment ready"
        );

        Ok(Self {
            global_rank: layout.global_rank,
            global_size: layout.global_size,
            local_rank: transport.local_rank(),
            group_count: layout.group_count,
            data_rank: layout.data_rank,
            model_rank: layout.model_rank,
            model_size: layout.model_size,
            local_device,
            is_distributed: true,
            global_group,
            model_group,
            data_group,
            transport,
            hub: None,
        })
    }

    /// Leave the session once every rank is done.
    ///
    /// Ranks meet at a global barrier and then disconnect. The rank hosting
    /// the hub returns only after the hub has answered every peer and seen
    /// it leave, so its process exit cannot cut off a reply in flight.
    pub fn shutdown(mut self) -> Result<()> {
        self.global_group.barrier()?;
        self.transport.leave()?;
        if let Some(hub) = self.hub.take() {
            hub.join().map_err(|_| {
                DistributedError::Protocol("rendezvous hub thread panicked".to_string())
            })?;
        }
        tracing::debug!(rank = self.global_rank, "left distributed session");
        Ok(())
    }

    /// Whether this process prints benchmark output.
    pub fn is_coordinator(&self) -> bool {
        self.global_rank == 0
    }

    /// Print on global rank 0 only.
    pub fn dist_print(&self, msg: impl fmt::Display) {
        if self.is_coordinator() {
            println!("{msg}");
        }
    }
}

/// CUDA device `ordinal` when available, CPU otherwise.
pub fn select_device(ordinal: usize) -> Device {
    match Device::cuda_if_available(ordinal) {
        Ok(device) => device,
        Err(e) => {
            tracing::warn!(ordinal, error = %e, "CUDA device unavailable, using CPU");
            Device::Cpu
        }
    }
}

/// Short `cpu` / `cuda:N` rendering of a device.
pub struct DeviceLabel<'a>(pub &'a Device);

impl fmt::Display for DeviceLabel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.location() {
            DeviceLocation::Cpu => write!(f, "cpu"),
            DeviceLocation::Cuda { gpu_id } => write!(f, "cuda:{gpu_id}"),
            DeviceLocation::Metal { gpu_id } => write!(f, "metal:{gpu_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_requires_launcher() {
        let config = DistributedConfig::single_process();
        let err = ParallelEnv::init(&config, 1).err().unwrap();
        assert!(matches!(err, DistributedError::NotLaunched));
        assert!(err.to_string().contains("not launched in distributed mode"));
    }

    #[test]
    fn init_rejects_uneven_groups_before_networking() {
        let mut config = DistributedConfig::single_process();
        config.launched = true;
        config.world_size = 3;
        let err = ParallelEnv::init(&config, 2).err().unwrap();
        assert!(matches!(err, DistributedError::UnevenGroups { .. }));
    }

    #[test]
    fn cpu_device_label() {
        assert_eq!(DeviceLabel(&Device::Cpu).to_string(), "cpu");
    }
}
