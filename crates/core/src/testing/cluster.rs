use std::sync::Arc;
use std::thread;
use std::time::Duration;

use candle_core::Device;

use crate::distributed::{
    DeviceCommunicator, GroupLayout, LocalCommunicator, LocalProcessGroup, ParallelEnv,
    RendezvousServer, TcpTransport,
};

/// Single-member communicator for layer-level tests.
pub fn local_communicator() -> Arc<dyn DeviceCommunicator> {
    Arc::new(LocalCommunicator::new(LocalProcessGroup::new()))
}

/// Run `f` once per rank on its own thread, each rank holding a CPU
/// [`ParallelEnv`] connected to a loopback hub. Results are returned in
/// rank order.
///
/// Results must not keep the environment's communicators alive, since the
/// hub only shuts down once every rank has disconnected.
///
/// Panics if any rank panics or fails to join.
pub fn run_cluster<T, F>(world_size: usize, group_count: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(ParallelEnv) -> T + Sync,
{
    let server = RendezvousServer::bind("127.0.0.1:0", world_size).expect("bind rendezvous");
    let addr = server.local_addr().expect("rendezvous address").to_string();
    let hub = server.spawn().expect("spawn rendezvous");

    let results = thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let addr = addr.as_str();
                let f = &f;
                scope.spawn(move || {
                    let transport = Arc::new(
                        TcpTransport::connect(addr, rank, world_size, rank, Duration::from_secs(60))
                            .expect("connect to rendezvous"),
                    );
                    let layout =
                        GroupLayout::new(world_size, group_count, rank).expect("group layout");
                    let env = ParallelEnv::from_transport(transport, layout, Device::Cpu)
                        .expect("parallel env");
                    f(env)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect::<Vec<_>>()
    });

    hub.join().expect("rendezvous thread panicked");
    results
}
