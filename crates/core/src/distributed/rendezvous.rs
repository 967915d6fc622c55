//! Rendezvous hub that executes collectives for every rank.
//!
//! Rank 0 hosts the hub on a background thread. Each rank, rank 0 included,
//! opens one TCP connection, announces itself with `Hello`, and waits for
//! `Ready` once the whole world has joined. From then on every collective is
//! a `Request` keyed by `(group, seq)`: the hub buffers contributions until
//! the whole group has arrived, computes each member's result and answers.
//!
//! ```text
//!  rank 0 ─┐                      ┌─► rank 0
//!  rank 1 ─┼─► Request{g, seq} ──►│ pending[(g, seq)] ─► Response
//!  rank 2 ─┘                      └─► rank 2
//! ```

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::error::{DistributedError, Result};
use super::wire::{CollectiveKind, Frame, MAX_HANDSHAKE_LEN};

/// How long an accepted connection may take to send its `Hello`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type PendingKey = (Vec<usize>, u64);

struct Pending {
    kind: CollectiveKind,
    contributions: Vec<Option<Vec<f32>>>,
    arrived: usize,
    error: Option<String>,
}

impl Pending {
    fn new(kind: CollectiveKind, group_len: usize) -> Self {
        Self {
            kind,
            contributions: vec![None; group_len],
            arrived: 0,
            error: None,
        }
    }
}

#[derive(Default)]
struct HubState {
    pending: HashMap<PendingKey, Pending>,
    departed: HashSet<usize>,
}

struct Hub {
    writers: Vec<Mutex<TcpStream>>,
    state: Mutex<HubState>,
}

enum Outcome {
    Wait,
    Complete(Vec<usize>, std::result::Result<Vec<Vec<f32>>, String>),
    Fail(Vec<usize>, String),
}

impl Hub {
    fn lock_state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, rank: usize, frame: &Frame) {
        let mut writer = self.writers[rank]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = frame.write_to(&mut *writer) {
            tracing::warn!(rank, error = %e, "failed to answer rank");
        }
    }

    fn handle_request(
        &self,
        rank: usize,
        seq: u64,
        kind: CollectiveKind,
        group: Vec<usize>,
        payload: Vec<f32>,
    ) {
        let Some(position) = group.iter().position(|&r| r == rank) else {
            self.send(
                rank,
                &Frame::Error {
                    message: format!("rank {rank} is not a member of group {group:?}"),
                },
            );
            return;
        };

        let outcome = {
            let mut state = self.lock_state();
            let key = (group.clone(), seq);

            let gone = group
                .iter()
                .copied()
                .find(|r| state.departed.contains(r));
            if let Some(gone) = gone {
                let message = format!("rank {gone} left before collective {seq} on {group:?}");
                let mut notify = contributors(state.pending.remove(&key), &group);
                notify.push(rank);
                Outcome::Fail(notify, message)
            } else {
                let entry = state
                    .pending
                    .entry(key.clone())
                    .or_insert_with(|| Pending::new(kind, group.len()));

                if entry.kind != kind {
                    let expected = entry.kind;
                    entry.error.get_or_insert_with(|| {
                        format!(
                            "collective {seq} on {group:?}: rank {rank} issued {kind:?}, peers issued {expected:?}"
                        )
                    });
                }
                if entry.contributions[position].is_some() {
                    entry.error.get_or_insert_with(|| {
                        format!("rank {rank} submitted collective {seq} on {group:?} twice")
                    });
                } else {
                    entry.contributions[position] = Some(payload);
                    entry.arrived += 1;
                }

                let complete = entry.arrived == group.len();
                if complete {
                    match state.pending.remove(&key) {
                        Some(done) => {
                            let result = match done.error {
                                Some(message) => Err(message),
                                None => resolve_collective(
                                    done.kind,
                                    done.contributions.into_iter().flatten().collect(),
                                ),
                            };
                            Outcome::Complete(group.clone(), result)
                        }
                        None => Outcome::Wait,
                    }
                } else {
                    Outcome::Wait
                }
            }
        };

        match outcome {
            Outcome::Wait => {}
            Outcome::Complete(members, Ok(results)) => {
                for (member, payload) in members.into_iter().zip(results) {
                    self.send(member, &Frame::Response { payload });
                }
            }
            Outcome::Complete(members, Err(message)) | Outcome::Fail(members, message) => {
                tracing::warn!(%message, "collective failed");
                for member in members {
                    self.send(
                        member,
                        &Frame::Error {
                            message: message.clone(),
                        },
                    );
                }
            }
        }
    }

    /// Fail every pending collective that includes `rank`.
    fn mark_departed(&self, rank: usize) {
        let failed: Vec<(Vec<usize>, String)> = {
            let mut state = self.lock_state();
            state.departed.insert(rank);
            let keys: Vec<PendingKey> = state
                .pending
                .keys()
                .filter(|(group, _)| group.contains(&rank))
                .cloned()
                .collect();
            keys.into_iter()
                .map(|key| {
                    let message = format!("rank {rank} left during collective {} on {:?}", key.1, key.0);
                    let notify = contributors(state.pending.remove(&key), &key.0);
                    (notify, message)
                })
                .collect()
        };

        for (members, message) in failed {
            for member in members {
                self.send(
                    member,
                    &Frame::Error {
                        message: message.clone(),
                    },
                );
            }
        }
    }
}

fn contributors(pending: Option<Pending>, group: &[usize]) -> Vec<usize> {
    pending
        .map(|p| {
            group
                .iter()
                .zip(p.contributions.iter())
                .filter(|(_, c)| c.is_some())
                .map(|(&r, _)| r)
                .collect()
        })
        .unwrap_or_default()
}

/// Compute every member's result from the group's contributions (group order).
pub(crate) fn resolve_collective(
    kind: CollectiveKind,
    contributions: Vec<Vec<f32>>,
) -> std::result::Result<Vec<Vec<f32>>, String> {
    let n = contributions.len();
    let len = contributions.first().map(Vec::len).unwrap_or(0);
    if contributions.iter().any(|c| c.len() != len) {
        let lens: Vec<usize> = contributions.iter().map(Vec::len).collect();
        return Err(format!("{kind:?}: payload lengths differ across ranks: {lens:?}"));
    }

    match kind {
        CollectiveKind::Barrier => Ok(vec![Vec::new(); n]),
        CollectiveKind::AllReduce(op) => {
            let parts: Vec<&[f32]> = contributions.iter().map(Vec::as_slice).collect();
            Ok(vec![op.reduce(&parts); n])
        }
        CollectiveKind::AllToAll => {
            if len % n != 0 {
                return Err(format!(
                    "AllToAll: payload length {len} not divisible by group size {n}"
                ));
            }
            let chunk = len / n;
            Ok((0..n)
                .map(|member| {
                    let mut out = Vec::with_capacity(len);
                    for source in &contributions {
                        out.extend_from_slice(&source[member * chunk..(member + 1) * chunk]);
                    }
                    out
                })
                .collect())
        }
    }
}

/// Listening side of the rendezvous, hosted by global rank 0.
pub struct RendezvousServer {
    listener: TcpListener,
    world_size: usize,
    handshake_timeout: Duration,
}

impl RendezvousServer {
    /// Bind the hub socket. Binding happens before any rank connects so that
    /// connection retries on other ranks eventually succeed.
    pub fn bind<A: ToSocketAddrs>(addr: A, world_size: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            world_size,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the hub on a background thread until every rank has left.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("moe-rendezvous".to_string())
            .spawn(move || {
                if let Err(e) = self.serve() {
                    tracing::error!(error = %e, "rendezvous hub stopped");
                }
            })?;
        Ok(handle)
    }

    fn serve(self) -> Result<()> {
        let world_size = self.world_size;
        let mut streams: Vec<Option<TcpStream>> = (0..world_size).map(|_| None).collect();
        let mut joined = 0;

        tracing::debug!(world_size, "rendezvous waiting for ranks");

        while joined < world_size {
            let (mut stream, peer) = self.listener.accept()?;
            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(self.handshake_timeout))?;
            match Frame::read_limited(&mut stream, MAX_HANDSHAKE_LEN) {
                Ok(Frame::Hello {
                    rank,
                    world_size: claimed,
                }) => {
                    let rank = rank as usize;
                    let problem = if claimed as usize != world_size {
                        Some(format!(
                            "rank {rank} expects world size {claimed}, hub has {world_size}"
                        ))
                    } else if rank >= world_size {
                        Some(format!("rank {rank} out of range for world size {world_size}"))
                    } else if streams[rank].is_some() {
                        Some(format!("rank {rank} joined twice"))
                    } else {
                        None
                    };
                    match problem {
                        Some(message) => {
                            tracing::warn!(%peer, %message, "rejecting peer");
                            let _ = Frame::Error { message }.write_to(&mut stream);
                        }
                        None => {
                            tracing::trace!(%peer, rank, "rank joined");
                            stream.set_read_timeout(None)?;
                            streams[rank] = Some(stream);
                            joined += 1;
                        }
                    }
                }
                Ok(other) => {
                    tracing::warn!(%peer, frame = ?other, "expected Hello, dropping peer");
                }
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "failed to read Hello");
                }
            }
        }

        let streams: Vec<TcpStream> = streams.into_iter().flatten().collect();
        let mut readers = Vec::with_capacity(world_size);
        let mut writers = Vec::with_capacity(world_size);
        for stream in streams {
            readers.push(stream.try_clone()?);
            writers.push(Mutex::new(stream));
        }

        let hub = Arc::new(Hub {
            writers,
            state: Mutex::new(HubState::default()),
        });

        let mut handles = Vec::with_capacity(world_size);
        for (rank, reader) in readers.into_iter().enumerate() {
            let hub = Arc::clone(&hub);
            handles.push(
                thread::Builder::new()
                    .name(format!("moe-rendezvous-{rank}"))
                    .spawn(move || serve_peer(hub, rank, reader))?,
            );
        }

        for rank in 0..world_size {
            hub.send(rank, &Frame::Ready);
        }
        tracing::debug!(world_size, "all ranks joined rendezvous");

        for handle in handles {
            if handle.join().is_err() {
                return Err(DistributedError::Protocol(
                    "rendezvous peer thread panicked".to_string(),
                ));
            }
        }
        tracing::debug!("rendezvous hub finished");
        Ok(())
    }
}

fn serve_peer(hub: Arc<Hub>, rank: usize, mut reader: TcpStream) {
    loop {
        match Frame::read_from(&mut reader) {
            Ok(Frame::Request {
                seq,
                kind,
                group,
                payload,
            }) => {
                let group = group.into_iter().map(|r| r as usize).collect();
                hub.handle_request(rank, seq, kind, group, payload);
            }
            Ok(Frame::Goodbye) => {
                tracing::trace!(rank, "rank left rendezvous");
                break;
            }
            Ok(other) => {
                tracing::warn!(rank, frame = ?other, "unexpected frame from rank");
                break;
            }
            Err(e) => {
                tracing::warn!(rank, error = %e, "lost connection to rank");
                break;
            }
        }
    }
    hub.mark_departed(rank);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{ReduceOp, TcpTransport};
    use std::io::Write;

    #[test]
    fn resolve_all_reduce() {
        let out = resolve_collective(
            CollectiveKind::AllReduce(ReduceOp::Sum),
            vec![vec![1.0, 2.0], vec![10.0, 20.0], vec![100.0, 200.0]],
        )
        .unwrap();
        assert_eq!(out.len(), 3);
        for member in out {
            assert_eq!(member, vec![111.0, 222.0]);
        }
    }

    #[test]
    fn resolve_all_to_all_transposes_chunks() {
        // Member j sends [j0, j1] where chunk i is addressed to member i.
        let out = resolve_collective(
            CollectiveKind::AllToAll,
            vec![vec![0.0, 0.1, 1.0, 1.1], vec![10.0, 10.1, 11.0, 11.1]],
        )
        .unwrap();
        assert_eq!(out[0], vec![0.0, 0.1, 10.0, 10.1]);
        assert_eq!(out[1], vec![1.0, 1.1, 11.0, 11.1]);
    }

    #[test]
    fn resolve_rejects_ragged_payloads() {
        let err = resolve_collective(
            CollectiveKind::AllReduce(ReduceOp::Max),
            vec![vec![1.0], vec![1.0, 2.0]],
        )
        .unwrap_err();
        assert!(err.contains("payload lengths differ"));
    }

    #[test]
    fn resolve_rejects_indivisible_all_to_all() {
        let err =
            resolve_collective(CollectiveKind::AllToAll, vec![vec![1.0; 3], vec![2.0; 3]])
                .unwrap_err();
        assert!(err.contains("not divisible"));
    }

    #[test]
    fn resolve_barrier_returns_empty_payloads() {
        let out =
            resolve_collective(CollectiveKind::Barrier, vec![Vec::new(), Vec::new()]).unwrap();
        assert_eq!(out, vec![Vec::<f32>::new(), Vec::new()]);
    }

    #[test]
    fn stray_connections_do_not_block_rendezvous() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = RendezvousServer {
            listener,
            world_size: 1,
            handshake_timeout: Duration::from_millis(200),
        };
        let hub = server.spawn().unwrap();

        // One peer never speaks, the other announces an absurd frame length.
        let _silent = TcpStream::connect(&addr).unwrap();
        let mut oversized = TcpStream::connect(&addr).unwrap();
        oversized.write_all(&u64::MAX.to_le_bytes()).unwrap();

        let transport = TcpTransport::connect(&addr, 0, 1, 0, Duration::from_secs(30)).unwrap();
        assert_eq!(transport.world_size(), 1);
        drop(transport);
        hub.join().unwrap();
    }
}
